//! HTTP surface of the bridge
//!
//! One hyper HTTP/1 server with upgrades enabled:
//! - `GET /video_feed` - MJPEG stream (`multipart/x-mixed-replace; boundary=frame`)
//! - `GET /events` - WebSocket upgrade, one hub subscription per socket
//! - `GET /health` - liveness probe
//! - `GET /metrics` - Prometheus text format
//!
//! Concurrent connections are capped with a semaphore; excess connections are
//! closed right after accept.

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::infra::shutdown::{self, ShutdownRx};
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::frame_buffer::FrameBroadcastBuffer;
use crate::services::hub::EventDispatchHub;
use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame as BodyFrame, Incoming};
use hyper::header::{self, HeaderMap};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub const MJPEG_BOUNDARY: &str = "frame";
pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

type ResponseBody = UnsyncBoxBody<Bytes, Infallible>;

/// Connection-limit permit; an upgraded WebSocket takes it along so the
/// socket keeps counting against the limit after HTTP hands it off
type ConnectionSlot = Arc<Mutex<Option<OwnedSemaphorePermit>>>;

/// Shared by every connection
struct AppState {
    frames: Arc<FrameBroadcastBuffer>,
    hub: Arc<EventDispatchHub>,
    metrics: Arc<Metrics>,
    stream_interval: Duration,
    shutdown: ShutdownRx,
}

pub struct HttpServer {
    bind_address: String,
    port: u16,
    max_connections: usize,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(
        config: &Config,
        frames: Arc<FrameBroadcastBuffer>,
        hub: Arc<EventDispatchHub>,
        metrics: Arc<Metrics>,
        shutdown: ShutdownRx,
    ) -> Self {
        Self {
            bind_address: config.bind_address().to_string(),
            port: config.server_port(),
            max_connections: config.max_connections().max(1),
            state: Arc::new(AppState {
                frames,
                hub,
                metrics,
                stream_interval: config.stream_interval(),
                shutdown,
            }),
        }
    }

    /// Bind the listener and return the actual local address (port 0 allowed)
    pub async fn bind(&self) -> std::io::Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind((self.bind_address.as_str(), self.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, max_connections = %self.max_connections, "http_server_bound");
        Ok((listener, local_addr))
    }

    /// Bind and serve until shutdown
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (listener, _addr) = self.bind().await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accept loop on a pre-bound listener
    pub async fn serve(&self, listener: TcpListener) {
        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        let mut shutdown = self.state.shutdown.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                                warn!(peer = %peer, max = %self.max_connections, "http_connection_limit_reached");
                                drop(stream);
                                continue;
                            };
                            debug!(peer = %peer, "http_connection_accepted");

                            let io = TokioIo::new(stream);
                            let state = self.state.clone();
                            let slot: ConnectionSlot = Arc::new(Mutex::new(Some(permit)));
                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let state = state.clone();
                                    let slot = slot.clone();
                                    async move { route(req, state, slot).await }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .with_upgrades()
                                    .await
                                {
                                    debug!(peer = %peer, error = %e, "http_connection_error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "http_accept_error");
                        }
                    }
                }
                _ = shutdown::signalled(&mut shutdown) => {
                    info!("http_server_shutdown");
                    return;
                }
            }
        }
    }
}

fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into()).boxed_unsync()
}

fn text_response(status: StatusCode, body: &'static str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(full(body))
        .expect("static response should not fail")
}

async fn route(
    req: Request<Incoming>,
    state: Arc<AppState>,
    slot: ConnectionSlot,
) -> Result<Response<ResponseBody>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/video_feed") => video_feed(&state),
        (&Method::GET, "/events") => events(req, &state, &slot),
        (&Method::GET, "/health") => text_response(StatusCode::OK, "ok"),
        (&Method::GET, "/metrics") => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
            .body(full(format_prometheus_metrics(&state.metrics)))
            .expect("static response should not fail"),
        _ => text_response(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

// ---------------------------------------------------------------------------
// MJPEG stream
// ---------------------------------------------------------------------------

/// One multipart part wrapping a JPEG
pub fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let header = format!("--{MJPEG_BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = BytesMut::with_capacity(header.len() + jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Keeps the viewer gauge accurate however the stream ends
struct ViewerGuard {
    metrics: Arc<Metrics>,
}

impl ViewerGuard {
    fn open(metrics: Arc<Metrics>) -> Self {
        metrics.stream_viewer_opened();
        Self { metrics }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.metrics.stream_viewer_closed();
        debug!("stream_viewer_closed");
    }
}

struct ViewerState {
    frames: Arc<FrameBroadcastBuffer>,
    ticker: Interval,
    shutdown: ShutdownRx,
    _guard: ViewerGuard,
}

/// Next part for one viewer: the latest frame each tick, nothing before the
/// first frame exists. Ends on shutdown; hyper drops it when the peer leaves.
async fn next_part(mut viewer: ViewerState) -> Option<(Result<BodyFrame<Bytes>, Infallible>, ViewerState)> {
    loop {
        tokio::select! {
            _ = shutdown::signalled(&mut viewer.shutdown) => return None,
            _ = viewer.ticker.tick() => {}
        }

        if let Some(frame) = viewer.frames.snapshot() {
            let part = mjpeg_part(&frame.jpeg);
            return Some((Ok(BodyFrame::data(part)), viewer));
        }
    }
}

fn video_feed(state: &AppState) -> Response<ResponseBody> {
    let mut ticker = interval(state.stream_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let viewer = ViewerState {
        frames: state.frames.clone(),
        ticker,
        shutdown: state.shutdown.clone(),
        _guard: ViewerGuard::open(state.metrics.clone()),
    };
    debug!("stream_viewer_opened");

    let body = StreamBody::new(futures_util::stream::unfold(viewer, next_part)).boxed_unsync();

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache, no-store")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)
        .expect("static response should not fail")
}

// ---------------------------------------------------------------------------
// Live event channel
// ---------------------------------------------------------------------------

fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    header_has_token(headers, header::CONNECTION, "upgrade")
        && header_has_token(headers, header::UPGRADE, "websocket")
}

fn events(mut req: Request<Incoming>, state: &AppState, slot: &ConnectionSlot) -> Response<ResponseBody> {
    if !is_websocket_upgrade(req.headers()) {
        return text_response(StatusCode::BAD_REQUEST, "expected websocket upgrade");
    }
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY) else {
        return text_response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key");
    };
    let accept = derive_accept_key(key.as_bytes());

    let on_upgrade = hyper::upgrade::on(&mut req);
    let hub = state.hub.clone();
    let shutdown = state.shutdown.clone();
    let permit = slot.lock().take();
    tokio::spawn(async move {
        let _permit = permit;
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                serve_subscriber(ws, hub, shutdown).await;
            }
            Err(e) => warn!(error = %e, "websocket_upgrade_failed"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(full(Bytes::new()))
        .expect("static response should not fail")
}

/// Pump hub messages to one socket until either side goes away
async fn serve_subscriber(
    ws: WebSocketStream<TokioIo<Upgraded>>,
    hub: Arc<EventDispatchHub>,
    mut shutdown: ShutdownRx,
) {
    let mut subscription = hub.register();
    let id = subscription.id();
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            _ = shutdown::signalled(&mut shutdown) => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
            message = subscription.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = ws_tx.send(Message::Text(message.json.clone())).await {
                    debug!(subscriber = %id, error = %e, "websocket_send_failed");
                    break;
                }
            }
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    // Pings are answered by tungstenite; client text is ignored
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(subscriber = %id, error = %e, "websocket_read_failed");
                        break;
                    }
                }
            }
        }
    }

    hub.unregister(id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_mjpeg_part_layout() {
        let part = mjpeg_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        let mut expected = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        expected.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xD9]);
        expected.extend_from_slice(b"\r\n");
        assert_eq!(&part[..], &expected[..]);
    }

    #[test]
    fn test_websocket_upgrade_detection() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));

        assert!(!is_websocket_upgrade(&HeaderMap::new()));
    }
}
