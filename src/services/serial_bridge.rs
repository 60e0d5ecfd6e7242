//! Serial bridge - sensor board lines to hub events
//!
//! Runs as its own task: connect (or auto-discover), then read lines, decode
//! and publish until shutdown. Every failure here is local to the serial
//! source; the rest of the process keeps running.

use crate::domain::PoleMapping;
use crate::infra::metrics::Metrics;
use crate::infra::shutdown::{self, ShutdownRx};
use crate::io::protocol::{DecodeError, ProtocolDecoder};
use crate::io::serial::{LineReader, SerialConnection, SerialError, SerialSettings};
use crate::services::hub::EventDispatchHub;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};

/// Why the read loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    Shutdown,
    RetryBudgetExhausted,
}

pub struct SerialBridge {
    settings: SerialSettings,
    decoder: ProtocolDecoder,
    hub: Arc<EventDispatchHub>,
    metrics: Arc<Metrics>,
}

impl SerialBridge {
    pub fn new(
        settings: SerialSettings,
        poles: PoleMapping,
        hub: Arc<EventDispatchHub>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { settings, decoder: ProtocolDecoder::new(poles), hub, metrics }
    }

    /// Connect and pump lines until shutdown or the source gives up
    pub async fn run(self, mut shutdown: ShutdownRx) {
        info!(
            port = %self.settings.port.as_deref().unwrap_or("auto"),
            baud = %self.settings.baud,
            "serial_bridge_started"
        );

        let connect = || SerialConnection::connect(&self.settings);
        let Some(connection) = self.open_with_retry(&mut shutdown, connect).await else {
            return;
        };

        info!(port = %connection.port(), "serial_bridge_connected");
        let mut lines = connection.into_lines();

        match self.pump(&mut lines, &mut shutdown).await {
            PumpExit::Shutdown => info!("serial_bridge_shutdown"),
            PumpExit::RetryBudgetExhausted => {
                warn!(budget = %self.settings.retry_budget, "serial_retry_budget_exhausted_source_disabled")
            }
        }
    }

    /// Call `connect` until it succeeds.
    ///
    /// `NoDeviceFound` disables the source at once. Other failures back off
    /// and retry; more than `retry_budget` of them disable the source.
    /// Returns `None` when the source is disabled or shutdown arrives.
    async fn open_with_retry<C, F, Fut>(&self, shutdown: &mut ShutdownRx, mut connect: F) -> Option<C>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<C, SerialError>>,
    {
        let mut open_failures = 0u32;
        loop {
            let result = tokio::select! {
                _ = shutdown::signalled(shutdown) => {
                    info!("serial_bridge_shutdown");
                    return None;
                }
                result = connect() => result,
            };

            match result {
                Ok(connection) => return Some(connection),
                Err(SerialError::NoDeviceFound { signatures }) => {
                    warn!(signatures = ?signatures, "serial_device_not_found_source_disabled");
                    return None;
                }
                Err(e) => {
                    open_failures += 1;
                    error!(error = %e, attempt = %open_failures, "serial_connect_failed");
                    if open_failures > self.settings.retry_budget {
                        warn!(attempts = %open_failures, "serial_retry_budget_exhausted_source_disabled");
                        return None;
                    }
                    if !self.backoff(shutdown).await {
                        info!("serial_bridge_shutdown");
                        return None;
                    }
                }
            }
        }
    }

    /// Read, decode and publish lines from an open connection.
    ///
    /// Timeouts are ignored. `Disconnected` is retried on the same reader after
    /// the backoff; more than `retry_budget` consecutive failures end the loop.
    pub async fn pump<R>(&self, lines: &mut LineReader<R>, shutdown: &mut ShutdownRx) -> PumpExit
    where
        R: AsyncRead + Unpin,
    {
        let mut failures = 0u32;

        loop {
            let result = tokio::select! {
                _ = shutdown::signalled(shutdown) => return PumpExit::Shutdown,
                result = lines.read_line() => result,
            };

            match result {
                Ok(line) => {
                    failures = 0;
                    self.handle_line(&line);
                }
                Err(SerialError::ReadTimeout) => {}
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures = %failures, "serial_read_failed");
                    if failures > self.settings.retry_budget {
                        return PumpExit::RetryBudgetExhausted;
                    }
                    if !self.backoff(shutdown).await {
                        return PumpExit::Shutdown;
                    }
                }
            }
        }
    }

    /// Decode one line and publish its events. Returns the number published.
    pub fn handle_line(&self, line: &str) -> usize {
        if line.is_empty() {
            return 0;
        }
        self.metrics.record_serial_line();

        match self.decoder.decode(line) {
            Ok(events) => {
                self.metrics.record_serial_events(events.len() as u64);
                let count = events.len();
                for event in events {
                    debug!(event = %event.name(), "serial_event");
                    self.hub.publish(event);
                }
                count
            }
            Err(DecodeError::UnknownPoleIndex { index }) => {
                warn!(index = %index, line = %line, "serial_unknown_pole_index");
                0
            }
            Err(e @ DecodeError::MalformedLine { .. }) => {
                self.metrics.record_malformed_line();
                warn!(error = %e, "serial_malformed_line");
                0
            }
        }
    }

    /// Sleep the retry backoff. Returns false if shutdown arrived first.
    async fn backoff(&self, shutdown: &mut ShutdownRx) -> bool {
        backoff_for(self.settings.retry_backoff, shutdown).await
    }
}

async fn backoff_for(delay: Duration, shutdown: &mut ShutdownRx) -> bool {
    tokio::select! {
        _ = shutdown::signalled(shutdown) => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainEvent, PoleState};
    use std::collections::VecDeque;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};
    use tokio::sync::watch;

    /// Replays chunks and read errors, then reports end of stream
    struct ScriptedPort {
        script: VecDeque<io::Result<&'static [u8]>>,
    }

    impl ScriptedPort {
        fn new(script: Vec<io::Result<&'static [u8]>>) -> Self {
            Self { script: script.into() }
        }
    }

    impl AsyncRead for ScriptedPort {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.script.pop_front() {
                Some(Ok(bytes)) => {
                    buf.put_slice(bytes);
                    Poll::Ready(Ok(()))
                }
                Some(Err(e)) => Poll::Ready(Err(e)),
                None => Poll::Ready(Ok(())),
            }
        }
    }

    fn unplugged() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")
    }

    fn settings(retry_budget: u32) -> SerialSettings {
        SerialSettings {
            port: Some("/dev/null-test".to_string()),
            baud: 115_200,
            warmup: Duration::ZERO,
            read_timeout: Duration::from_millis(50),
            retry_backoff: Duration::from_millis(1),
            retry_budget,
            chip_signatures: vec!["USB".to_string()],
        }
    }

    fn bridge(retry_budget: u32) -> (SerialBridge, Arc<EventDispatchHub>, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let hub = Arc::new(EventDispatchHub::new(64, None, metrics.clone()));
        let bridge =
            SerialBridge::new(settings(retry_budget), PoleMapping::default(), hub.clone(), metrics.clone());
        (bridge, hub, metrics)
    }

    #[test]
    fn test_handle_line_publishes_decoded_events() {
        let (bridge, hub, metrics) = bridge(5);
        let mut sub = hub.register();

        assert_eq!(bridge.handle_line("Temperature: 24.5 Humidity: 51.0"), 1);
        assert_eq!(bridge.handle_line("POLE:RESET"), 3);

        let first = sub.try_recv().unwrap();
        assert_eq!(first.event, DomainEvent::Temperature { celsius: 24.5, humidity_pct: 51.0 });
        for id in ["P-01", "P-02", "P-03"] {
            assert_eq!(sub.try_recv().unwrap().event, DomainEvent::pole(id, PoleState::Ok));
        }

        let summary = metrics.report();
        assert_eq!(summary.serial_lines, 2);
        assert_eq!(summary.serial_events, 4);
    }

    #[test]
    fn test_bad_lines_are_counted_not_published() {
        let (bridge, hub, metrics) = bridge(5);
        let mut sub = hub.register();

        assert_eq!(bridge.handle_line("POLE_BREAK:9"), 0);
        assert_eq!(bridge.handle_line("POLE_OK:abc"), 0);
        assert_eq!(bridge.handle_line(""), 0);

        assert!(sub.try_recv().is_none());
        assert_eq!(metrics.report().malformed_lines, 1);
    }

    #[tokio::test]
    async fn test_pump_publishes_until_budget_exhausted() {
        let (bridge, hub, _metrics) = bridge(2);
        let mut sub = hub.register();
        let (_tx, mut shutdown) = watch::channel(false);

        let (mut device, host) = tokio::io::duplex(256);
        let mut lines = LineReader::new(host, Duration::from_millis(50));
        device.write_all(b"POLE_BREAK:1\nhello board\n").await.unwrap();
        drop(device);

        let exit = bridge.pump(&mut lines, &mut shutdown).await;

        assert_eq!(exit, PumpExit::RetryBudgetExhausted);
        assert_eq!(sub.try_recv().unwrap().event, DomainEvent::pole("P-02", PoleState::Broken));
        assert_eq!(
            sub.try_recv().unwrap().event,
            DomainEvent::Log { message: "hello board".to_string() }
        );
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_pump_stops_on_shutdown() {
        let (bridge, _hub, _metrics) = bridge(5);
        let (tx, mut shutdown) = watch::channel(false);

        // Device stays open but silent, so reads only time out
        let (_device, host) = tokio::io::duplex(64);
        let mut lines = LineReader::new(host, Duration::from_millis(10));

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
            tx
        });

        assert_eq!(bridge.pump(&mut lines, &mut shutdown).await, PumpExit::Shutdown);
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn test_backoff_interrupted_by_shutdown() {
        let (tx, mut shutdown) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(!backoff_for(Duration::from_secs(60), &mut shutdown).await);
    }

    #[tokio::test]
    async fn test_good_line_resets_failure_count() {
        let (bridge, hub, _metrics) = bridge(1);
        let mut sub = hub.register();
        let (_tx, mut shutdown) = watch::channel(false);

        // Each failure is followed by a good line, so the budget of 1 is never exceeded
        let port = ScriptedPort::new(vec![
            Err(unplugged()),
            Ok(b"first\n"),
            Err(unplugged()),
            Ok(b"second\n"),
        ]);
        let mut lines = LineReader::new(port, Duration::from_millis(50));

        let exit = tokio::time::timeout(Duration::from_secs(1), bridge.pump(&mut lines, &mut shutdown))
            .await
            .unwrap();

        assert_eq!(exit, PumpExit::RetryBudgetExhausted);
        assert_eq!(sub.try_recv().unwrap().event, DomainEvent::Log { message: "first".to_string() });
        assert_eq!(sub.try_recv().unwrap().event, DomainEvent::Log { message: "second".to_string() });
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_no_device_found_disables_without_retry() {
        let (bridge, _hub, _metrics) = bridge(5);
        let (_tx, mut shutdown) = watch::channel(false);
        let attempts = AtomicU32::new(0);

        let connection: Option<()> = bridge
            .open_with_retry(&mut shutdown, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(SerialError::NoDeviceFound { signatures: vec!["CH340".to_string()] }) }
            })
            .await;

        assert!(connection.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_failures_exhaust_retry_budget() {
        let (bridge, _hub, _metrics) = bridge(2);
        let (_tx, mut shutdown) = watch::channel(false);
        let attempts = AtomicU32::new(0);

        let connection: Option<()> = bridge
            .open_with_retry(&mut shutdown, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(SerialError::Disconnected("busy".to_string())) }
            })
            .await;

        assert!(connection.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_open_succeeds_after_failures() {
        let (bridge, _hub, _metrics) = bridge(2);
        let (_tx, mut shutdown) = watch::channel(false);
        let attempts = AtomicU32::new(0);

        let connection = bridge
            .open_with_retry(&mut shutdown, || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt < 3 {
                        Err(SerialError::Disconnected("busy".to_string()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(connection, Some(3));
    }

    #[tokio::test]
    async fn test_run_gives_up_on_missing_port() {
        let (bridge, _hub, _metrics) = bridge(2);
        let bridge = SerialBridge {
            settings: SerialSettings { port: Some("/dev/does-not-exist".to_string()), ..settings(2) },
            ..bridge
        };
        let (_tx, shutdown) = watch::channel(false);

        tokio::time::timeout(Duration::from_secs(2), bridge.run(shutdown)).await.unwrap();
    }
}
