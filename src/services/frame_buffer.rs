//! Latest-value broadcast slot for encoded camera frames
//!
//! Backed by a `watch` channel: the writer replaces the slot without waiting
//! on readers, and each reader clones the whole `Frame` (a refcounted
//! `Bytes`), so a read never observes a partially written frame. Frames a
//! reader misses are gone; only the newest one matters.

use bytes::Bytes;
use tokio::sync::watch;

/// One encoded frame (JPEG) as published by the camera loop
#[derive(Debug, Clone)]
pub struct Frame {
    /// Publish sequence, starting at 1 and strictly increasing
    pub seq: u64,
    pub jpeg: Bytes,
}

pub struct FrameBroadcastBuffer {
    tx: watch::Sender<Option<Frame>>,
}

impl Default for FrameBroadcastBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBroadcastBuffer {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Replace the current frame. Never blocks and never queues.
    ///
    /// Returns the sequence number assigned to the frame.
    pub fn publish(&self, jpeg: Bytes) -> u64 {
        let mut seq = 0;
        self.tx.send_modify(|slot| {
            seq = slot.as_ref().map_or(1, |frame| frame.seq + 1);
            *slot = Some(Frame { seq, jpeg });
        });
        seq
    }

    /// Latest frame, or `None` before the first publish
    pub fn snapshot(&self) -> Option<Frame> {
        self.tx.borrow().clone()
    }

    /// Independent reader that can also wait for the next publish
    pub fn subscribe(&self) -> FrameReader {
        FrameReader { rx: self.tx.subscribe() }
    }
}

/// Per-consumer view of the frame slot
pub struct FrameReader {
    rx: watch::Receiver<Option<Frame>>,
}

impl FrameReader {
    /// Latest frame, marking it as seen
    pub fn latest(&mut self) -> Option<Frame> {
        self.rx.borrow_and_update().clone()
    }

    /// Wait until a frame newer than the last one seen is published.
    ///
    /// Returns `None` once the buffer has been dropped.
    pub async fn next(&mut self) -> Option<Frame> {
        self.rx.changed().await.ok()?;
        self.latest()
    }
}
