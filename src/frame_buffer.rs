//! Latest-frame handoff between one capture loop and many HTTP clients
//!
//! The buffer is a single slot: publishing overwrites whatever was there and
//! wakes every waiting reader. Readers that fall behind skip straight to the
//! newest frame instead of queueing, so a slow client never holds up the
//! writer or the other clients.

use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::debug;

/// One encoded JPEG frame
///
/// `seq` starts at 1 and increases by one with every publish on the owning
/// buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub data: Bytes,
}

/// Statistics for monitoring frame distribution
#[derive(Debug, Clone)]
pub struct FrameStats {
    pub frames_published: u64,
    pub subscribers: usize,
}

/// Single-writer, many-reader frame slot
pub struct FrameBuffer {
    tx: watch::Sender<Option<Frame>>,
    frames_published: AtomicU64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            frames_published: AtomicU64::new(0),
        }
    }

    /// Replace the stored frame and wake all waiters
    ///
    /// Never blocks on readers. Returns the sequence number given to the frame.
    pub fn publish(&self, data: Bytes) -> u64 {
        let seq = self.frames_published.fetch_add(1, Ordering::AcqRel) + 1;
        self.tx.send_replace(Some(Frame { seq, data }));
        seq
    }

    /// Most recently published frame, if any
    pub fn latest(&self) -> Option<Frame> {
        self.tx.borrow().clone()
    }

    /// Wait for a publish that happens after this call, then return that frame
    ///
    /// Blocks indefinitely if nothing is ever published.
    pub async fn await_next(&self) -> Option<Frame> {
        let mut rx = self.subscribe("snapshot");
        rx.next().await
    }

    /// Register a reader that will see frames published from now on
    pub fn subscribe(&self, client_id: impl Into<String>) -> FrameReceiver {
        let client_id = client_id.into();
        // Read the count first: anything published from here on is newer than
        // `last_seq`, even if it lands before the receiver exists.
        let last_seq = self.frames_published.load(Ordering::Acquire);
        let rx = self.tx.subscribe();
        debug!(
            client = %client_id,
            subscribers = self.subscriber_count(),
            "Frame subscriber added"
        );
        FrameReceiver::new(rx, client_id, last_seq)
    }

    /// Get current number of active readers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            frames_published: self.frames_published.load(Ordering::Acquire),
            subscribers: self.subscriber_count(),
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-client view of a [`FrameBuffer`]
///
/// Yields frames in publish order, skipping any that were overwritten before
/// this client got to them.
pub struct FrameReceiver {
    rx: watch::Receiver<Option<Frame>>,
    last_seq: u64,
    frames_received: u64,
    frames_skipped: u64,
    client_id: String,
}

impl FrameReceiver {
    fn new(rx: watch::Receiver<Option<Frame>>, client_id: String, last_seq: u64) -> Self {
        Self {
            rx,
            last_seq,
            frames_received: 0,
            frames_skipped: 0,
            client_id,
        }
    }

    /// Wait for the next frame newer than the last one returned
    ///
    /// Returns `None` once the buffer has been dropped.
    pub async fn next(&mut self) -> Option<Frame> {
        loop {
            // Reading and marking seen happen under one lock, so a publish
            // after this point always wakes `changed`.
            let newer = match self.rx.borrow_and_update().as_ref() {
                Some(frame) if frame.seq > self.last_seq => Some(frame.clone()),
                _ => None,
            };

            if let Some(frame) = newer {
                self.frames_skipped += frame.seq - self.last_seq - 1;
                self.frames_received += 1;
                self.last_seq = frame.seq;
                return Some(frame);
            }

            self.rx.changed().await.ok()?;
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            frames_received: self.frames_received,
            frames_skipped: self.frames_skipped,
            client_id: self.client_id.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReceiverStats {
    pub frames_received: u64,
    pub frames_skipped: u64,
    pub client_id: String,
}
