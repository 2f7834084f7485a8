//! The session's single ordered outbound queue (§4.7, §5).
//!
//! Exactly one writer task drains this per session. Control envelopes
//! (JSON) are never dropped; audio frames are degradable — once the
//! queue holds `capacity` audio frames, pushing another evicts the
//! oldest audio frame already queued rather than blocking the caller or
//! growing unbounded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::sync::Mutex;
use tracing::warn;

use crate::protocol::ServerEnvelope;

/// After this many consecutive audio-frame drops, the kernel treats the
/// session as congested and cancels the active pipeline (§9).
pub const CONGESTION_DROP_THRESHOLD: u32 = 5;

#[derive(Debug)]
pub enum OutboundItem {
    Control(ServerEnvelope),
    Audio(Vec<u8>),
}

struct Inner {
    items: VecDeque<OutboundItem>,
    audio_count: usize,
    capacity: usize,
}

/// Shared between the kernel (producer), pipeline tasks (producer), and
/// the writer task (sole consumer).
pub struct OutboundQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    consecutive_drops: AtomicU32,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner { items: VecDeque::new(), audio_count: 0, capacity }),
            notify: Notify::new(),
            consecutive_drops: AtomicU32::new(0),
        }
    }

    /// Control envelopes are never dropped (§4.7).
    pub async fn push_control(&self, envelope: ServerEnvelope) {
        let mut inner = self.inner.lock().await;
        inner.items.push_back(OutboundItem::Control(envelope));
        drop(inner);
        self.consecutive_drops.store(0, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Pushes one Opus frame. Returns `true` if sustained drops have
    /// crossed the congestion threshold (§9) and the caller should cancel
    /// the active pipeline.
    pub async fn push_audio(&self, frame: Vec<u8>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.audio_count >= inner.capacity {
            if let Some(pos) = inner.items.iter().position(|i| matches!(i, OutboundItem::Audio(_))) {
                inner.items.remove(pos);
                inner.audio_count -= 1;
            }
            drop(inner);
            let drops = self.consecutive_drops.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(drops, "outbound queue full, dropped oldest audio frame");
            let congested = drops >= CONGESTION_DROP_THRESHOLD;
            let mut inner = self.inner.lock().await;
            inner.items.push_back(OutboundItem::Audio(frame));
            inner.audio_count += 1;
            drop(inner);
            self.notify.notify_one();
            congested
        } else {
            inner.items.push_back(OutboundItem::Audio(frame));
            inner.audio_count += 1;
            drop(inner);
            self.consecutive_drops.store(0, Ordering::SeqCst);
            self.notify.notify_one();
            false
        }
    }

    /// Pops the next item in FIFO order, waiting if the queue is empty.
    /// Returns `None` once the queue has been closed.
    pub async fn pop(&self) -> Option<OutboundItem> {
        loop {
            let mut inner = self.inner.lock().await;
            if let Some(item) = inner.items.pop_front() {
                if matches!(item, OutboundItem::Audio(_)) {
                    inner.audio_count -= 1;
                }
                return Some(item);
            }
            drop(inner);
            self.notify.notified().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.items.len()
    }
}

/// Session-owned sender that turns an `Arc<OutboundQueue>` into
/// something cheap to clone and hand to pipeline subtasks.
#[derive(Clone)]
pub struct OutboundSender(pub Arc<OutboundQueue>);

impl OutboundSender {
    pub async fn control(&self, envelope: ServerEnvelope) {
        self.0.push_control(envelope).await;
    }

    pub async fn audio(&self, frame: Vec<u8>) -> bool {
        self.0.push_audio(frame).await
    }
}
