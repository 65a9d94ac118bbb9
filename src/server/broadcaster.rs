//! Non-blocking alert fan-out to live subscribers
//!
//! Each subscriber gets its own bounded channel. Publishing never waits:
//! when a subscriber's buffer is full the alert is dropped for that
//! subscriber only, with a counter and a log line. Persistence happens
//! before publishing, so a dropped broadcast loses a live update, never
//! data.

use crate::server::storage::StoredAlert;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default per-subscriber buffer capacity
pub const DEFAULT_BUFFER: usize = 64;

/// Handle for removing a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Fan-out hub for freshly ingested alerts
pub struct Broadcaster {
    subs: Mutex<HashMap<u64, mpsc::Sender<Arc<StoredAlert>>>>,
    next_id: AtomicU64,
    buffer: usize,
    dropped: AtomicU64,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            subs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer,
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber and return its alert stream
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<Arc<StoredAlert>>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().unwrap().insert(id, tx);
        debug!(subscriber = id, "broadcast subscriber added");
        (SubscriberId(id), rx)
    }

    /// Remove a subscriber; its receiver sees a closed channel
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.subs.lock().unwrap().remove(&id.0).is_some() {
            debug!(subscriber = id.0, "broadcast subscriber removed");
        }
    }

    /// Deliver an alert to every subscriber without blocking. Subscribers
    /// whose receiver is gone are pruned as a side effect.
    pub fn publish(&self, alert: Arc<StoredAlert>) {
        let mut subs = self.subs.lock().unwrap();
        let mut gone = Vec::new();

        for (id, tx) in subs.iter() {
            match tx.try_send(Arc::clone(&alert)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscriber = id,
                        alert_id = %alert.alert_id,
                        "subscriber buffer full, dropping broadcast"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
            }
        }

        for id in gone {
            subs.remove(&id);
            debug!(subscriber = id, "pruned disconnected subscriber");
        }
    }

    /// Current subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().unwrap().len()
    }

    /// Total broadcasts dropped due to full subscriber buffers
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drop all subscribers; their receivers see a closed channel
    pub fn close(&self) {
        self.subs.lock().unwrap().clear();
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
