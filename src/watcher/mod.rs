//! Tripwire sensors
//!
//! Each watcher observes one class of host activity (file, network,
//! process) and emits [`AlertEvent`]s on a bounded channel. Watchers own
//! their background tasks and stop cooperatively via cancellation; they
//! never block the caller on a slow consumer.

pub mod file;
pub mod network;
pub mod process;

use crate::alert::AlertEvent;
use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Capacity of each watcher's outbound event channel
pub const EVENT_BUFFER: usize = 64;

/// A background sensor that produces alert events
///
/// `start` spawns the watcher's task and hands back the receiving end of
/// its event channel; it may be called at most once. `stop` cancels the
/// task and waits for it to finish, after which the channel is closed.
#[async_trait]
pub trait Watcher: Send {
    /// Stable name used in logs
    fn name(&self) -> &str;

    /// Begin watching; returns the event stream
    async fn start(&mut self) -> Result<mpsc::Receiver<AlertEvent>>;

    /// Cancel the background task and wait for it to exit
    async fn stop(&mut self);
}
