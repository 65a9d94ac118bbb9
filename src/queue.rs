//! Crash-safe local alert queue backed by SQLite
//!
//! Every alert is enqueued here before any delivery attempt, so events
//! survive process crashes and network outages. The database runs in WAL
//! mode with NORMAL synchronous durability. Delivery is at-least-once:
//! dequeue does not remove rows, only an explicit ack after the server
//! confirms receipt marks them delivered. Acking the same id twice is
//! harmless.

use crate::alert::AlertEvent;
use crate::error::{Result, TripwireError};
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// An alert as stored in the queue, tagged with its row id for acking
#[derive(Debug, Clone)]
pub struct QueuedAlert {
    /// SQLite rowid; the ack handle
    pub id: i64,
    pub event: AlertEvent,
}

/// Durable FIFO alert queue
///
/// A single connection guarded by a mutex serialises all statements,
/// which sidesteps SQLite's multi-writer locking entirely. The depth
/// counter is kept in an atomic so health checks never touch the
/// database.
pub struct AlertQueue {
    conn: Mutex<Connection>,
    depth: AtomicI64,
    closed: AtomicBool,
}

impl AlertQueue {
    /// Open (or create) the queue database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| TripwireError::Queue(format!("open database: {}", e)))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| TripwireError::Queue(format!("set WAL mode: {}", e)))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| TripwireError::Queue(format!("set synchronous: {}", e)))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS alerts (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                payload    BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                delivered  INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_pending
                ON alerts (delivered, id);",
        )
        .map_err(|e| TripwireError::Queue(format!("create schema: {}", e)))?;

        // Pending rows from a previous run re-seed the depth counter.
        let pending: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM alerts WHERE delivered = 0",
                [],
                |row| row.get(0),
            )
            .map_err(|e| TripwireError::Queue(format!("count pending: {}", e)))?;

        if pending > 0 {
            debug!(pending, "recovered undelivered alerts from previous run");
        }

        Ok(Self {
            conn: Mutex::new(conn),
            depth: AtomicI64::new(pending),
            closed: AtomicBool::new(false),
        })
    }

    /// Persist an event and return its queue id. The event is durable
    /// once this returns.
    pub fn enqueue(&self, event: &AlertEvent) -> Result<i64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TripwireError::QueueClosed);
        }

        let payload = serde_json::to_vec(event)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO alerts (payload, created_at, delivered) VALUES (?1, ?2, 0)",
            rusqlite::params![payload, event.timestamp.timestamp_micros()],
        )
        .map_err(|e| TripwireError::Queue(format!("insert alert: {}", e)))?;

        let id = conn.last_insert_rowid();
        self.depth.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    /// Fetch up to `limit` undelivered alerts in insertion order. Rows
    /// stay in the queue until acked, so a crash between dequeue and ack
    /// redelivers them.
    pub fn dequeue(&self, limit: usize) -> Result<Vec<QueuedAlert>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TripwireError::QueueClosed);
        }

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, payload FROM alerts WHERE delivered = 0 ORDER BY id LIMIT ?1",
            )
            .map_err(|e| TripwireError::Queue(format!("prepare dequeue: {}", e)))?;

        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(|e| TripwireError::Queue(format!("query pending: {}", e)))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, payload) =
                row.map_err(|e| TripwireError::Queue(format!("read row: {}", e)))?;
            let event: AlertEvent = serde_json::from_slice(&payload)?;
            out.push(QueuedAlert { id, event });
        }
        Ok(out)
    }

    /// Mark the given ids delivered. Ids already delivered (or unknown)
    /// are skipped, so redelivered acks never corrupt the depth counter.
    pub fn ack(&self, ids: &[i64]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TripwireError::QueueClosed);
        }
        if ids.is_empty() {
            return Ok(());
        }

        let conn = self.lock()?;
        let mut acked: i64 = 0;
        for id in ids {
            let n = conn
                .execute(
                    "UPDATE alerts SET delivered = 1 WHERE id = ?1 AND delivered = 0",
                    [id],
                )
                .map_err(|e| TripwireError::Queue(format!("ack alert {}: {}", id, e)))?;
            acked += n as i64;
        }

        if acked > 0 {
            self.depth.fetch_sub(acked, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Number of undelivered alerts
    pub fn depth(&self) -> i64 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Refuse all further operations. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TripwireError::Queue("queue lock poisoned".to_string()))
    }
}
