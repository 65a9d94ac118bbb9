//! Tamper-evident, append-only audit log
//!
//! Every locally observed event is hash-chained into a JSONL file that can
//! be verified without any external service. Entry N's `event_hash` is the
//! SHA-256 hex digest of the canonical JSON encoding of
//! `{seq, ts, payload, prev_hash}`; `prev_hash` is entry N-1's
//! `event_hash`, or 64 ASCII zeros for the genesis entry.
//!
//! The log is independent of the queue and transport: history survives on
//! disk even if delivery to the dashboard never succeeds. Opening an
//! existing file replays and verifies the full chain and refuses to operate
//! on a corrupted log rather than risk extending a broken chain.

use crate::error::{Result, TripwireError};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// All-zero SHA-256 hex digest used as the genesis entry's prev_hash
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// One audit log entry, as stored on disk (one JSON line per entry)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    /// Monotonic sequence number, starting at 1
    pub seq: u64,
    /// Entry creation time, RFC 3339 with microsecond precision
    pub ts: String,
    /// Arbitrary JSON payload supplied by the caller
    pub payload: serde_json::Value,
    /// event_hash of the previous entry (or [`GENESIS_HASH`])
    pub prev_hash: String,
    /// SHA-256 hex digest over {seq, ts, payload, prev_hash}
    pub event_hash: String,
}

/// The hashed subset of an entry. Field order is the canonical encoding.
#[derive(Serialize)]
struct EntryContent<'a> {
    seq: u64,
    ts: &'a str,
    payload: &'a serde_json::Value,
    prev_hash: &'a str,
}

fn hash_content(seq: u64, ts: &str, payload: &serde_json::Value, prev_hash: &str) -> String {
    let content = EntryContent {
        seq,
        ts,
        payload,
        prev_hash,
    };
    // EntryContent fields are all JSON-serialisable; this cannot fail.
    let raw = serde_json::to_vec(&content).unwrap_or_default();
    hex::encode(Sha256::digest(&raw))
}

struct ChainState {
    file: File,
    seq: u64,
    prev_hash: String,
}

/// Append-only hash-chained audit logger
///
/// Safe for concurrent use: a single lock serialises `append` calls so
/// sequence numbers and hash linkage are never interleaved incorrectly.
pub struct AuditLog {
    path: PathBuf,
    state: Mutex<ChainState>,
}

impl AuditLog {
    /// Open (or create) the log at `path`, replaying and verifying any
    /// existing entries to restore chain state. Returns an error if any
    /// entry fails verification or any link is broken.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (seq, prev_hash) = if path.exists() {
            let entries = verify(&path)?;
            match entries.last() {
                Some(last) => (last.seq, last.event_hash.clone()),
                None => (0, GENESIS_HASH.to_string()),
            }
        } else {
            (0, GENESIS_HASH.to_string())
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                TripwireError::Audit(format!("open {} for appending: {}", path.display(), e))
            })?;

        Ok(Self {
            path,
            state: Mutex::new(ChainState {
                file,
                seq,
                prev_hash,
            }),
        })
    }

    /// Append a new entry and return it with its assigned sequence number
    /// and computed hashes
    pub fn append(&self, payload: serde_json::Value) -> Result<AuditEntry> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| TripwireError::Audit("audit lock poisoned".to_string()))?;

        let seq = state.seq + 1;
        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let prev_hash = state.prev_hash.clone();
        let event_hash = hash_content(seq, &ts, &payload, &prev_hash);

        let entry = AuditEntry {
            seq,
            ts,
            payload,
            prev_hash,
            event_hash: event_hash.clone(),
        };

        let mut line = serde_json::to_vec(&entry)
            .map_err(|e| TripwireError::Audit(format!("marshal entry: {}", e)))?;
        line.push(b'\n');

        // Single write so each entry lands as one atomic O_APPEND record.
        state
            .file
            .write_all(&line)
            .map_err(|e| TripwireError::Audit(format!("write entry: {}", e)))?;

        state.seq = seq;
        state.prev_hash = event_hash;

        Ok(entry)
    }

    /// Number of entries appended so far (including replayed ones)
    pub fn len(&self) -> u64 {
        self.state.lock().map(|s| s.seq).unwrap_or(0)
    }

    /// Whether the log contains no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the underlying file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush OS buffers to disk
    pub fn sync(&self) -> Result<()> {
        let state = self
            .state
            .lock()
            .map_err(|_| TripwireError::Audit("audit lock poisoned".to_string()))?;
        state
            .file
            .sync_all()
            .map_err(|e| TripwireError::Audit(format!("sync: {}", e)))
    }
}

/// Verify the full hash chain in the file at `path` without modifying it.
/// Returns the ordered entries on success, or the first detected break:
/// a tampered payload, a deleted entry, and an altered stored hash are all
/// independently detectable. An empty or absent-trailing-newline file is
/// handled line by line; blank lines are skipped.
pub fn verify(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| TripwireError::Audit(format!("verify open {}: {}", path.display(), e)))?;
    let reader = BufReader::new(file);

    let mut entries = Vec::new();
    let mut prev_hash = GENESIS_HASH.to_string();

    for line in reader.lines() {
        let line =
            line.map_err(|e| TripwireError::Audit(format!("read {}: {}", path.display(), e)))?;
        if line.is_empty() {
            continue;
        }

        let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| {
            TripwireError::AuditIntegrity {
                seq: entries.len() as u64 + 1,
                reason: format!("malformed entry: {}", e),
            }
        })?;

        if entry.prev_hash != prev_hash {
            return Err(TripwireError::AuditIntegrity {
                seq: entry.seq,
                reason: format!(
                    "chain break: expected prev_hash {:?}, got {:?}",
                    prev_hash, entry.prev_hash
                ),
            });
        }

        let computed = hash_content(entry.seq, &entry.ts, &entry.payload, &entry.prev_hash);
        if computed != entry.event_hash {
            return Err(TripwireError::AuditIntegrity {
                seq: entry.seq,
                reason: format!(
                    "hash mismatch: stored {:?}, computed {:?}",
                    entry.event_hash, computed
                ),
            });
        }

        prev_hash = entry.event_hash.clone();
        entries.push(entry);
    }

    Ok(entries)
}
