//! Process tripwire: detects newly started processes matching a rule
//!
//! Polls the process table and diffs PID sets between snapshots. PROCESS
//! rule targets are shell-style patterns matched against the executable's
//! base name first, then its full path; an empty pattern matches every
//! process. A PID that exits and is reused later counts as a new process.

use crate::alert::{AlertEvent, Severity, TripwireType};
use crate::config::TripwireRule;
use crate::error::{Result, TripwireError};
use crate::watcher::{Watcher, EVENT_BUFFER};
use async_trait::async_trait;
use glob::Pattern;
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One running process as seen in a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    /// Short process name (comm)
    pub comm: String,
    /// Full executable path, empty when unreadable
    pub exe: String,
}

/// Source of process table snapshots. The production lister reads /proc;
/// tests substitute fixed lists.
pub trait ProcessLister: Send + Sync {
    fn list(&self) -> Result<Vec<ProcessInfo>>;
}

/// Reads the real /proc process table
pub struct ProcFsLister;

impl ProcessLister for ProcFsLister {
    fn list(&self) -> Result<Vec<ProcessInfo>> {
        let mut procs = Vec::new();
        let entries = std::fs::read_dir("/proc")
            .map_err(|e| TripwireError::Watcher(format!("read /proc: {}", e)))?;

        for entry in entries.flatten() {
            let name = entry.file_name();
            let pid: i32 = match name.to_string_lossy().parse() {
                Ok(pid) => pid,
                Err(_) => continue,
            };

            // Processes may exit between readdir and these reads.
            let comm = std::fs::read_to_string(entry.path().join("comm"))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            if comm.is_empty() {
                continue;
            }
            let exe = std::fs::read_link(entry.path().join("exe"))
                .map(|p| p.display().to_string())
                .unwrap_or_default();

            procs.push(ProcessInfo { pid, comm, exe });
        }
        Ok(procs)
    }
}

#[derive(Debug, Clone)]
struct ProcRule {
    name: String,
    pattern: Option<Pattern>,
    severity: Severity,
}

impl ProcRule {
    /// Match against the base name first, then the full path. An absent
    /// pattern matches everything.
    fn matches(&self, proc: &ProcessInfo) -> bool {
        let pattern = match &self.pattern {
            Some(p) => p,
            None => return true,
        };
        for candidate in [&proc.exe, &proc.comm] {
            if candidate.is_empty() {
                continue;
            }
            let base = Path::new(candidate)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if pattern.matches(&base) || pattern.matches(candidate) {
                return true;
            }
        }
        false
    }
}

/// Polling watcher over the process table
pub struct ProcessWatcher {
    rules: Vec<ProcRule>,
    lister: Arc<dyn ProcessLister>,
    poll_interval: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ProcessWatcher {
    pub fn new(rules: &[&TripwireRule]) -> Self {
        Self::with_lister(rules, Arc::new(ProcFsLister), DEFAULT_POLL_INTERVAL)
    }

    pub fn with_lister(
        rules: &[&TripwireRule],
        lister: Arc<dyn ProcessLister>,
        poll_interval: Duration,
    ) -> Self {
        let mut parsed = Vec::new();
        for rule in rules {
            let pattern = if rule.target.is_empty() {
                None
            } else {
                match Pattern::new(&rule.target) {
                    Ok(p) => Some(p),
                    Err(e) => {
                        warn!(
                            rule = %rule.name,
                            target = %rule.target,
                            error = %e,
                            "process rule target is not a valid pattern, skipping rule"
                        );
                        continue;
                    }
                }
            };
            parsed.push(ProcRule {
                name: rule.name.clone(),
                pattern,
                severity: rule.parsed_severity().unwrap_or(Severity::Warn),
            });
        }

        Self {
            rules: parsed,
            lister,
            poll_interval,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// Events for processes that appeared since the previous snapshot. The
/// first snapshot only seeds the baseline so already-running processes do
/// not alert at startup.
fn diff(
    rules: &[ProcRule],
    procs: &[ProcessInfo],
    known: &mut Option<HashSet<i32>>,
) -> Vec<AlertEvent> {
    let current: HashSet<i32> = procs.iter().map(|p| p.pid).collect();

    let baseline = match known {
        Some(baseline) => baseline,
        None => {
            *known = Some(current);
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for proc in procs {
        if baseline.contains(&proc.pid) {
            continue;
        }
        for rule in rules {
            if rule.matches(proc) {
                events.push(
                    AlertEvent::new(TripwireType::Process, rule.name.clone(), rule.severity)
                        .with_detail("pid", json!(proc.pid))
                        .with_detail("comm", json!(proc.comm))
                        .with_detail("exe", json!(proc.exe)),
                );
            }
        }
    }

    *baseline = current;
    events
}

#[async_trait]
impl Watcher for ProcessWatcher {
    fn name(&self) -> &str {
        "process"
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<AlertEvent>> {
        if self.task.is_some() {
            return Err(TripwireError::Watcher(
                "process watcher already started".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let rules = self.rules.clone();
        let lister = Arc::clone(&self.lister);
        let interval = self.poll_interval;
        let cancel = self.cancel.clone();

        info!(rules = rules.len(), ?interval, "process watcher starting");

        self.task = Some(tokio::spawn(async move {
            let mut known: Option<HashSet<i32>> = None;
            loop {
                let procs = match lister.list() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "process table poll failed");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(interval) => continue,
                        }
                    }
                };

                for event in diff(&rules, &procs, &mut known) {
                    if let Err(mpsc::error::TrySendError::Full(evt)) = tx.try_send(event) {
                        warn!(rule = %evt.rule_name, "event buffer full, dropping alert");
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("process watcher stopped");
        }));

        Ok(rx)
    }

    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
