//! File tripwire: inotify-backed watcher over configured paths
//!
//! Each FILE rule names a path (file or directory). Any create, write,
//! rename, metadata change, or removal touching a watched path raises an
//! alert carrying the affected path and the kind of operation. Watching
//! is event-driven; nothing is polled.

use crate::alert::{AlertEvent, Severity, TripwireType};
use crate::config::TripwireRule;
use crate::error::{Result, TripwireError};
use crate::watcher::{Watcher, EVENT_BUFFER};
use async_trait::async_trait;
use notify::event::{Event, EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
struct PathRule {
    name: String,
    target: PathBuf,
    severity: Severity,
}

/// Event-driven watcher over FILE rule targets
pub struct FileWatcher {
    rules: Vec<PathRule>,
    inner: Option<RecommendedWatcher>,
}

impl FileWatcher {
    pub fn new(rules: &[&TripwireRule]) -> Self {
        let rules = rules
            .iter()
            .map(|r| PathRule {
                name: r.name.clone(),
                target: PathBuf::from(&r.target),
                severity: r.parsed_severity().unwrap_or(Severity::Warn),
            })
            .collect();
        Self { rules, inner: None }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// Short operation name for the alert detail, or None for event kinds we
/// do not report (reads, catalogue rescans)
fn op_name(kind: &EventKind) -> Option<&'static str> {
    match kind {
        EventKind::Create(_) => Some("create"),
        EventKind::Remove(_) => Some("remove"),
        EventKind::Modify(ModifyKind::Data(_)) => Some("write"),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some("chmod"),
        EventKind::Modify(ModifyKind::Name(_)) => Some("rename"),
        EventKind::Modify(_) => Some("write"),
        _ => None,
    }
}

/// The rule covering `path`: an exact match, or the rule whose target
/// directory contains it
fn matching_rule<'a>(rules: &'a [PathRule], path: &Path) -> Option<&'a PathRule> {
    rules.iter().find(|r| path.starts_with(&r.target))
}

#[async_trait]
impl Watcher for FileWatcher {
    fn name(&self) -> &str {
        "file"
    }

    async fn start(&mut self) -> Result<mpsc::Receiver<AlertEvent>> {
        if self.inner.is_some() {
            return Err(TripwireError::Watcher(
                "file watcher already started".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let rules = self.rules.clone();

        let mut inner = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "file watch backend error");
                    return;
                }
            };
            let op = match op_name(&event.kind) {
                Some(op) => op,
                None => return,
            };
            for path in &event.paths {
                if let Some(rule) = matching_rule(&rules, path) {
                    let alert =
                        AlertEvent::new(TripwireType::File, rule.name.clone(), rule.severity)
                            .with_detail("path", json!(path.display().to_string()))
                            .with_detail("op", json!(op));
                    if let Err(mpsc::error::TrySendError::Full(evt)) = tx.try_send(alert) {
                        warn!(rule = %evt.rule_name, "event buffer full, dropping alert");
                    }
                }
            }
        })
        .map_err(|e| TripwireError::Watcher(format!("create file watcher: {}", e)))?;

        for rule in &self.rules {
            let mode = if rule.target.is_dir() {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            if let Err(e) = inner.watch(&rule.target, mode) {
                // A missing target is a config problem worth surfacing but
                // must not take down the other rules.
                warn!(
                    rule = %rule.name,
                    target = %rule.target.display(),
                    error = %e,
                    "cannot watch file rule target"
                );
            }
        }

        info!(rules = self.rules.len(), "file watcher starting");
        self.inner = Some(inner);
        Ok(rx)
    }

    async fn stop(&mut self) {
        // Dropping the backend tears down the watches and, with them, the
        // event sender; receivers observe a closed channel.
        self.inner = None;
    }
}
