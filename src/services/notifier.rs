//! Status notification channel
//!
//! Guests learn about their pass through `observe` (poll) or a broadcast of
//! `StatusChange` events (push). Changes are published only after the
//! registry has committed them, so no observer sees INSIDE before it is
//! durable.

use crate::domain::error::GateResult;
use crate::domain::pass::{EntryCode, PassStatus};
use crate::services::registry::PassRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

/// A committed status change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChange {
    pub entry_code: EntryCode,
    pub status: PassStatus,
    pub at: DateTime<Utc>,
}

/// Outcome of waiting for a status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Reached(PassStatus),
    /// Target not reached before the deadline; carries the last known status
    TimedOut(PassStatus),
}

impl Observation {
    pub fn status(&self) -> PassStatus {
        match self {
            Observation::Reached(s) | Observation::TimedOut(s) => *s,
        }
    }
}

pub struct StatusNotifier {
    registry: Arc<PassRegistry>,
    tx: broadcast::Sender<StatusChange>,
}

impl StatusNotifier {
    pub fn new(registry: Arc<PassRegistry>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { registry, tx }
    }

    /// Current committed status
    pub fn observe(&self, code: &EntryCode) -> GateResult<PassStatus> {
        self.registry.find_by_code(code).map(|pass| pass.status())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.tx.subscribe()
    }

    /// Broadcast a committed change. Having no subscribers is fine.
    pub fn publish(&self, change: StatusChange) {
        let receivers = self.tx.send(change.clone()).unwrap_or(0);
        debug!(
            entry_code = %change.entry_code,
            status = %change.status,
            receivers = %receivers,
            "status_change_published"
        );
    }

    /// Wait until the pass reaches at least `target`, or `timeout` elapses.
    ///
    /// Statuses only move forward, so any status at or past `target` counts
    /// as reached.
    pub async fn wait_for(
        &self,
        code: &EntryCode,
        target: PassStatus,
        timeout: Duration,
    ) -> GateResult<Observation> {
        // Subscribe before reading so a commit in between is not missed
        let mut rx = self.subscribe();
        let mut current = self.observe(code)?;
        if current >= target {
            return Ok(Observation::Reached(current));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Err(_) => return Ok(Observation::TimedOut(current)),
                Ok(Ok(change)) => {
                    if &change.entry_code != code {
                        continue;
                    }
                    current = current.max(change.status);
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    debug!(entry_code = %code, skipped = %skipped, "status_wait_lagged");
                    current = current.max(self.observe(code)?);
                }
                Ok(Err(RecvError::Closed)) => {
                    current = current.max(self.observe(code)?);
                    return Ok(if current >= target {
                        Observation::Reached(current)
                    } else {
                        Observation::TimedOut(current)
                    });
                }
            }
            if current >= target {
                return Ok(Observation::Reached(current));
            }
        }
    }
}
