//! Crash recovery bookkeeping.
//!
//! A crashed container is relaunched close to where it ran. Each relaunch
//! appends an entry to the recovery label carried by the new container, so
//! a service that keeps crashing is eventually left down.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use edgegrid_state::{ContainerRecord, labels};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryEntry {
    pub container_id: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_recoveries: u32,
    pub window: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_recoveries: 3,
            window: Duration::from_secs(10 * 60),
        }
    }
}

impl RecoveryPolicy {
    /// Recovery history of a container, oldest first. An unreadable label
    /// counts as no history.
    pub fn history(container: &ContainerRecord) -> Vec<RecoveryEntry> {
        let Some(raw) = container.label(labels::RECOVERY) else {
            return Vec::new();
        };
        match serde_json::from_str(raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(container = %container.id, error = %e, "ignoring malformed recovery label");
                Vec::new()
            }
        }
    }

    /// Decide whether `crashed` may be relaunched at `now_ms`.
    ///
    /// Returns the label value for the relaunched container (the recent
    /// history plus this recovery), or `None` when the container already
    /// recovered `max_recoveries` times inside the window.
    pub fn next_label(&self, crashed: &ContainerRecord, now_ms: u64) -> Option<String> {
        let window_ms = u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX);
        let mut recent: Vec<RecoveryEntry> = Self::history(crashed)
            .into_iter()
            .filter(|e| e.timestamp_ms.saturating_add(window_ms) > now_ms)
            .collect();
        if recent.len() >= self.max_recoveries as usize {
            return None;
        }
        recent.push(RecoveryEntry {
            container_id: crashed.id.clone(),
            timestamp_ms: now_ms,
        });
        serde_json::to_string(&recent).ok()
    }
}
