//! Event accumulation.
//!
//! One [`EventCounter`] per entity counts how many consecutive cycles fired
//! the same decision. A cycle where no rule fired leaves the counter as it
//! was, so one quiet sample does not break a streak.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use edgegrid_state::{DecisionKind, EntityKind, EventCounter, StateResult, StateStore};

#[derive(Clone)]
pub struct EventAccumulator {
    state: StateStore,
}

impl EventAccumulator {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Fold one cycle's outcome into the entity's counter and return the
    /// resulting count.
    ///
    /// The same decision as last time increments the count, a different one
    /// restarts it at 1. `None` changes nothing and returns the stored count
    /// (0 when the entity never fired).
    pub fn record(&self, kind: EntityKind, entity: &str, decision: Option<DecisionKind>) -> StateResult<u32> {
        let existing = self.state.get_event(kind, entity)?;
        let Some(decision) = decision else {
            return Ok(existing.map(|e| e.count).unwrap_or(0));
        };

        let count = match existing {
            Some(e) if e.decision == decision => e.count.saturating_add(1),
            _ => 1,
        };
        self.state.put_event(&EventCounter {
            kind,
            entity_id: entity.to_string(),
            decision,
            count,
            updated_at: epoch_secs(),
        })?;
        debug!(%entity, decision = %decision, count, "event recorded");
        Ok(count)
    }

    pub fn count(&self, kind: EntityKind, entity: &str) -> StateResult<Option<EventCounter>> {
        self.state.get_event(kind, entity)
    }

    /// Clear the entity's streak, after scheduling an action for it or once
    /// the entity is gone.
    pub fn reset(&self, kind: EntityKind, entity: &str) -> StateResult<()> {
        self.state.delete_event(kind, entity)?;
        Ok(())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
