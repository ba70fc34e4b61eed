//! Per-entity evaluation shared by both monitors.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use edgegrid_metrics::{MetricTracker, Samples};
use edgegrid_rules::{RuleDecision, SessionCache};
use edgegrid_state::{DecisionKind, DecisionRecord, EntityKind};

use crate::arbiter::Candidate;
use crate::events::EventAccumulator;

pub(crate) struct Evaluation {
    pub decision: Option<RuleDecision>,
    pub count: u32,
    pub fields: Samples,
}

/// Derive fields for one entity, run its rules and fold the outcome into
/// its event counter.
#[allow(clippy::too_many_arguments)]
pub(crate) fn evaluate_entity(
    tracker: &MetricTracker,
    rules: &mut SessionCache,
    events: &EventAccumulator,
    kind: EntityKind,
    entity: &str,
    keys: &[&str],
    mut samples: Samples,
    elapsed: Duration,
) -> anyhow::Result<Evaluation> {
    tracker.with_rates(entity, &mut samples, elapsed)?;
    let fields = tracker.observe(entity, &samples)?;
    let decision = if fields.is_empty() {
        None
    } else {
        rules.evaluate(kind, keys, &fields)?
    };
    let count = events.record(kind, entity, decision.map(|d| d.kind))?;
    debug!(
        %entity,
        decision = ?decision.map(|d| d.kind),
        count,
        fields = fields.len(),
        "entity evaluated"
    );
    Ok(Evaluation { decision, count, fields })
}

impl Evaluation {
    pub fn into_candidate(self, entity_id: &str, protected: bool) -> Candidate {
        Candidate {
            entity_id: entity_id.to_string(),
            decision: self.decision,
            count: self.count,
            protected,
            fields: self.fields,
        }
    }
}

/// Drop statistics and streaks of entities that disappeared since the last
/// cycle. Returns the ids seen this cycle.
pub(crate) fn forget_missing(
    tracker: &MetricTracker,
    rules: &mut SessionCache,
    events: &EventAccumulator,
    kind: EntityKind,
    known: &HashSet<String>,
    current: HashSet<String>,
) -> anyhow::Result<HashSet<String>> {
    for gone in known.difference(&current) {
        tracker.forget(gone)?;
        rules.forget(kind, gone);
        events.reset(kind, gone)?;
        debug!(entity = %gone, "entity gone, history dropped");
    }
    Ok(current)
}

pub(crate) fn in_region(owned: Option<&str>, region: &str) -> bool {
    owned.is_none_or(|owned| owned.eq_ignore_ascii_case(region))
}

pub(crate) fn decision_record(
    kind: EntityKind,
    candidate: &Candidate,
    service_name: Option<String>,
    decision: DecisionKind,
    result: String,
) -> DecisionRecord {
    DecisionRecord {
        kind,
        entity_id: candidate.entity_id.clone(),
        service_name,
        decision,
        rule_id: candidate.decision.map(|d| d.rule_id),
        fields: candidate.fields.clone(),
        result,
        timestamp_ms: epoch_millis(),
    }
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
