//! Decision arbitration.
//!
//! Pure functions: given every entity's decision and streak for one cycle,
//! pick at most one action per scope (all hosts, or one service) that the
//! floor and ceiling allow.

use std::collections::HashMap;

use edgegrid_rules::RuleDecision;
use edgegrid_state::DecisionKind;

/// One entity's outcome in the current cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub entity_id: String,
    /// `None` when no rule fired (or the entity had no baseline yet).
    pub decision: Option<RuleDecision>,
    /// Consecutive identical decisions, including this cycle's.
    pub count: u32,
    /// Never chosen for a STOP (manager hosts).
    pub protected: bool,
    /// Derived fields the decision was made on, kept for the audit record.
    pub fields: HashMap<String, f64>,
}

impl Candidate {
    pub fn kind(&self) -> Option<DecisionKind> {
        self.decision.map(|d| d.kind)
    }
}

/// Consecutive events needed before a host decision is acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostThresholds {
    pub start: u32,
    pub stop: u32,
}

impl Default for HostThresholds {
    fn default() -> Self {
        Self { start: 1, stop: 1 }
    }
}

impl HostThresholds {
    pub fn for_kind(&self, kind: DecisionKind) -> Option<u32> {
        match kind {
            DecisionKind::Start => Some(self.start),
            DecisionKind::Stop => Some(self.stop),
            _ => None,
        }
    }
}

/// Consecutive events needed before a service decision is acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceThresholds {
    pub replicate: u32,
    pub migrate: u32,
    pub stop: u32,
}

impl Default for ServiceThresholds {
    fn default() -> Self {
        Self {
            replicate: 1,
            migrate: 1,
            stop: 1,
        }
    }
}

impl ServiceThresholds {
    pub fn for_kind(&self, kind: DecisionKind) -> Option<u32> {
        match kind {
            DecisionKind::Replicate => Some(self.replicate),
            DecisionKind::Migrate => Some(self.migrate),
            DecisionKind::Stop => Some(self.stop),
            _ => None,
        }
    }
}

/// Floor and ceiling on a population. A `max` of 0 means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bounds {
    pub min: u32,
    pub max: u32,
}

impl Bounds {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn can_grow(&self, current: u32) -> bool {
        self.max == 0 || current < self.max
    }

    pub fn can_shrink(&self, current: u32) -> bool {
        current > self.min
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostPlan {
    /// Bring up capacity near the candidate's host.
    Start(Candidate),
    Stop(Candidate),
}

impl HostPlan {
    pub fn candidate(&self) -> &Candidate {
        match self {
            HostPlan::Start(c) | HostPlan::Stop(c) => c,
        }
    }

    pub fn kind(&self) -> DecisionKind {
        match self {
            HostPlan::Start(_) => DecisionKind::Start,
            HostPlan::Stop(_) => DecisionKind::Stop,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServicePlan {
    /// Start a copy of the candidate's container. `below_minimum` is set
    /// when the replica is forced by the service floor.
    Replicate { source: Candidate, below_minimum: bool },
    Migrate(Candidate),
    Stop(Candidate),
}

impl ServicePlan {
    pub fn candidate(&self) -> &Candidate {
        match self {
            ServicePlan::Replicate { source, .. } => source,
            ServicePlan::Migrate(c) | ServicePlan::Stop(c) => c,
        }
    }

    pub fn kind(&self) -> DecisionKind {
        match self {
            ServicePlan::Replicate { .. } => DecisionKind::Replicate,
            ServicePlan::Migrate(_) => DecisionKind::Migrate,
            ServicePlan::Stop(_) => DecisionKind::Stop,
        }
    }
}

/// Candidates whose streak reached their decision's threshold, most urgent
/// first. MAINTAIN and undecided candidates are never relevant.
pub fn relevant<'a>(
    candidates: &'a [Candidate],
    threshold: impl Fn(DecisionKind) -> Option<u32>,
) -> Vec<&'a Candidate> {
    let mut relevant: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| {
            c.decision
                .and_then(|d| threshold(d.kind))
                .is_some_and(|needed| c.count >= needed)
        })
        .collect();
    relevant.sort_by(|a, b| a.decision.cmp(&b.decision).then_with(|| a.entity_id.cmp(&b.entity_id)));
    relevant
}

/// Choose the host action for this cycle.
///
/// The most urgent relevant decision sets the direction. A START runs only
/// below the ceiling. A STOP runs only above the floor, and stops the least
/// urgent relevant STOP candidate that is not protected.
pub fn arbitrate_hosts(
    candidates: &[Candidate],
    thresholds: &HostThresholds,
    bounds: Bounds,
    active_hosts: u32,
) -> Option<HostPlan> {
    let relevant = relevant(candidates, |k| thresholds.for_kind(k));
    let top = relevant.first()?;
    match top.kind()? {
        DecisionKind::Start if bounds.can_grow(active_hosts) => Some(HostPlan::Start((*top).clone())),
        DecisionKind::Stop if bounds.can_shrink(active_hosts) => relevant
            .iter()
            .rev()
            .find(|c| c.kind() == Some(DecisionKind::Stop) && !c.protected)
            .map(|c| HostPlan::Stop((*c).clone())),
        _ => None,
    }
}

/// Choose the action for one service's containers this cycle.
///
/// Below the service floor a replica is started regardless of thresholds,
/// preferring a container that asked to replicate. Otherwise the most urgent
/// relevant decision wins: REPLICATE below the ceiling, MIGRATE always, STOP
/// above the floor on the least urgent relevant STOP candidate.
pub fn arbitrate_service(
    candidates: &[Candidate],
    thresholds: &ServiceThresholds,
    bounds: Bounds,
) -> Option<ServicePlan> {
    let current = u32::try_from(candidates.len()).unwrap_or(u32::MAX);
    let relevant = relevant(candidates, |k| thresholds.for_kind(k));

    if current < bounds.min {
        return replica_source(candidates, &relevant).map(|source| ServicePlan::Replicate {
            source,
            below_minimum: true,
        });
    }

    let top = relevant.first()?;
    match top.kind()? {
        DecisionKind::Replicate if bounds.can_grow(current) => Some(ServicePlan::Replicate {
            source: (*top).clone(),
            below_minimum: false,
        }),
        DecisionKind::Migrate => Some(ServicePlan::Migrate((*top).clone())),
        DecisionKind::Stop if bounds.can_shrink(current) => relevant
            .iter()
            .rev()
            .find(|c| c.kind() == Some(DecisionKind::Stop))
            .map(|c| ServicePlan::Stop((*c).clone())),
        _ => None,
    }
}

fn replica_source(candidates: &[Candidate], relevant: &[&Candidate]) -> Option<Candidate> {
    if let Some(top) = relevant.first()
        && top.kind() == Some(DecisionKind::Replicate)
    {
        return Some((*top).clone());
    }
    let mut replicating: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.kind() == Some(DecisionKind::Replicate))
        .collect();
    replicating.sort_by(|a, b| a.decision.cmp(&b.decision).then_with(|| a.entity_id.cmp(&b.entity_id)));
    if let Some(best) = replicating.first() {
        return Some((*best).clone());
    }
    candidates
        .iter()
        .filter(|c| c.kind().is_none())
        .min_by(|a, b| a.entity_id.cmp(&b.entity_id))
        .or_else(|| candidates.iter().min_by(|a, b| a.entity_id.cmp(&b.entity_id)))
        .cloned()
}
