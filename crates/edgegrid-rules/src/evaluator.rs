//! Stateless rule evaluation.

use std::cmp::Ordering;
use std::collections::HashMap;

use edgegrid_state::DecisionKind;

use crate::rule::Rule;

/// The outcome of a fired rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleDecision {
    pub kind: DecisionKind,
    pub priority: i32,
    pub rule_id: u64,
}

impl Ord for RuleDecision {
    /// Most urgent first: ascending priority, then ascending rule id.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.rule_id.cmp(&other.rule_id))
            .then(self.kind.cmp(&other.kind))
    }
}

impl PartialOrd for RuleDecision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Evaluate rules against an entity's derived fields.
///
/// Returns the decision of the winning fired rule, or `None` when no rule
/// fires. Rule order does not matter.
pub fn evaluate<'a>(
    fields: &HashMap<String, f64>,
    rules: impl IntoIterator<Item = &'a Rule>,
) -> Option<RuleDecision> {
    rules
        .into_iter()
        .filter(|rule| rule.fires(fields))
        .map(|rule| RuleDecision {
            kind: rule.decision,
            priority: rule.priority,
            rule_id: rule.id,
        })
        .min()
}
