//! Rule model: operators, conditions, scope.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use edgegrid_state::{DecisionKind, EntityKind};

use crate::error::{RulesError, RulesResult};

/// Comparison between a field value and a condition threshold.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Operator {
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "!=", alias = "≠")]
    NotEqual,
}

impl Operator {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Equal => value == threshold,
            Operator::Less => value < threshold,
            Operator::Greater => value > threshold,
            Operator::LessOrEqual => value <= threshold,
            Operator::GreaterOrEqual => value >= threshold,
            Operator::NotEqual => value != threshold,
        }
    }
}

/// Which derived value of a field a condition looks at.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ValueMode {
    #[default]
    #[serde(rename = "effective-val")]
    EffectiveVal,
    #[serde(rename = "avg-val")]
    AvgVal,
    #[serde(rename = "deviation-%-on-avg-val")]
    DeviationOnAvgVal,
    #[serde(rename = "deviation-%-on-last-val")]
    DeviationOnLastVal,
}

impl ValueMode {
    pub fn suffix(self) -> &'static str {
        match self {
            ValueMode::EffectiveVal => "effective-val",
            ValueMode::AvgVal => "avg-val",
            ValueMode::DeviationOnAvgVal => "deviation-%-on-avg-val",
            ValueMode::DeviationOnLastVal => "deviation-%-on-last-val",
        }
    }
}

/// `field[mode] operator value`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    pub field: String,
    #[serde(default)]
    pub mode: ValueMode,
    pub operator: Operator,
    pub value: f64,
}

impl Condition {
    /// Name of the derived field this condition reads.
    pub fn key(&self) -> String {
        format!("{}-{}", self.field, self.mode.suffix())
    }

    /// A missing field never satisfies a condition.
    pub fn holds(&self, fields: &HashMap<String, f64>) -> bool {
        fields
            .get(&self.key())
            .is_some_and(|&v| self.operator.holds(v, self.value))
    }
}

/// Which entities a rule applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Every entity of the rule's kind.
    #[default]
    Generic,
    /// Host addresses, container ids or service names.
    Entities(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub scope: RuleScope,
    pub conditions: Vec<Condition>,
    pub decision: DecisionKind,
    /// Lower value = higher precedence.
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Rule {
    pub fn validate(&self) -> RulesResult<()> {
        if self.conditions.is_empty() {
            return Err(RulesError::Invalid {
                id: self.id,
                reason: "rule has no conditions".to_string(),
            });
        }
        if !self.decision.applies_to(self.kind) {
            return Err(RulesError::Invalid {
                id: self.id,
                reason: format!("decision {} does not apply to {} rules", self.decision, self.kind),
            });
        }
        if let RuleScope::Entities(ids) = &self.scope
            && ids.is_empty()
        {
            return Err(RulesError::Invalid {
                id: self.id,
                reason: "entity-specific rule names no entity".to_string(),
            });
        }
        Ok(())
    }

    pub fn is_generic(&self) -> bool {
        self.scope == RuleScope::Generic
    }

    /// Whether this entity-specific rule names any of the given keys.
    pub fn targets_any(&self, keys: &[&str]) -> bool {
        match &self.scope {
            RuleScope::Generic => false,
            RuleScope::Entities(ids) => ids.iter().any(|id| keys.contains(&id.as_str())),
        }
    }

    /// All conditions hold against the derived fields.
    pub fn fires(&self, fields: &HashMap<String, f64>) -> bool {
        self.enabled
            && !self.conditions.is_empty()
            && self.conditions.iter().all(|c| c.holds(fields))
    }
}
