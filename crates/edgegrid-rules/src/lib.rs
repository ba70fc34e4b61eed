//! edgegrid-rules — rule model and evaluation.
//!
//! A [`Rule`] is an AND of [`Condition`]s over an entity's derived fields
//! plus the decision it recommends and a priority. Evaluation is a pure
//! function of the derived fields and the applicable rules; the lowest
//! priority value wins, ties broken by rule id.
//!
//! # Components
//!
//! - **`rule`**: operators, conditions, rules, scope and validation
//! - **`evaluator`**: stateless `evaluate(fields, rules)`
//! - **`store`**: `RuleStore` trait with TOML-file and in-memory stores
//! - **`session`**: per-monitor rule cache invalidated by a freshness token

pub mod error;
pub mod evaluator;
pub mod rule;
pub mod session;
pub mod store;

pub use error::{RulesError, RulesResult};
pub use evaluator::{RuleDecision, evaluate};
pub use rule::{Condition, Operator, Rule, RuleScope, ValueMode};
pub use session::SessionCache;
pub use store::{FileRuleStore, MemoryRuleStore, RuleStore, parse_rules};
