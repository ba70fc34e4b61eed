//! Rule stores.
//!
//! The rule set is owned by an external collaborator; the engine only reads
//! it. A store exposes a freshness token that changes whenever the rule set
//! changes, so callers can keep rules cached between edits.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use edgegrid_state::EntityKind;

use crate::error::{RulesError, RulesResult};
use crate::rule::Rule;

/// Read-mostly source of rules.
pub trait RuleStore: Send + Sync {
    /// Rules applying to every entity of a kind.
    fn generic_rules(&self, kind: EntityKind) -> RulesResult<Vec<Rule>>;

    /// Rules naming this entity key (host address, container id, service name).
    fn entity_rules(&self, kind: EntityKind, entity: &str) -> RulesResult<Vec<Rule>>;

    /// Changes whenever the rule set changes.
    fn freshness_token(&self) -> RulesResult<String>;
}

#[derive(Deserialize)]
struct RuleFile {
    #[serde(default, rename = "rule")]
    rules: Vec<Rule>,
}

/// Parse and validate a TOML rule set (`[[rule]]` tables).
pub fn parse_rules(content: &str) -> RulesResult<Vec<Rule>> {
    let file: RuleFile = toml::from_str(content).map_err(|e| RulesError::Parse(e.to_string()))?;
    let mut seen = HashSet::new();
    for rule in &file.rules {
        rule.validate()?;
        if !seen.insert(rule.id) {
            return Err(RulesError::Duplicate(rule.id));
        }
    }
    Ok(file.rules)
}

fn generic_of(rules: &[Rule], kind: EntityKind) -> Vec<Rule> {
    rules
        .iter()
        .filter(|r| r.kind == kind && r.is_generic())
        .cloned()
        .collect()
}

fn specific_to(rules: &[Rule], kind: EntityKind, entity: &str) -> Vec<Rule> {
    rules
        .iter()
        .filter(|r| r.kind == kind && r.targets_any(&[entity]))
        .cloned()
        .collect()
}

// ── File store ─────────────────────────────────────────────────────

/// Rules kept in a TOML file edited by the operator.
///
/// The freshness token is the SHA-256 of the file contents.
pub struct FileRuleStore {
    path: PathBuf,
}

impl FileRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read, parse and validate the whole file.
    pub fn load(&self) -> RulesResult<Vec<Rule>> {
        let content = std::fs::read_to_string(&self.path)?;
        let rules = parse_rules(&content)?;
        debug!(path = ?self.path, count = rules.len(), "rules loaded");
        Ok(rules)
    }
}

impl RuleStore for FileRuleStore {
    fn generic_rules(&self, kind: EntityKind) -> RulesResult<Vec<Rule>> {
        Ok(generic_of(&self.load()?, kind))
    }

    fn entity_rules(&self, kind: EntityKind, entity: &str) -> RulesResult<Vec<Rule>> {
        Ok(specific_to(&self.load()?, kind, entity))
    }

    fn freshness_token(&self) -> RulesResult<String> {
        let content = std::fs::read(&self.path)?;
        Ok(hex::encode(Sha256::digest(&content)))
    }
}

// ── In-memory store ────────────────────────────────────────────────

/// Rules held in process; the token is a version bumped on every change.
#[derive(Default)]
pub struct MemoryRuleStore {
    inner: RwLock<(u64, Vec<Rule>)>,
}

impl MemoryRuleStore {
    pub fn new(rules: Vec<Rule>) -> RulesResult<Self> {
        let store = Self::default();
        store.replace(rules)?;
        Ok(store)
    }

    /// Swap the whole rule set.
    pub fn replace(&self, rules: Vec<Rule>) -> RulesResult<()> {
        let mut seen = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !seen.insert(rule.id) {
                return Err(RulesError::Duplicate(rule.id));
            }
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.0 += 1;
        inner.1 = rules;
        Ok(())
    }

    fn with_rules<T>(&self, f: impl FnOnce(&[Rule]) -> T) -> T {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&inner.1)
    }
}

impl RuleStore for MemoryRuleStore {
    fn generic_rules(&self, kind: EntityKind) -> RulesResult<Vec<Rule>> {
        Ok(self.with_rules(|rules| generic_of(rules, kind)))
    }

    fn entity_rules(&self, kind: EntityKind, entity: &str) -> RulesResult<Vec<Rule>> {
        Ok(self.with_rules(|rules| specific_to(rules, kind, entity)))
    }

    fn freshness_token(&self) -> RulesResult<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.0.to_string())
    }
}
