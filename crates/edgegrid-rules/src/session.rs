//! Rule session cache.
//!
//! A session is the set of rules fetched from the store under one freshness
//! token. Monitors call [`SessionCache::refresh`] at the start of each cycle;
//! the cached rules are dropped only when the token moved, so rules are never
//! swapped underneath an evaluation in progress.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use edgegrid_state::EntityKind;

use crate::error::RulesResult;
use crate::evaluator::{RuleDecision, evaluate};
use crate::rule::Rule;
use crate::store::RuleStore;

pub struct SessionCache {
    store: Arc<dyn RuleStore>,
    token: Option<String>,
    generic: HashMap<EntityKind, Vec<Rule>>,
    specific: HashMap<(EntityKind, String), Vec<Rule>>,
}

impl SessionCache {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            store,
            token: None,
            generic: HashMap::new(),
            specific: HashMap::new(),
        }
    }

    /// Token of the current session, if one was opened.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Open a new session if the rule set changed. Returns true when it did.
    pub fn refresh(&mut self) -> RulesResult<bool> {
        let token = self.store.freshness_token()?;
        if self.token.as_deref() == Some(token.as_str()) {
            return Ok(false);
        }
        self.generic.clear();
        self.specific.clear();
        info!(%token, "rule session rebuilt");
        self.token = Some(token);
        Ok(true)
    }

    /// Generic rules of `kind` plus every rule naming one of `keys`.
    pub fn rules_for(&mut self, kind: EntityKind, keys: &[&str]) -> RulesResult<Vec<Rule>> {
        if !self.generic.contains_key(&kind) {
            let rules = self.store.generic_rules(kind)?;
            self.generic.insert(kind, rules);
        }
        let mut rules = self.generic.get(&kind).cloned().unwrap_or_default();

        for key in keys {
            let cache_key = (kind, key.to_string());
            if !self.specific.contains_key(&cache_key) {
                let specific = self.store.entity_rules(kind, key)?;
                self.specific.insert(cache_key.clone(), specific);
            }
            if let Some(specific) = self.specific.get(&cache_key) {
                for rule in specific {
                    if rules.iter().all(|r| r.id != rule.id) {
                        rules.push(rule.clone());
                    }
                }
            }
        }
        Ok(rules)
    }

    /// Drop the cached entity rules of a key that no longer exists.
    pub fn forget(&mut self, kind: EntityKind, key: &str) {
        self.specific.remove(&(kind, key.to_string()));
    }

    /// Evaluate the applicable rules for an entity.
    pub fn evaluate(
        &mut self,
        kind: EntityKind,
        keys: &[&str],
        fields: &HashMap<String, f64>,
    ) -> RulesResult<Option<RuleDecision>> {
        let rules = self.rules_for(kind, keys)?;
        Ok(evaluate(fields, &rules))
    }
}
