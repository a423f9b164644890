//! Error mapping policies.
//!
//! A policy rewrites internal or received status codes into the code and
//! reason phrase the upstream side should see. Policies are identified by
//! name only: two policies with the same name compare equal whatever their
//! rules, and registering a policy under an existing name replaces it.
use std::{
    collections::{BTreeSet, HashMap},
    hash::{Hash, Hasher},
    sync::Arc,
};

use arc_swap::ArcSwap;

use crate::config::models::ErrorMappingConfig;

/// One mapping rule: any code in `codes` becomes `mapped_code`/`mapped_phrase`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRule {
    codes: BTreeSet<u16>,
    mapped_code: u16,
    mapped_phrase: String,
}

impl MappingRule {
    pub fn new(
        codes: impl IntoIterator<Item = u16>,
        mapped_code: u16,
        mapped_phrase: impl Into<String>,
    ) -> Self {
        Self {
            codes: codes.into_iter().collect(),
            mapped_code,
            mapped_phrase: mapped_phrase.into(),
        }
    }

    pub fn matches(&self, code: u16) -> bool {
        self.codes.contains(&code)
    }

    pub fn mapped_code(&self) -> u16 {
        self.mapped_code
    }

    pub fn mapped_phrase(&self) -> &str {
        &self.mapped_phrase
    }
}

/// Named, ordered rule set
#[derive(Debug, Clone)]
pub struct ErrorMappingPolicy {
    name: String,
    rules: Vec<MappingRule>,
}

impl ErrorMappingPolicy {
    pub fn new(name: impl Into<String>, rules: Vec<MappingRule>) -> Self {
        Self {
            name: name.into(),
            rules,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    /// First rule containing `code` wins; unmatched codes pass through with no
    /// phrase override.
    pub fn map_code(&self, code: u16) -> (u16, Option<String>) {
        self.rules
            .iter()
            .find(|rule| rule.matches(code))
            .map(|rule| (rule.mapped_code, Some(rule.mapped_phrase.clone())))
            .unwrap_or((code, None))
    }
}

impl PartialEq for ErrorMappingPolicy {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ErrorMappingPolicy {}

impl Hash for ErrorMappingPolicy {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl From<&ErrorMappingConfig> for ErrorMappingPolicy {
    fn from(config: &ErrorMappingConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|rule| MappingRule::new(rule.codes.iter().copied(), rule.code, rule.phrase.clone()))
            .collect();
        Self::new(config.name.clone(), rules)
    }
}

/// Registry of policies keyed by name. Reads take a lock-free snapshot.
#[derive(Debug, Default)]
pub struct ErrorMappingRegistry {
    policies: ArcSwap<HashMap<String, Arc<ErrorMappingPolicy>>>,
}

impl ErrorMappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured policies, later entries replacing
    /// earlier ones with the same name.
    pub fn from_config(configs: &[ErrorMappingConfig]) -> Self {
        let registry = Self::new();
        for config in configs {
            registry.register(ErrorMappingPolicy::from(config));
        }
        registry
    }

    /// Register a policy, replacing (not merging) any policy with that name.
    pub fn register(&self, policy: ErrorMappingPolicy) -> Option<Arc<ErrorMappingPolicy>> {
        let policy = Arc::new(policy);
        let mut replaced = None;
        self.policies.rcu(|current| {
            let mut next = HashMap::clone(current);
            replaced = next.insert(policy.name.clone(), policy.clone());
            next
        });
        if replaced.is_some() {
            tracing::debug!(policy = %policy.name, "Replaced error mapping policy");
        }
        replaced
    }

    pub fn get(&self, name: &str) -> Option<Arc<ErrorMappingPolicy>> {
        self.policies.load().get(name).cloned()
    }

    /// Map `code` through the named policy; unknown or absent policy names pass
    /// the code through.
    pub fn map_code(&self, policy: Option<&str>, code: u16) -> (u16, Option<String>) {
        match policy.and_then(|name| self.get(name)) {
            Some(policy) => policy.map_code(code),
            None => {
                if let Some(name) = policy {
                    tracing::warn!(policy = name, "Unknown error mapping policy, passing code through");
                }
                (code, None)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.policies.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
