//! Process-wide policy snapshot.
//!
//! One writer (the refresher) swaps the whole identity → rule-set mapping;
//! any number of readers take an `Arc` to the current snapshot. A reader
//! holding a snapshot keeps seeing it unchanged even if a refresh lands
//! mid-evaluation.

use crate::rules::RuleSet;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

/// An immutable view of all rule sets at one point in time.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    rule_sets: HashMap<String, Arc<RuleSet>>,
    version: u64,
    refreshed_at: Option<SystemTime>,
}

impl PolicySnapshot {
    pub fn get(&self, identity: &str) -> Option<Arc<RuleSet>> {
        self.rule_sets.get(identity).cloned()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn refreshed_at(&self) -> Option<SystemTime> {
        self.refreshed_at
    }

    pub fn len(&self) -> usize {
        self.rule_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rule_sets.is_empty()
    }
}

/// Versioned holder of the current [`PolicySnapshot`].
#[derive(Debug, Default)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicySnapshot>>,
}

impl PolicyStore {
    /// An empty store. Every lookup misses until the first `replace_all`.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.read().clone()
    }

    /// The rule set for `identity` in the current snapshot.
    pub fn get(&self, identity: &str) -> Option<Arc<RuleSet>> {
        self.read().get(identity)
    }

    /// Atomically replace every rule set. Returns the new version.
    pub fn replace_all(&self, rule_sets: HashMap<String, RuleSet>) -> u64 {
        let rule_sets = rule_sets
            .into_iter()
            .map(|(id, set)| (id, Arc::new(set)))
            .collect();

        let mut current = self.write();
        let version = current.version + 1;
        *current = Arc::new(PolicySnapshot {
            rule_sets,
            version,
            refreshed_at: Some(SystemTime::now()),
        });
        version
    }

    /// Drop all policy. Only used at shutdown.
    pub fn clear(&self) {
        let mut current = self.write();
        let version = current.version + 1;
        *current = Arc::new(PolicySnapshot {
            version,
            ..PolicySnapshot::default()
        });
    }

    pub fn version(&self) -> u64 {
        self.read().version
    }

    pub fn last_refresh(&self) -> Option<SystemTime> {
        self.read().refreshed_at
    }

    pub fn identity_count(&self) -> usize {
        self.read().len()
    }

    // A panicked writer cannot leave a half-built snapshot behind (the swap
    // is a single assignment), so a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, Arc<PolicySnapshot>> {
        self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<PolicySnapshot>> {
        self.current.write().unwrap_or_else(|e| e.into_inner())
    }
}
