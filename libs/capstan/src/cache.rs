//! Memoization of compiled scan computations.
//!
//! A two-level map: combine-function identity, then partition-policy
//! identity, to the compiled triple. Identity means the pointer of the
//! caller-held `Arc` handle, so the same closure re-wrapped in a new `Arc`
//! is a different function as far as the cache is concerned. Entries live
//! until an explicit [`ComputationCache::clear`]; nothing is evicted.
use std::collections::HashMap;
use std::sync::Arc;

use crate::{PartitionPolicy, ScanComputation, StepFn};

/// Stable identity of a combine-function handle.
pub fn fn_key(step: &Arc<StepFn>) -> usize {
    Arc::as_ptr(step) as *const () as usize
}

/// Stable identity of a partition-policy handle.
pub fn policy_key(policy: &Arc<dyn PartitionPolicy>) -> usize {
    Arc::as_ptr(policy) as *const () as usize
}

#[derive(Default)]
pub struct ComputationCache {
    entries: HashMap<usize, HashMap<usize, Arc<ScanComputation>>>,
}

impl ComputationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fn_key: usize, policy_key: usize) -> Option<Arc<ScanComputation>> {
        self.entries.get(&fn_key)?.get(&policy_key).cloned()
    }

    pub fn insert(&mut self, fn_key: usize, policy_key: usize, comp: Arc<ScanComputation>) {
        self.entries
            .entry(fn_key)
            .or_default()
            .insert(policy_key, comp);
    }

    /// Drops every entry. The only way entries ever leave the cache.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of distinct combine functions with at least one entry.
    pub fn fn_count(&self) -> usize {
        self.entries.len()
    }

    pub fn contains_fn(&self, fn_key: usize) -> bool {
        self.entries.contains_key(&fn_key)
    }

    /// Size of the second-level map for one combine function.
    pub fn policy_count(&self, fn_key: usize) -> usize {
        self.entries.get(&fn_key).map_or(0, HashMap::len)
    }

    /// Total number of compiled triples across all functions.
    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
