// Copyright 2024 The Contstream Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-batch hash table from grouping-key to the on-disk row a combiner
//! merges into (spec §4.4 steps b/c/d). Scoped to a single combiner batch:
//! a fresh `ExistingGroups` is built at "Select existing groups" and
//! discarded once "Merge" finishes, matching the combiner's transient
//! memory-context lifetime (spec §3).

use std::collections::HashMap;

use crate::group::GroupKey;
use crate::host::HeapTuple;

struct Entry {
    tuple: HeapTuple,
    added: bool,
}

/// Tracks which cached hashes still need a `matrel` lookup (spec §4.4 step
/// b: "skipping hashes already cached in the `existing` hash table") and
/// which entries have already been folded into the current `batch` (step
/// d's `EXISTING_ADDED` flag, preventing the same on-disk row from being
/// merged twice within one batch).
#[derive(Default)]
pub struct ExistingGroups {
    by_key: HashMap<GroupKey, Entry>,
}

impl ExistingGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Whether `hash` need not be looked up again this batch (spec §4.4
    /// step b).
    pub fn contains_hash(&self, hash: u64) -> bool {
        self.by_key.keys().any(|k| k.hash() == hash)
    }

    /// Populates the cache from a `matrel` lookup (spec §4.4 step b).
    pub fn populate(&mut self, key: GroupKey, tuple: HeapTuple) {
        self.by_key.insert(key, Entry { tuple, added: false });
    }

    /// Looks up the cached row for `key` without marking it (spec §4.4 step
    /// c's hash-collision filter).
    pub fn get(&self, key: &GroupKey) -> Option<&HeapTuple> {
        self.by_key.get(key).map(|e| &e.tuple)
    }

    /// Marks `key`'s cached row as folded into `batch`, returning `false`
    /// if it was already marked — the caller must not merge it twice (spec
    /// §4.4 step d's `EXISTING_ADDED`).
    pub fn mark_added(&mut self, key: &GroupKey) -> bool {
        match self.by_key.get_mut(key) {
            Some(entry) if !entry.added => {
                entry.added = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_added(&self, key: &GroupKey) -> bool {
        self.by_key.get(key).is_some_and(|e| e.added)
    }

    /// Rows never folded into `batch` this round — untouched groups whose
    /// on-disk state is unaffected by the current combine.
    pub fn unadded(&self) -> impl Iterator<Item = (&GroupKey, &HeapTuple)> {
        self.by_key
            .iter()
            .filter(|(_, e)| !e.added)
            .map(|(k, e)| (k, &e.tuple))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::ScalarValue;

    fn key(i: i64) -> GroupKey {
        GroupKey(vec![ScalarValue::Int64(i)])
    }

    fn tuple(i: i64) -> HeapTuple {
        HeapTuple {
            pk: Some(i),
            key: key(i),
            values: vec![ScalarValue::Int64(i)],
        }
    }

    #[test]
    fn populate_then_get() {
        let mut eg = ExistingGroups::new();
        eg.populate(key(1), tuple(1));
        assert_eq!(eg.get(&key(1)), Some(&tuple(1)));
        assert!(eg.get(&key(2)).is_none());
    }

    #[test]
    fn mark_added_is_idempotent_and_reports_first_time() {
        let mut eg = ExistingGroups::new();
        eg.populate(key(1), tuple(1));
        assert!(eg.mark_added(&key(1)));
        assert!(!eg.mark_added(&key(1)), "second mark must not re-merge");
        assert!(eg.is_added(&key(1)));
    }

    #[test]
    fn unadded_excludes_marked_entries() {
        let mut eg = ExistingGroups::new();
        eg.populate(key(1), tuple(1));
        eg.populate(key(2), tuple(2));
        eg.mark_added(&key(1));
        let remaining: Vec<_> = eg.unadded().map(|(k, _)| k.clone()).collect();
        assert_eq!(remaining, vec![key(2)]);
    }

    #[test]
    fn contains_hash_reflects_populated_keys() {
        let mut eg = ExistingGroups::new();
        let k = key(42);
        let h = k.hash();
        assert!(!eg.contains_hash(h));
        eg.populate(k, tuple(42));
        assert!(eg.contains_hash(h));
    }
}
