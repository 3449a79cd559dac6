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

//! Bounded-memory LRU from grouping-key to the last synced aggregate tuple
//! (spec §3, §4.8). Eviction is tail-first until `available >= needed`;
//! `put` on an oversized entry (`needed > maxsize`) returns `false` rather
//! than ever accepting it.

use std::collections::HashMap;

use crate::group::GroupKey;
use crate::host::HeapTuple;

const ENTRY_OVERHEAD: usize = 64; // stand-in for header + hashtable-entry + lru-node bookkeeping.

struct Node {
    tuple: HeapTuple,
    size: usize,
    prev: Option<GroupKey>,
    next: Option<GroupKey>,
}

/// Doubly-linked LRU list plus a hash index, evicting down to a target
/// capacity at batch end rather than on every insert.
pub struct GroupCache {
    maxsize: usize,
    available: usize,
    nodes: HashMap<GroupKey, Node>,
    head: Option<GroupKey>, // MRU
    tail: Option<GroupKey>, // LRU
}

fn entry_size(tuple: &HeapTuple) -> usize {
    ENTRY_OVERHEAD + tuple.values.len() * 24
}

impl GroupCache {
    pub fn new(maxsize: usize) -> Self {
        Self {
            maxsize,
            available: maxsize,
            nodes: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn bytes_used(&self) -> usize {
        self.maxsize - self.available
    }

    fn unlink(&mut self, key: &GroupKey) {
        let (prev, next) = {
            let node = self.nodes.get(key).unwrap();
            (node.prev.clone(), node.next.clone())
        };
        match &prev {
            Some(p) => self.nodes.get_mut(p).unwrap().next = next.clone(),
            None => self.head = next.clone(),
        }
        match &next {
            Some(n) => self.nodes.get_mut(n).unwrap().prev = prev.clone(),
            None => self.tail = prev.clone(),
        }
    }

    fn push_front(&mut self, key: GroupKey) {
        let old_head = self.head.clone();
        if let Some(node) = self.nodes.get_mut(&key) {
            node.prev = None;
            node.next = old_head.clone();
        }
        if let Some(old_head) = &old_head {
            self.nodes.get_mut(old_head).unwrap().prev = Some(key.clone());
        }
        self.head = Some(key.clone());
        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }

    fn evict_tail(&mut self) -> bool {
        let Some(tail_key) = self.tail.clone() else {
            return false;
        };
        self.unlink(&tail_key);
        if let Some(node) = self.nodes.remove(&tail_key) {
            self.available += node.size;
        }
        true
    }

    /// Inserts or replaces `key`'s cached tuple (spec §4.8). Returns `false`
    /// if the tuple alone exceeds `maxsize` (never cacheable).
    pub fn put(&mut self, key: GroupKey, tuple: HeapTuple) -> bool {
        let needed = entry_size(&tuple);
        if needed > self.maxsize {
            return false;
        }

        if let Some(existing) = self.nodes.get(&key) {
            self.available += existing.size;
            self.unlink(&key);
            self.nodes.remove(&key);
        }

        while self.available < needed {
            if !self.evict_tail() {
                break;
            }
        }
        if self.available < needed {
            return false;
        }

        self.available -= needed;
        self.nodes.insert(
            key.clone(),
            Node {
                tuple,
                size: needed,
                prev: None,
                next: None,
            },
        );
        self.push_front(key);
        true
    }

    /// Looks up `key`, promoting it to MRU on hit (spec §4.8).
    pub fn get(&mut self, key: &GroupKey) -> Option<HeapTuple> {
        if !self.nodes.contains_key(key) {
            return None;
        }
        self.unlink(key);
        self.push_front(key.clone());
        self.nodes.get(key).map(|n| n.tuple.clone())
    }

    pub fn delete(&mut self, key: &GroupKey) {
        if self.nodes.contains_key(key) {
            self.unlink(key);
            if let Some(node) = self.nodes.remove(key) {
                self.available += node.size;
            }
        }
    }

    /// `true` when the linked-list order is a strict path from MRU head to
    /// LRU tail with no cycles (spec §8 round-trip / invariant checks).
    #[cfg(test)]
    fn list_len(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head.clone();
        let mut seen = std::collections::HashSet::new();
        while let Some(key) = cur {
            if !seen.insert(key.clone()) {
                panic!("cycle detected in LRU list");
            }
            count += 1;
            cur = self.nodes[&key].next.clone();
        }
        count
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
    fn put_then_get_roundtrips() {
        let mut cache = GroupCache::new(10_000);
        cache.put(key(1), tuple(1));
        assert_eq!(cache.get(&key(1)), Some(tuple(1)));
        assert_eq!(cache.list_len(), cache.len());
    }

    #[test]
    fn eviction_is_tail_first() {
        let mut cache = GroupCache::new(entry_size(&tuple(1)) * 2);
        cache.put(key(1), tuple(1));
        cache.put(key(2), tuple(2));
        // Touch key 1 so key 2 becomes LRU.
        cache.get(&key(1));
        cache.put(key(3), tuple(3));
        assert!(cache.get(&key(2)).is_none(), "LRU entry should be evicted");
        assert!(cache.get(&key(1)).is_some());
        assert!(cache.get(&key(3)).is_some());
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let mut cache = GroupCache::new(4);
        assert!(!cache.put(key(1), tuple(1)));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn invariant_available_tracks_maxsize_minus_used() {
        let mut cache = GroupCache::new(10_000);
        for i in 0..20 {
            cache.put(key(i), tuple(i));
        }
        let used: usize = (0..20).map(|i| entry_size(&tuple(i))).sum();
        assert_eq!(cache.bytes_used(), used);
        assert_eq!(cache.available, cache.maxsize - used);
    }
}
