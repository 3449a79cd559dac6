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

//! Cuckoo filter (spec §3, §4.9, following Fan, Andersen, Kaminsky & Mitzenmacher).
//!
//! Four-slot buckets; on a collision the filter displaces an existing
//! fingerprint to its alternate bucket (`bucket XOR low32(murmur(fingerprint))`)
//! and retries, giving up after [`MAX_CUCKOO_COUNT`] relocations.
//! `insert`/`remove`/`contains` are all fully implemented.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::group::murmur3_x64_128;

pub const FINGERPRINTS_PER_BUCKET: usize = 4;
pub const MAX_CUCKOO_COUNT: u32 = 500;

type Bucket = [u8; FINGERPRINTS_PER_BUCKET];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CuckooFilter {
    buckets: Vec<Bucket>,
    num_buckets: usize,
    len: usize,
}

fn fingerprint_of(key: &[u8]) -> u8 {
    let (h0, _) = murmur3_x64_128(key, 0x9747_b28c);
    // Fingerprint must never be 0; 0 marks an empty slot.
    ((h0 & 0xff) as u8).max(1)
}

fn primary_bucket(key: &[u8], num_buckets: usize) -> usize {
    let (h0, _) = murmur3_x64_128(key, 0);
    h0 as usize % num_buckets
}

fn alt_bucket(bucket: usize, fingerprint: u8, num_buckets: usize) -> usize {
    let (h0, _) = murmur3_x64_128(&[fingerprint], 0);
    let low32 = (h0 & 0xffff_ffff) as usize;
    (bucket ^ low32) % num_buckets
}

impl CuckooFilter {
    pub fn new(capacity: usize) -> Self {
        let num_buckets = (capacity / FINGERPRINTS_PER_BUCKET).next_power_of_two().max(2);
        Self {
            buckets: vec![[0u8; FINGERPRINTS_PER_BUCKET]; num_buckets],
            num_buckets,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn bucket_insert(bucket: &mut Bucket, fp: u8) -> bool {
        if let Some(slot) = bucket.iter_mut().find(|s| **s == 0) {
            *slot = fp;
            true
        } else {
            false
        }
    }

    fn bucket_contains(bucket: &Bucket, fp: u8) -> bool {
        bucket.contains(&fp)
    }

    fn bucket_remove(bucket: &mut Bucket, fp: u8) -> bool {
        if let Some(slot) = bucket.iter_mut().find(|s| **s == fp) {
            *slot = 0;
            true
        } else {
            false
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let fp = fingerprint_of(key);
        let i1 = primary_bucket(key, self.num_buckets);
        let i2 = alt_bucket(i1, fp, self.num_buckets);
        Self::bucket_contains(&self.buckets[i1], fp) || Self::bucket_contains(&self.buckets[i2], fp)
    }

    /// Inserts `key`, relocating existing fingerprints as needed (spec
    /// §4.9). Returns `false` once `MAX_CUCKOO_COUNT` relocations are
    /// exhausted without finding a free slot.
    pub fn insert(&mut self, key: &[u8]) -> bool {
        let fp = fingerprint_of(key);
        let i1 = primary_bucket(key, self.num_buckets);
        let i2 = alt_bucket(i1, fp, self.num_buckets);

        if Self::bucket_insert(&mut self.buckets[i1], fp) {
            self.len += 1;
            return true;
        }
        if Self::bucket_insert(&mut self.buckets[i2], fp) {
            self.len += 1;
            return true;
        }

        let mut rng = rand::thread_rng();
        let mut cur_bucket = if rng.gen_bool(0.5) { i1 } else { i2 };
        let mut cur_fp = fp;
        for _ in 0..MAX_CUCKOO_COUNT {
            let slot_idx = rng.gen_range(0..FINGERPRINTS_PER_BUCKET);
            let evicted = self.buckets[cur_bucket][slot_idx];
            self.buckets[cur_bucket][slot_idx] = cur_fp;
            cur_fp = evicted;
            cur_bucket = alt_bucket(cur_bucket, cur_fp, self.num_buckets);
            if Self::bucket_insert(&mut self.buckets[cur_bucket], cur_fp) {
                self.len += 1;
                return true;
            }
        }
        false
    }

    pub fn remove(&mut self, key: &[u8]) -> bool {
        let fp = fingerprint_of(key);
        let i1 = primary_bucket(key, self.num_buckets);
        let i2 = alt_bucket(i1, fp, self.num_buckets);
        if Self::bucket_remove(&mut self.buckets[i1], fp) {
            self.len -= 1;
            return true;
        }
        if Self::bucket_remove(&mut self.buckets[i2], fp) {
            self.len -= 1;
            return true;
        }
        false
    }

    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.buckets.len() * FINGERPRINTS_PER_BUCKET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_contains() {
        let mut cf = CuckooFilter::new(256);
        let keys: Vec<String> = (0..100).map(|i| format!("k{i}")).collect();
        for k in &keys {
            assert!(cf.insert(k.as_bytes()));
        }
        for k in &keys {
            assert!(cf.contains(k.as_bytes()));
        }
    }

    #[test]
    fn remove_makes_key_absent_unless_hash_collision() {
        let mut cf = CuckooFilter::new(64);
        cf.insert(b"a");
        cf.insert(b"b");
        assert!(cf.remove(b"a"));
        assert!(!cf.contains(b"a") || fingerprint_of(b"a") == fingerprint_of(b"b"));
    }

    #[test]
    fn alt_bucket_is_involutive() {
        let num_buckets = 64;
        let fp = 7u8;
        let b1 = 10;
        let b2 = alt_bucket(b1, fp, num_buckets);
        let back = alt_bucket(b2, fp, num_buckets);
        assert_eq!(b1, back);
    }
}
