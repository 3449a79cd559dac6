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

//! Grouping-key representation, type-aware byte encoding, and the
//! MurmurHash3 implementation used both for group-hash routing (spec §3:
//! "a 64-bit value computed with a type-aware byte encoding + MurmurHash3")
//! and as the general-purpose hash inside the sketches (spec §4.9).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A host-agnostic scalar value, standing in for the host type system at the
/// seam named in spec §6 (`(type_id, typlen, typbyval, typalign)`). Covers
/// the scalar kinds the sketches and grouping machinery need to hash and
/// compare; a real host binds its own richer type system through
/// [`crate::host::TypeCache`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl ScalarValue {
    /// Type-aware byte encoding (spec §3). Each variant gets a leading tag
    /// byte so distinct types never alias to the same encoding, then a
    /// fixed- or length-prefixed payload.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ScalarValue::Null => out.push(0),
            ScalarValue::Bool(b) => {
                out.push(1);
                out.push(*b as u8);
            }
            ScalarValue::Int64(i) => {
                out.push(2);
                out.extend_from_slice(&i.to_le_bytes());
            }
            ScalarValue::Float64(f) => {
                out.push(3);
                out.extend_from_slice(&f.to_le_bytes());
            }
            ScalarValue::Text(s) => {
                out.push(4);
                out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            ScalarValue::Bytes(b) => {
                out.push(5);
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
        }
    }
}

/// A tuple of grouping-column values (spec §3: "Key: the grouping columns of
/// the CQ"). Empty for CQs without `GROUP BY`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GroupKey(pub Vec<ScalarValue>);

impl GroupKey {
    pub fn empty() -> Self {
        GroupKey(Vec::new())
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for v in &self.0 {
            v.encode(&mut buf);
        }
        buf
    }

    /// The 64-bit group hash used to select a group's owning combiner
    /// (spec §3, §4.3: `hash mod num_combiners`).
    pub fn hash(&self) -> u64 {
        murmur3_x64_128(&self.encode(), 0).0
    }
}

impl Eq for GroupKey {}

impl std::hash::Hash for GroupKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.encode().hash(state);
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match v {
                ScalarValue::Null => write!(f, "null")?,
                ScalarValue::Bool(b) => write!(f, "{b}")?,
                ScalarValue::Int64(i) => write!(f, "{i}")?,
                ScalarValue::Float64(x) => write!(f, "{x}")?,
                ScalarValue::Text(s) => write!(f, "{s:?}")?,
                ScalarValue::Bytes(b) => write!(f, "{b:?}")?,
            }
        }
        write!(f, ")")
    }
}

/// Selects the combiner that owns a group hash (spec §4.3 step 3, §4.4).
pub fn combiner_for_hash(hash: u64, num_combiners: u32) -> u32 {
    (hash % num_combiners as u64) as u32
}

/// Selects the worker that owns a query within a worker's IPC fan-in (spec
/// §4.3 step 3: `query_id mod W == group_id`).
pub fn worker_for_query(query_id: i32, num_workers: u32) -> u32 {
    (query_id.rem_euclid(num_workers as i32)) as u32
}

const C1: u64 = 0x87c3_7b91_1142_53d5;
const C2: u64 = 0x4cf5_ad43_2745_937f;

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

/// MurmurHash3 x64-128, returned as two `u64` halves. Used by group hashing
/// and, with independent seeds, by the Bloom filter's double-hashing scheme
/// (spec §4.9).
pub fn murmur3_x64_128(data: &[u8], seed: u64) -> (u64, u64) {
    let len = data.len();
    let n_blocks = len / 16;
    let mut h1 = seed;
    let mut h2 = seed;

    for i in 0..n_blocks {
        let off = i * 16;
        let mut k1 = u64::from_le_bytes(data[off..off + 8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(data[off + 8..off + 16].try_into().unwrap());

        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2.rotate_left(31);
        h2 = h2.wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = &data[n_blocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    let tail_len = tail.len();
    if tail_len > 8 {
        for i in (8..tail_len).rev() {
            k2 ^= (tail[i] as u64) << ((i - 8) * 8);
        }
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
    }
    if tail_len > 0 {
        for i in (0..tail_len.min(8)).rev() {
            k1 ^= (tail[i] as u64) << (i * 8);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= len as u64;
    h2 ^= len as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    (h1, h2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let k1 = GroupKey(vec![ScalarValue::Text("a".into()), ScalarValue::Int64(1)]);
        let k2 = GroupKey(vec![ScalarValue::Text("a".into()), ScalarValue::Int64(1)]);
        assert_eq!(k1.hash(), k2.hash());
    }

    #[test]
    fn distinct_types_do_not_alias() {
        // Same byte pattern, different declared type: an i64 0 vs an 8-byte
        // text "\0\0\0\0\0\0\0\0" must hash differently because of the tag byte.
        let k1 = GroupKey(vec![ScalarValue::Int64(0)]);
        let k2 = GroupKey(vec![ScalarValue::Bytes(vec![0; 8])]);
        assert_ne!(k1.hash(), k2.hash());
    }

    #[test]
    fn combiner_routing_is_modular() {
        assert_eq!(combiner_for_hash(10, 4), 2);
        assert_eq!(combiner_for_hash(11, 4), 3);
    }

    #[test]
    fn murmur3_matches_known_vector() {
        // Reference vector for seed=0, empty input: both halves are zero.
        assert_eq!(murmur3_x64_128(b"", 0), (0, 0));
    }
}
