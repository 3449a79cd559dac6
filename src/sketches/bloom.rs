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

//! Bloom filter (spec §3, §4.9). Sizing: `m = ceil(-n*ln(p)/(ln 2)^2)`,
//! `k = ceil(m*ln2/n)`. Indices are double-hashed from one Murmur3-128
//! evaluation: `h0 + i*h1 mod m` for `i in [0, k)`.

use serde::{Deserialize, Serialize};

use crate::group::murmur3_x64_128;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    m: u64,
    k: u32,
    bits: Vec<u64>,
}

impl BloomFilter {
    pub const DEFAULT_P: f64 = 0.03;
    pub const DEFAULT_N: u64 = 1 << 20;

    pub fn new(p: f64, n: u64) -> Self {
        let n = n.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * p.ln() / (ln2 * ln2)).ceil() as u64;
        let m = m.max(64);
        let k = ((m as f64 / n) * ln2).ceil() as u32;
        let k = k.max(1);
        let words = m.div_ceil(64) as usize;
        Self {
            m,
            k,
            bits: vec![0u64; words],
        }
    }

    pub fn default_sized() -> Self {
        Self::new(Self::DEFAULT_P, Self::DEFAULT_N)
    }

    pub fn m(&self) -> u64 {
        self.m
    }

    pub fn k(&self) -> u32 {
        self.k
    }

    fn indices(&self, key: &[u8]) -> impl Iterator<Item = u64> + '_ {
        let (h0, h1) = murmur3_x64_128(key, 0);
        (0..self.k as u64).map(move |i| h0.wrapping_add(i.wrapping_mul(h1)) % self.m)
    }

    fn set_bit(&mut self, idx: u64) {
        let word = (idx / 64) as usize;
        let bit = idx % 64;
        self.bits[word] |= 1u64 << bit;
    }

    fn get_bit(&self, idx: u64) -> bool {
        let word = (idx / 64) as usize;
        let bit = idx % 64;
        self.bits[word] & (1u64 << bit) != 0
    }

    pub fn add(&mut self, key: &[u8]) {
        for idx in self.indices(key).collect::<Vec<_>>() {
            self.set_bit(idx);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.indices(key).all(|idx| self.get_bit(idx))
    }

    /// Bitwise-OR union; only defined for filters with equal `(m, k)`.
    pub fn union(&mut self, other: &BloomFilter) -> anyhow::Result<()> {
        if self.m != other.m || self.k != other.k {
            anyhow::bail!("cannot union bloom filters with mismatched (m, k)");
        }
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= b;
        }
        Ok(())
    }

    fn popcount(&self) -> u64 {
        self.bits.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// Cardinality estimate: `n_hat = -m*ln(1 - x/m)/k` (spec §4.9).
    pub fn cardinality(&self) -> f64 {
        let x = self.popcount() as f64;
        let m = self.m as f64;
        if x >= m {
            return f64::INFINITY;
        }
        -m * (1.0 - x / m).ln() / self.k as f64
    }

    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.bits.len() * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_all_added() {
        let mut bf = BloomFilter::new(0.01, 1000);
        let items: Vec<String> = (0..1000).map(|i| format!("item-{i}")).collect();
        for item in &items {
            bf.add(item.as_bytes());
        }
        for item in &items {
            assert!(bf.contains(item.as_bytes()));
        }
    }

    #[test]
    fn false_positive_rate_within_bound() {
        let p = 0.03;
        let n = 2000u64;
        let mut bf = BloomFilter::new(p, n);
        for i in 0..n {
            bf.add(&i.to_le_bytes());
        }
        let trials = (n * 10) as usize;
        let mut false_positives = 0usize;
        for i in n..(n + trials as u64) {
            if bf.contains(&i.to_le_bytes()) {
                false_positives += 1;
            }
        }
        let observed_rate = false_positives as f64 / trials as f64;
        assert!(
            observed_rate <= p * 1.1 + 0.01,
            "observed false-positive rate {observed_rate} exceeds bound"
        );
    }

    #[test]
    fn union_requires_matching_params() {
        let mut a = BloomFilter::new(0.01, 100);
        let b = BloomFilter::new(0.05, 500);
        assert!(a.union(&b).is_err());
    }

    #[test]
    fn union_is_equivalent_to_adding_both() {
        let mut a = BloomFilter::new(0.01, 100);
        let mut b = BloomFilter::new(0.01, 100);
        a.add(b"x");
        b.add(b"y");
        a.union(&b).unwrap();
        assert!(a.contains(b"x"));
        assert!(a.contains(b"y"));
    }
}
