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

//! Filtered Space-Saving top-K sketch (spec §3, §4.9).
//!
//! A bitmap counter array of length `h` absorbs weight for values not
//! (yet) monitored; a monitored array of length `m`, always sorted by
//! `(-frequency, error)`, holds the current top-K estimate. A counter
//! bucket's accumulated `alpha` is reset only when the monitored array
//! evicts that bucket's prior occupant — not merely because the bucket
//! gets reused by a different, still-unmonitored value.

use serde::{Deserialize, Serialize};

use crate::group::murmur3_x64_128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoredEntry {
    pub value: Vec<u8>,
    pub frequency: u64,
    pub error: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteredSpaceSaving {
    h: usize,
    m: usize,
    counters: Vec<u64>,
    monitored: Vec<MonitoredEntry>,
}

fn bucket_of(h: usize, value: &[u8]) -> usize {
    let (h0, _) = murmur3_x64_128(value, 0);
    (h0 as usize) % h
}

impl FilteredSpaceSaving {
    pub fn new(h: usize, m: usize) -> Self {
        Self {
            h: h.max(1),
            m: m.max(1),
            counters: vec![0u64; h.max(1)],
            monitored: Vec::with_capacity(m),
        }
    }

    pub fn monitored(&self) -> &[MonitoredEntry] {
        &self.monitored
    }

    pub fn is_sorted(&self) -> bool {
        self.monitored
            .windows(2)
            .all(|w| cmp_entry(&w[0], &w[1]) != std::cmp::Ordering::Greater)
    }

    fn resort(&mut self) {
        self.monitored.sort_by(cmp_entry);
    }

    /// Increment `value`'s estimated frequency by `weight` (spec §4.9).
    pub fn increment(&mut self, value: &[u8], weight: u64) {
        if let Some(pos) = self.monitored.iter().position(|e| e.value == value) {
            self.monitored[pos].frequency += weight;
            self.resort();
            return;
        }

        let bucket = bucket_of(self.h, value);
        let alpha = self.counters[bucket];
        let last_freq = self.monitored.last().map(|e| e.frequency).unwrap_or(0);

        if self.monitored.len() < self.m || alpha + weight >= last_freq {
            if self.monitored.len() >= self.m {
                let evicted = self.monitored.pop().expect("array is at capacity");
                let evicted_bucket = bucket_of(self.h, &evicted.value);
                self.counters[evicted_bucket] = evicted.frequency;
            }
            self.monitored.push(MonitoredEntry {
                value: value.to_vec(),
                frequency: alpha + weight,
                error: alpha,
            });
            self.resort();
        } else {
            self.counters[bucket] += weight;
        }
    }

    pub fn top_k(&self, k: usize) -> &[MonitoredEntry] {
        &self.monitored[..k.min(self.monitored.len())]
    }

    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.counters.len() * 8
            + self
                .monitored
                .iter()
                .map(|e| e.value.len() + 16)
                .sum::<usize>()
    }
}

fn cmp_entry(a: &MonitoredEntry, b: &MonitoredEntry) -> std::cmp::Ordering {
    b.frequency.cmp(&a.frequency).then(a.error.cmp(&b.error))
}
