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

//! Count-Min sketch (spec §3, §4.9). `w = ceil(e/eps)`, `d = ceil(ln(1/(1-p)))`.
//! Conservative update: compute the row-wise min, then set each row's cell
//! to `max(current, min + count)`. Merge is cellwise sum; point query is the
//! row-wise min.

use serde::{Deserialize, Serialize};

use crate::group::murmur3_x64_128;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountMinSketch {
    d: usize,
    w: usize,
    table: Vec<u32>,
    total_count: u64,
}

impl CountMinSketch {
    pub fn new(eps: f64, p: f64) -> Self {
        let w = (std::f64::consts::E / eps).ceil() as usize;
        let d = (1.0 / (1.0 - p)).ln().ceil() as usize;
        let w = w.max(1);
        let d = d.max(1);
        Self {
            d,
            w,
            table: vec![0u32; d * w],
            total_count: 0,
        }
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn w(&self) -> usize {
        self.w
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    fn index(&self, row: usize, key: &[u8]) -> usize {
        let (h0, h1) = murmur3_x64_128(key, row as u64);
        let col = (h0 ^ h1.rotate_left((row as u32) % 64)) as usize % self.w;
        row * self.w + col
    }

    /// Conservative update (spec §4.9).
    pub fn add(&mut self, key: &[u8], count: u32) {
        let indices: Vec<usize> = (0..self.d).map(|row| self.index(row, key)).collect();
        let min = indices.iter().map(|&i| self.table[i]).min().unwrap_or(0);
        let target = min.saturating_add(count);
        for &i in &indices {
            if self.table[i] < target {
                self.table[i] = target;
            }
        }
        self.total_count += count as u64;
    }

    pub fn estimate(&self, key: &[u8]) -> u32 {
        (0..self.d)
            .map(|row| self.table[self.index(row, key)])
            .min()
            .unwrap_or(0)
    }

    pub fn merge(&mut self, other: &CountMinSketch) -> anyhow::Result<()> {
        if self.d != other.d || self.w != other.w {
            anyhow::bail!("cannot merge count-min sketches with mismatched (d, w)");
        }
        for (a, b) in self.table.iter_mut().zip(other.table.iter()) {
            *a = a.saturating_add(*b);
        }
        self.total_count += other.total_count;
        Ok(())
    }

    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.table.len() * 4
    }
}
