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

//! Golomb-coded set (spec §3, §4.9, following Putze, Sanders & Singler).
//! `p` is the inverse false-positive rate (analogous to a Bloom filter's
//! bits-per-element factor, typically `p >= 2`); values are hashed to
//! `[0, ceil(p*n))`. `compress()` merges the uncompressed pending values
//! into the existing sorted run and re-encodes with Golomb parameter
//! `b = floor(log2(p))`: a unary-coded quotient followed by a `b`-bit
//! remainder, delta-coded against the previous sorted value so the stream
//! stays strictly ascending.

use serde::{Deserialize, Serialize};

use crate::group::murmur3_x64_128;

struct BitWriter {
    bits: Vec<bool>,
}

impl BitWriter {
    fn new() -> Self {
        Self { bits: Vec::new() }
    }

    fn push_unary(&mut self, q: u64) {
        for _ in 0..q {
            self.bits.push(true);
        }
        self.bits.push(false);
    }

    fn push_bits(&mut self, value: u64, width: u32) {
        for i in (0..width).rev() {
            self.bits.push((value >> i) & 1 == 1);
        }
    }

    fn into_bytes(self) -> (Vec<u8>, usize) {
        let n_bits = self.bits.len();
        let mut bytes = vec![0u8; n_bits.div_ceil(8)];
        for (i, bit) in self.bits.into_iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (7 - (i % 8));
            }
        }
        (bytes, n_bits)
    }
}

struct BitReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    len: usize,
}

impl<'a> BitReader<'a> {
    fn new(bytes: &'a [u8], len: usize) -> Self {
        Self { bytes, pos: 0, len }
    }

    fn next_bit(&mut self) -> Option<bool> {
        if self.pos >= self.len {
            return None;
        }
        let byte = self.bytes[self.pos / 8];
        let bit = (byte >> (7 - (self.pos % 8))) & 1 == 1;
        self.pos += 1;
        Some(bit)
    }

    fn read_unary(&mut self) -> Option<u64> {
        let mut q = 0u64;
        loop {
            match self.next_bit()? {
                true => q += 1,
                false => return Some(q),
            }
        }
    }

    fn read_bits(&mut self, width: u32) -> Option<u64> {
        let mut v = 0u64;
        for _ in 0..width {
            v = (v << 1) | self.next_bit()? as u64;
        }
        Some(v)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GolombCodedSet {
    p: f64,
    n_estimate: u64,
    modulus: u64,
    pending: Vec<u64>,
    compressed_bytes: Vec<u8>,
    compressed_bit_len: usize,
    compressed_count: usize,
}

impl GolombCodedSet {
    pub fn new(p: f64, n_estimate: u64) -> Self {
        let modulus = ((p * n_estimate.max(1) as f64).ceil() as u64).max(2);
        Self {
            p,
            n_estimate: n_estimate.max(1),
            modulus,
            pending: Vec::new(),
            compressed_bytes: Vec::new(),
            compressed_bit_len: 0,
            compressed_count: 0,
        }
    }

    fn golomb_param(&self) -> u32 {
        (self.p.log2().floor() as i64).max(0) as u32
    }

    fn hash_value(&self, key: &[u8]) -> u64 {
        let (h0, _) = murmur3_x64_128(key, 0);
        h0 % self.modulus
    }

    pub fn insert(&mut self, key: &[u8]) {
        self.pending.push(self.hash_value(key));
    }

    fn decode_all(&self) -> Vec<u64> {
        let b = self.golomb_param();
        let mut reader = BitReader::new(&self.compressed_bytes, self.compressed_bit_len);
        let mut out = Vec::with_capacity(self.compressed_count);
        let mut prev = 0u64;
        for _ in 0..self.compressed_count {
            let q = reader.read_unary().expect("corrupt golomb stream");
            let r = if b > 0 {
                reader.read_bits(b).expect("corrupt golomb stream")
            } else {
                0
            };
            let delta = (q << b) | r;
            let value = prev + delta;
            out.push(value);
            prev = value;
        }
        out
    }

    /// Merges pending + already-compressed values by sorted merge, then
    /// re-encodes (spec §4.9).
    pub fn compress(&mut self) {
        let mut all = self.decode_all();
        all.extend(self.pending.drain(..));
        all.sort_unstable();
        all.dedup();

        let b = self.golomb_param();
        let mut writer = BitWriter::new();
        let mut prev = 0u64;
        for &value in &all {
            let delta = value - prev;
            let (q, r) = if b == 0 {
                (delta, 0)
            } else {
                (delta >> b, delta & ((1u64 << b) - 1))
            };
            writer.push_unary(q);
            if b > 0 {
                writer.push_bits(r, b);
            }
            prev = value;
        }
        let (bytes, bit_len) = writer.into_bytes();
        self.compressed_bytes = bytes;
        self.compressed_bit_len = bit_len;
        self.compressed_count = all.len();
    }

    pub fn is_compressed(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let target = self.hash_value(key);
        if self.pending.contains(&target) {
            return true;
        }
        self.decode_all().binary_search(&target).is_ok()
    }

    /// All distinct inserted hash values, strictly ascending (spec §8).
    pub fn values(&self) -> Vec<u64> {
        self.decode_all()
    }

    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.compressed_bytes.len() + self.pending.len() * 8
    }
}
