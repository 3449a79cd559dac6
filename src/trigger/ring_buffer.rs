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

//! Per-client mirrored ring buffer for the alert server (spec §4.7, §9
//! "Mirrored ring buffer"). Size is rounded up to a power of two; every
//! byte written at position `p` is duplicated at `p + capacity`, so a read
//! of up to `capacity` bytes starting anywhere in the logical window is a
//! single contiguous slice, never wrapped.

use crate::error::{EngineError, EngineResult};

pub struct MirroredRingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    write_pos: u64,
    read_pos: u64,
}

impl MirroredRingBuffer {
    /// `min_capacity` is rounded up to the next power of two (spec §4.7).
    pub fn new(min_capacity: usize) -> Self {
        let capacity = min_capacity.max(1).next_power_of_two();
        Self {
            buf: vec![0u8; capacity * 2],
            capacity,
            write_pos: 0,
            read_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        (self.write_pos - self.read_pos) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn available(&self) -> usize {
        self.capacity - self.len()
    }

    fn physical(&self, pos: u64) -> usize {
        (pos % self.capacity as u64) as usize
    }

    /// Appends `data`, duplicating each byte at its mirrored offset so the
    /// eventual read is contiguous. Fails with `ClientWatermark` if `data`
    /// would overflow the buffer (spec §4.7 write back-pressure).
    pub fn write(&mut self, client: &str, data: &[u8]) -> EngineResult<()> {
        if data.len() > self.available() {
            return Err(EngineError::ClientWatermark(client.to_string()));
        }
        let start = self.physical(self.write_pos);
        for (i, &b) in data.iter().enumerate() {
            let p = (start + i) % self.capacity;
            self.buf[p] = b;
            self.buf[p + self.capacity] = b;
        }
        self.write_pos += data.len() as u64;
        Ok(())
    }

    /// Returns a contiguous view of up to `len` unread bytes without
    /// consuming them.
    pub fn peek(&self, len: usize) -> &[u8] {
        let len = len.min(self.len());
        let start = self.physical(self.read_pos);
        &self.buf[start..start + len]
    }

    pub fn consume(&mut self, len: usize) {
        self.read_pos += len.min(self.len()) as u64;
    }

    /// Drains every unread byte, consuming them.
    pub fn drain(&mut self) -> Vec<u8> {
        let bytes = self.peek(self.len()).to_vec();
        self.consume(bytes.len());
        bytes
    }
}
