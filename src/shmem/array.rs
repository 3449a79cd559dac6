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

//! A segmented, growing vector suitable for shared-memory-backed storage
//! (spec §2 item 1): appends never invalidate previously returned indices,
//! because growth allocates a new fixed-size segment instead of
//! reallocating and copying the existing ones.

const SEGMENT_LEN: usize = 1024;

pub struct SharedArray<T> {
    segments: Vec<Vec<T>>,
    len: usize,
}

impl<T: Clone> Default for SharedArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SharedArray<T> {
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: T) -> usize {
        let seg_idx = self.len / SEGMENT_LEN;
        if seg_idx == self.segments.len() {
            self.segments.push(Vec::with_capacity(SEGMENT_LEN));
        }
        self.segments[seg_idx].push(value);
        let idx = self.len;
        self.len += 1;
        idx
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        if idx >= self.len {
            return None;
        }
        self.segments[idx / SEGMENT_LEN].get(idx % SEGMENT_LEN)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        if idx >= self.len {
            return None;
        }
        self.segments[idx / SEGMENT_LEN].get_mut(idx % SEGMENT_LEN)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.segments.iter().flatten()
    }
}
