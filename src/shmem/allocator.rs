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

//! A single arena with a per-chunk free-list (spec §5). Chunks are
//! identified by opaque handles so callers never hold a raw offset across an
//! allocation that could move the backing buffer.

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkHandle(usize);

#[derive(Debug)]
struct FreeSpan {
    offset: usize,
    len: usize,
}

struct Inner {
    buf: Vec<u8>,
    capacity: usize,
    used: usize,
    free_list: Vec<FreeSpan>,
    live: std::collections::HashMap<usize, (usize, usize)>, // handle id -> (offset, len)
    next_handle: usize,
}

/// Bounded arena allocator. `alloc` fails with `None` rather than growing,
/// matching the fixed-size shared-memory segment the host database
/// preallocates (spec §5, §7 `OutOfMemory`).
pub struct Arena {
    inner: Mutex<Inner>,
}

impl Arena {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: vec![0u8; capacity],
                capacity,
                used: 0,
                free_list: vec![FreeSpan {
                    offset: 0,
                    len: capacity,
                }],
                live: std::collections::HashMap::new(),
                next_handle: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn used(&self) -> usize {
        self.inner.lock().used
    }

    pub fn available(&self) -> usize {
        let inner = self.inner.lock();
        inner.capacity - inner.used
    }

    /// First-fit allocation out of the free-list; `None` on exhaustion.
    pub fn alloc(&self, len: usize) -> Option<ChunkHandle> {
        let mut inner = self.inner.lock();
        let span_idx = inner
            .free_list
            .iter()
            .position(|span| span.len >= len)?;
        let span = &mut inner.free_list[span_idx];
        let offset = span.offset;
        if span.len == len {
            inner.free_list.remove(span_idx);
        } else {
            span.offset += len;
            span.len -= len;
        }
        let id = inner.next_handle;
        inner.next_handle += 1;
        inner.live.insert(id, (offset, len));
        inner.used += len;
        Some(ChunkHandle(id))
    }

    pub fn free(&self, handle: ChunkHandle) {
        let mut inner = self.inner.lock();
        if let Some((offset, len)) = inner.live.remove(&handle.0) {
            inner.used -= len;
            inner.free_list.push(FreeSpan { offset, len });
            coalesce(&mut inner.free_list);
        }
    }

    pub fn write(&self, handle: ChunkHandle, data: &[u8]) {
        let mut inner = self.inner.lock();
        let (offset, len) = inner.live[&handle.0];
        assert!(data.len() <= len, "write exceeds chunk bounds");
        inner.buf[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn read(&self, handle: ChunkHandle) -> Vec<u8> {
        let inner = self.inner.lock();
        let (offset, len) = inner.live[&handle.0];
        inner.buf[offset..offset + len].to_vec()
    }

    pub fn chunk_len(&self, handle: ChunkHandle) -> usize {
        self.inner.lock().live[&handle.0].1
    }
}

fn coalesce(free_list: &mut Vec<FreeSpan>) {
    free_list.sort_by_key(|s| s.offset);
    let mut merged: Vec<FreeSpan> = Vec::with_capacity(free_list.len());
    for span in free_list.drain(..) {
        if let Some(last) = merged.last_mut() {
            if last.offset + last.len == span.offset {
                last.len += span.len;
                continue;
            }
        }
        merged.push(span);
    }
    *free_list = merged;
}
