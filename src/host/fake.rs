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

//! In-memory reference implementations of the [`super`] traits, used by
//! integration tests that exercise the execution plane end to end without a
//! real host database attached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout;

use super::{HeapAccess, HeapTuple, OutputStreamSink, SequenceSource, WalChange, WalSource, XactBatch};

#[derive(Default)]
pub struct FakeHeap {
    relations: Mutex<HashMap<String, HashMap<i64, HeapTuple>>>,
    next_pk: AtomicI64,
}

impl FakeHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self, relation: &str) -> usize {
        self.relations
            .lock()
            .get(relation)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    pub fn rows(&self, relation: &str) -> Vec<HeapTuple> {
        self.relations
            .lock()
            .get(relation)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HeapAccess for FakeHeap {
    async fn scan(&self, relation: &str) -> anyhow::Result<Vec<HeapTuple>> {
        Ok(self.rows(relation))
    }

    async fn lookup_by_keys(
        &self,
        relation: &str,
        hashes: &[u64],
    ) -> anyhow::Result<Vec<HeapTuple>> {
        let wanted: std::collections::HashSet<u64> = hashes.iter().copied().collect();
        Ok(self
            .rows(relation)
            .into_iter()
            .filter(|t| wanted.contains(&t.key.hash()))
            .collect())
    }

    async fn insert(&self, relation: &str, mut tuple: HeapTuple) -> anyhow::Result<HeapTuple> {
        if tuple.pk.is_none() {
            tuple.pk = Some(self.next_pk.fetch_add(1, Ordering::SeqCst));
        }
        let pk = tuple.pk.unwrap();
        self.relations
            .lock()
            .entry(relation.to_string())
            .or_default()
            .insert(pk, tuple.clone());
        Ok(tuple)
    }

    async fn update(&self, relation: &str, tuple: HeapTuple) -> anyhow::Result<()> {
        let pk = tuple
            .pk
            .ok_or_else(|| anyhow::anyhow!("update requires an existing $pk"))?;
        self.relations
            .lock()
            .entry(relation.to_string())
            .or_default()
            .insert(pk, tuple);
        Ok(())
    }

    async fn delete(&self, relation: &str, pk: i64) -> anyhow::Result<()> {
        if let Some(table) = self.relations.lock().get_mut(relation) {
            table.remove(&pk);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSequences {
    counters: Mutex<HashMap<String, i64>>,
}

impl FakeSequences {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceSource for FakeSequences {
    async fn nextval(&self, sequence: &str) -> anyhow::Result<i64> {
        let mut counters = self.counters.lock();
        let v = counters.entry(sequence.to_string()).or_insert(0);
        *v += 1;
        Ok(*v)
    }
}

/// Records every `(old, new)` pair emitted to a stream, in order, so tests
/// can assert on output-stream contents (spec §8 end-to-end scenarios).
#[derive(Default)]
pub struct FakeOutputStreams {
    streams: Mutex<HashMap<String, Vec<(Option<HeapTuple>, Option<HeapTuple>)>>>,
}

impl FakeOutputStreams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, stream: &str) -> Vec<(Option<HeapTuple>, Option<HeapTuple>)> {
        self.streams.lock().get(stream).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl OutputStreamSink for FakeOutputStreams {
    async fn emit(
        &self,
        stream: &str,
        old: Option<HeapTuple>,
        new: Option<HeapTuple>,
    ) -> anyhow::Result<()> {
        self.streams
            .lock()
            .entry(stream.to_string())
            .or_default()
            .push((old, new));
        Ok(())
    }
}

/// A queue of synthetic WAL transactions a test can push into, consumed by
/// the trigger decoder via [`WalSource::next_transaction`].
#[derive(Default)]
pub struct FakeWalSource {
    queue: Mutex<std::collections::VecDeque<XactBatch>>,
    notify: Notify,
}

impl FakeWalSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, batch: XactBatch) {
        self.queue.lock().push_back(batch);
        self.notify.notify_one();
    }

    pub fn push_change(&self, change: WalChange) {
        self.push(XactBatch {
            changes: vec![change],
        });
    }
}

#[async_trait]
impl WalSource for FakeWalSource {
    async fn next_transaction(
        &self,
        poll_timeout: Duration,
    ) -> anyhow::Result<Option<XactBatch>> {
        if let Some(batch) = self.queue.lock().pop_front() {
            return Ok(Some(batch));
        }
        match timeout(poll_timeout, self.notify.notified()).await {
            Ok(()) => Ok(self.queue.lock().pop_front()),
            Err(_) => Ok(None),
        }
    }
}
