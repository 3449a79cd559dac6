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

//! External-collaborator contracts (spec §6). The host SQL database itself
//! (parser, planner, heap/index access, transaction manager, expression
//! evaluator) is out of scope; these traits are the narrow seams the
//! execution plane actually calls through, so the plane can be driven and
//! tested without a real database attached.

pub mod fake;

use async_trait::async_trait;

use crate::catalog::QueryId;
use crate::group::GroupKey;

/// One row of a materialized relation: the grouping key plus the aggregate
/// transition states / projected output columns, plus the surrogate `$pk`
/// once assigned (spec §3: `Group`).
#[derive(Debug, Clone, PartialEq)]
pub struct HeapTuple {
    pub pk: Option<i64>,
    pub key: GroupKey,
    pub values: Vec<crate::group::ScalarValue>,
}

/// `heap_open/close`, `heap_insert/update/delete` (spec §6).
#[async_trait]
pub trait HeapAccess: Send + Sync {
    async fn scan(&self, relation: &str) -> anyhow::Result<Vec<HeapTuple>>;
    async fn lookup_by_keys(
        &self,
        relation: &str,
        hashes: &[u64],
    ) -> anyhow::Result<Vec<HeapTuple>>;
    async fn insert(&self, relation: &str, tuple: HeapTuple) -> anyhow::Result<HeapTuple>;
    async fn update(&self, relation: &str, tuple: HeapTuple) -> anyhow::Result<()>;
    async fn delete(&self, relation: &str, pk: i64) -> anyhow::Result<()>;
}

/// `nextval(seqrelid)` for surrogate `$pk` generation (spec §3).
#[async_trait]
pub trait SequenceSource: Send + Sync {
    async fn nextval(&self, sequence: &str) -> anyhow::Result<i64>;
}

/// Where a CQ's `(old, new)` rows land so downstream CQs can read them
/// (spec §3 "output stream", §4.4 step e, §4.5 steps 3-4).
#[async_trait]
pub trait OutputStreamSink: Send + Sync {
    async fn emit(
        &self,
        stream: &str,
        old: Option<HeapTuple>,
        new: Option<HeapTuple>,
    ) -> anyhow::Result<()>;
}

/// A raw row arriving on a source stream, not yet run through any plan.
#[derive(Debug, Clone)]
pub struct StreamRow {
    pub values: Vec<crate::group::ScalarValue>,
    pub arrival_ts_ms: u64,
}

/// The compiled pre-aggregate plan a worker runs per tuple (spec §4.3 step
/// 3). Produces zero or more partial tuples carrying transition states.
pub trait PreAggPlan: Send + Sync {
    fn apply(&self, row: &StreamRow) -> Vec<PartialTuple>;
}

/// A worker-produced intermediate aggregate (spec glossary: "Partial tuple").
#[derive(Debug, Clone)]
pub struct PartialTuple {
    pub query_id: QueryId,
    pub key: GroupKey,
    pub values: Vec<crate::group::ScalarValue>,
}

/// The combine plan: merges partials with existing on-disk rows using
/// `agg_combine_fn` transitions (spec glossary: "Combine plan").
pub trait CombinePlan: Send + Sync {
    /// `existing` is `None` when no matching on-disk row was found.
    fn combine(&self, existing: Option<&HeapTuple>, partials: &[PartialTuple]) -> HeapTuple;

    /// Byte-level compare of non-group, non-pk attributes (spec §4.4 step e).
    fn changed(&self, existing: &HeapTuple, combined: &HeapTuple) -> bool {
        existing.values != combined.values
    }
}

/// The overlay plan: turns step-bucketed rows into instantaneous output rows
/// for a sliding-window CQ (spec glossary: "Overlay plan", §4.5 step 3).
pub trait OverlayPlan: Send + Sync {
    fn evaluate(&self, step_rows: &[HeapTuple]) -> Vec<HeapTuple>;
}

/// A decoded WAL row change (spec §6: `ReorderBufferChange`).
#[derive(Debug, Clone)]
pub enum WalChange {
    Insert { relation: String, new: HeapTuple },
    Update { relation: String, old: HeapTuple, new: HeapTuple },
    Delete { relation: String, old: HeapTuple },
    /// Sentinel used for catalog-sync batches (spec §3: `XactBatch`).
    Noop { relation: String },
}

/// One decoded transaction (spec §3: `XactBatch`).
#[derive(Debug, Clone, Default)]
pub struct XactBatch {
    pub changes: Vec<WalChange>,
}

/// Stands in for `logical_decoding_ctx`'s `{startup, begin_txn, change,
/// commit_txn, shutdown}` callback set (spec §4.6, §6). A real
/// implementation tails the host's WAL; [`fake::FakeWalSource`] lets tests
/// push synthetic transactions.
#[async_trait]
pub trait WalSource: Send + Sync {
    /// Blocks, with the given poll bound, until a transaction is available.
    /// Returns `None` on timeout so the caller can do periodic housekeeping.
    async fn next_transaction(
        &self,
        poll_timeout: std::time::Duration,
    ) -> anyhow::Result<Option<XactBatch>>;
}
