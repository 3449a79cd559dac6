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

//! Error kinds for the continuous-query execution plane (see spec §7).
//!
//! Propagation policy:
//! - local recovery (retried or downgraded by the caller):
//!   [`EngineError::BatchFull`], [`EngineError::ConcurrentHeapUpdateBenign`],
//!   combiner per-query failures;
//! - surfaced to the caller: [`EngineError::SchemaMismatch`],
//!   [`EngineError::SubscribeUnknownTrigger`];
//! - fatal (the owning task exits and is restarted by the scheduler):
//!   [`EngineError::OutOfMemory`], [`EngineError::FatalCatalogLookup`].

use crate::catalog::QueryId;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// Packing a tuple into a microbatch would exceed `batch_size_kb`. The
    /// caller flushes the in-progress batch and starts a new one.
    #[error("microbatch is full")]
    BatchFull,

    /// An IPC queue rejected an enqueue because it is at capacity.
    #[error("IPC queue {queue} is backpressured")]
    QueueBackpressure { queue: String },

    /// A sketch or cache could not grow within its configured memory cap.
    #[error("out of memory: {context}")]
    OutOfMemory { context: String },

    /// `combine_table`'s row type doesn't match the materialized relation.
    #[error("schema mismatch for query {query_id}: {detail}")]
    SchemaMismatch { query_id: QueryId, detail: String },

    /// A combiner received a group hash outside its shard.
    #[error("combiner {combiner_id} is not leader for group hash {group_hash}")]
    NotLeaderForSlot { combiner_id: u32, group_hash: u64 },

    #[error("WAL read error: {0}")]
    WalReadError(String),

    #[error("unknown trigger: {0}")]
    SubscribeUnknownTrigger(String),

    #[error("client {0} timed out")]
    ClientTimeout(String),

    #[error("client {0} hit watermark")]
    ClientWatermark(String),

    /// Benign race between the TTL vacuumer and a combiner updating the same
    /// row; the combiner retries the sync.
    #[error("concurrent heap update (benign)")]
    ConcurrentHeapUpdateBenign,

    #[error("fatal catalog lookup failure: {0}")]
    FatalCatalogLookup(String),

    #[error(transparent)]
    Host(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether this error should be handled by aborting only the current
    /// query's sub-transaction and continuing the batch (spec §4.4, §7).
    pub fn is_locally_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::BatchFull | EngineError::ConcurrentHeapUpdateBenign
        )
    }

    /// Whether the owning task must exit so the scheduler can restart it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::OutOfMemory { .. } | EngineError::FatalCatalogLookup(_)
        )
    }
}
