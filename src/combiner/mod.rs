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

//! Combiner executor (spec §4.4): turns partials into idempotent in-place
//! updates on the materialized relation, with at-most-one concurrent sync
//! per group. Read -> select-existing-groups -> filter -> merge -> sync.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, warn};

use crate::cache::{ExistingGroups, GroupCache};
use crate::catalog::{ContinuousQuery, QueryId};
use crate::error::EngineResult;
use crate::group::GroupKey;
use crate::host::{CombinePlan, HeapAccess, OutputStreamSink, SequenceSource};
use crate::ipc::microbatch::PartialTupleState;
use crate::ipc::SlotQueue;
use crate::metrics::EngineMetrics;

/// How long a `Select existing groups` plan may be reused before the next
/// batch re-issues the lookup (spec §4.4 step b).
pub const GROUPS_PLAN_LIFESPAN: Duration = Duration::from_secs(10);

/// Combiner-local per-CQ state: its combine plan plus the bounded LRU of
/// previously-synced groups (spec §3 `GroupCache`, §4.8).
pub struct CombinerQueryState {
    pub cq: ContinuousQuery,
    pub plan: Arc<dyn CombinePlan>,
    pub cache: GroupCache,
}

/// Dense combiner identity within a process group (spec §4.2, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CombinerId {
    pub group_id: u32,
    pub num_combiners: u32,
}

pub struct Combiner<H, S, O> {
    id: CombinerId,
    heap: Arc<H>,
    sequences: Arc<S>,
    output: Arc<O>,
    queries: HashMap<QueryId, CombinerQueryState>,
    metrics: Arc<EngineMetrics>,
}

impl<H, S, O> Combiner<H, S, O>
where
    H: HeapAccess,
    S: SequenceSource,
    O: OutputStreamSink,
{
    pub fn new(
        id: CombinerId,
        heap: Arc<H>,
        sequences: Arc<S>,
        output: Arc<O>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            id,
            heap,
            sequences,
            output,
            queries: HashMap::new(),
            metrics,
        }
    }

    pub fn register_query(&mut self, cq: ContinuousQuery, plan: Arc<dyn CombinePlan>, cache_bytes: usize) {
        let query_id = cq.id;
        self.queries.insert(
            query_id,
            CombinerQueryState {
                cq,
                plan,
                cache: GroupCache::new(cache_bytes),
            },
        );
    }

    /// Processes every distinct `query_id` present in `batch` (spec §4.4
    /// main loop step 2). Partials for groups outside this combiner's shard
    /// are skipped defensively — the worker is expected to have already
    /// sharded correctly (spec §4.3 step 3), so this is a consistency
    /// backstop, not the primary routing mechanism.
    pub async fn process_batch(&mut self, partials: Vec<PartialTupleState>) -> EngineResult<()> {
        let mut by_query: HashMap<QueryId, Vec<PartialTupleState>> = HashMap::new();
        for p in partials {
            by_query.entry(p.query_id).or_default().push(p);
        }

        for (query_id, partials) in by_query {
            if let Err(err) = self.process_query(query_id, partials).await {
                // Eviction and recovery (spec §4.4): abort this query's
                // sub-transaction and continue with the next. Other CQs'
                // state is unaffected.
                error!(query_id = query_id.0, error = %err, "combiner query failed, isolating");
                self.metrics
                    .combiner_query_errors
                    .with_label_values(&[&self.id.group_id.to_string(), &query_id.0.to_string()])
                    .inc();
            }
        }
        Ok(())
    }

    async fn process_query(
        &mut self,
        query_id: QueryId,
        partials: Vec<PartialTupleState>,
    ) -> EngineResult<()> {
        let Some(state) = self.queries.get_mut(&query_id) else {
            warn!(query_id = query_id.0, "combiner has no registered state for query");
            return Ok(());
        };
        let cq = state.cq.clone();

        // a. Read: partials are already drained into `partials`;
        // `group_hashes` is implicit in each partial's `.hash`.

        // b. Select existing groups, consulting the LRU cache first so a
        // hot group's on-disk lookup is skipped (spec §4.8, §4.4 step b).
        let mut existing = ExistingGroups::new();
        let mut lookup_hashes = Vec::new();
        for p in &partials {
            if existing.contains_hash(p.hash) {
                continue;
            }
            if let Some(cached) = state.cache.get(&p.key) {
                existing.populate(p.key.clone(), cached);
            } else {
                lookup_hashes.push(p.hash);
            }
        }
        if !state.cq.zero_group_by() && !lookup_hashes.is_empty() {
            let rows = self.heap.lookup_by_keys(&state.cq.matrel, &lookup_hashes).await?;
            for row in rows {
                existing.populate(row.key.clone(), row);
            }
        } else if state.cq.zero_group_by() {
            let rows = self.heap.scan(&state.cq.matrel).await?;
            if let Some(row) = rows.into_iter().next() {
                existing.populate(row.key.clone(), row);
            }
        }

        // c. Filter by batch groups: group partials by their actual
        // grouping-column key (collision-safe, unlike the hash alone).
        let mut grouped: HashMap<GroupKey, Vec<PartialTupleState>> = HashMap::new();
        for p in partials {
            grouped.entry(p.key.clone()).or_default().push(p);
        }

        // d. Merge + e. Sync.
        for (key, group_partials) in grouped {
            let existing_row = existing.get(&key).cloned();
            existing.mark_added(&key);

            let host_partials: Vec<_> = group_partials
                .iter()
                .map(|p| crate::host::PartialTuple {
                    query_id,
                    key: p.key.clone(),
                    values: p.values.clone(),
                })
                .collect();
            let combined = state.plan.combine(existing_row.as_ref(), &host_partials);

            // `DISTINCT`-qualified (and other never-update) CQs always insert
            // a fresh row, even when a row with the same key already exists
            // (spec §8 boundary case) — `existing_row` only feeds `combine`.
            let (old, new) = if !state.cq.should_update() {
                let inserted = Self::insert_new_group(&self.heap, &self.sequences, &cq, combined).await?;
                (None, Some(inserted))
            } else {
                match &existing_row {
                    Some(existing_row) if state.plan.changed(existing_row, &combined) => {
                        let mut to_write = combined.clone();
                        to_write.pk = existing_row.pk;
                        self.heap.update(&state.cq.matrel, to_write.clone()).await?;
                        (Some(existing_row.clone()), Some(to_write))
                    }
                    Some(existing_row) => {
                        // Unchanged: nothing to sync, but still ack the partials.
                        (Some(existing_row.clone()), Some(existing_row.clone()))
                    }
                    None => {
                        let inserted = Self::insert_new_group(&self.heap, &self.sequences, &cq, combined).await?;
                        (None, Some(inserted))
                    }
                }
            };

            if old.as_ref().map(|o| &o.values) != new.as_ref().map(|n| &n.values) {
                self.output
                    .emit(&state.cq.output_stream, old, new.clone())
                    .await?;
                self.metrics
                    .combiner_groups_synced
                    .with_label_values(&[&self.id.group_id.to_string(), &query_id.0.to_string()])
                    .inc();
            }
            if let Some(new) = new {
                state.cache.put(key, new);
            }

            for p in group_partials {
                p.ack.inc_cacks(1);
            }
        }

        self.metrics
            .combiner_batches_processed
            .with_label_values(&[&self.id.group_id.to_string(), &query_id.0.to_string()])
            .inc();
        Ok(())
    }

    async fn insert_new_group(
        heap: &H,
        sequences: &S,
        cq: &ContinuousQuery,
        combined: crate::host::HeapTuple,
    ) -> EngineResult<crate::host::HeapTuple> {
        let mut to_insert = combined;
        if let Some(seq) = &cq.pk_sequence {
            to_insert.pk = Some(sequences.nextval(seq).await?);
        }
        Ok(heap.insert(&cq.matrel, to_insert).await?)
    }

    /// Drives this combiner slot's main loop (spec §4.4): peek/wait on its
    /// inbound mailbox for up to `max_wait`, merge and sync whatever partials
    /// arrived, and ack them (`inc_cacks` happens inside [`Self::process_query`]).
    /// Exits once `shutdown` is set.
    pub async fn run(
        &mut self,
        inbound: Arc<SlotQueue<PartialTupleState>>,
        max_wait: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                partials = inbound.recv_batch(usize::MAX, max_wait) => {
                    if partials.is_empty() {
                        continue;
                    }
                    if let Err(err) = self.process_batch(partials).await {
                        error!(error = %err, "combiner batch processing failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DatabaseId, QueryKind};
    use crate::group::ScalarValue;
    use crate::host::fake::{FakeHeap, FakeOutputStreams, FakeSequences};
    use crate::ipc::ack::Ack;
    use crate::plan::{CountStarCombine, SumCombine};

    fn cq(id: i32, zero_group_by: bool) -> ContinuousQuery {
        ContinuousQuery {
            id: QueryId(id),
            db_id: DatabaseId(1),
            kind: QueryKind::View,
            matrel: format!("m{id}"),
            output_stream: format!("s{id}"),
            sliding_window: None,
            ttl: None,
            pk_sequence: Some(format!("seq{id}")),
            group_key_indices: if zero_group_by { vec![] } else { vec![0] },
            distinct: false,
            is_aggregate: true,
        }
    }

    #[tokio::test]
    async fn first_batch_inserts_new_group() {
        let heap = Arc::new(FakeHeap::new());
        let seq = Arc::new(FakeSequences::new());
        let output = Arc::new(FakeOutputStreams::new());
        let metrics = Arc::new(EngineMetrics::for_test());

        let mut combiner = Combiner::new(
            CombinerId { group_id: 0, num_combiners: 1 },
            heap.clone(),
            seq,
            output.clone(),
            metrics,
        );
        combiner.register_query(cq(1, false), Arc::new(CountStarCombine), 1 << 20);

        let key = GroupKey(vec![ScalarValue::Text("a".into())]);
        let ack = Arc::new(Ack::new(0, 1));
        let partial = PartialTupleState {
            key: key.clone(),
            values: vec![ScalarValue::Int64(1)],
            ack: ack.clone(),
            hash: key.hash(),
            query_id: QueryId(1),
        };

        combiner.process_batch(vec![partial]).await.unwrap();

        assert_eq!(heap.row_count("m1"), 1);
        assert!(ack.is_satisfied());
        let rows = output.rows("s1");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].0.is_none());
        assert!(rows[0].1.is_some());
    }

    #[tokio::test]
    async fn second_batch_updates_existing_group() {
        let heap = Arc::new(FakeHeap::new());
        let seq = Arc::new(FakeSequences::new());
        let output = Arc::new(FakeOutputStreams::new());
        let metrics = Arc::new(EngineMetrics::for_test());

        let mut combiner = Combiner::new(
            CombinerId { group_id: 0, num_combiners: 1 },
            heap.clone(),
            seq,
            output,
            metrics,
        );
        combiner.register_query(cq(1, false), Arc::new(CountStarCombine), 1 << 20);

        let key = GroupKey(vec![ScalarValue::Text("a".into())]);
        for _ in 0..2 {
            let ack = Arc::new(Ack::new(0, 1));
            let partial = PartialTupleState {
                key: key.clone(),
                values: vec![ScalarValue::Int64(1)],
                ack,
                hash: key.hash(),
                query_id: QueryId(1),
            };
            combiner.process_batch(vec![partial]).await.unwrap();
        }

        assert_eq!(heap.row_count("m1"), 1);
        let rows = heap.rows("m1");
        assert_eq!(rows[0].values, vec![ScalarValue::Int64(2)]);
    }

    #[tokio::test]
    async fn zero_group_by_short_circuits_to_one_row() {
        let heap = Arc::new(FakeHeap::new());
        let seq = Arc::new(FakeSequences::new());
        let output = Arc::new(FakeOutputStreams::new());
        let metrics = Arc::new(EngineMetrics::for_test());

        let mut combiner = Combiner::new(
            CombinerId { group_id: 0, num_combiners: 1 },
            heap.clone(),
            seq,
            output,
            metrics,
        );
        combiner.register_query(cq(2, true), Arc::new(SumCombine), 1 << 20);

        let key = GroupKey::empty();
        let ack = Arc::new(Ack::new(0, 1));
        let partial = PartialTupleState {
            key: key.clone(),
            values: vec![ScalarValue::Float64(5.0)],
            ack,
            hash: key.hash(),
            query_id: QueryId(2),
        };
        combiner.process_batch(vec![partial]).await.unwrap();
        assert_eq!(heap.row_count("m2"), 1);
    }

    #[tokio::test]
    async fn distinct_query_always_inserts_never_updates() {
        let heap = Arc::new(FakeHeap::new());
        let seq = Arc::new(FakeSequences::new());
        let output = Arc::new(FakeOutputStreams::new());
        let metrics = Arc::new(EngineMetrics::for_test());

        let mut combiner = Combiner::new(
            CombinerId { group_id: 0, num_combiners: 1 },
            heap.clone(),
            seq,
            output,
            metrics,
        );
        combiner.register_query(ContinuousQuery { distinct: true, ..cq(3, false) }, Arc::new(CountStarCombine), 1 << 20);

        // Same key, three separate batches: a non-distinct CQ would converge
        // on a single row that gets updated in place (row count staying at
        // 1); a distinct CQ must insert a fresh row every time instead,
        // regardless of the existing row the plan sees.
        let key = GroupKey(vec![ScalarValue::Text("a".into())]);
        for i in 1..=3 {
            let ack = Arc::new(Ack::new(0, 1));
            let partial = PartialTupleState {
                key: key.clone(),
                values: vec![ScalarValue::Int64(1)],
                ack,
                hash: key.hash(),
                query_id: QueryId(3),
            };
            combiner.process_batch(vec![partial]).await.unwrap();
            assert_eq!(heap.row_count("m3"), i, "each batch should add a new row, not update the prior one");
        }

        // Every row got its own surrogate pk from the sequence rather than
        // sharing the first insert's pk via an update.
        let pks: std::collections::HashSet<_> = heap.rows("m3").into_iter().map(|r| r.pk).collect();
        assert_eq!(pks.len(), 3);
    }

    #[tokio::test]
    async fn run_drains_inbound_and_syncs_group() {
        let heap = Arc::new(FakeHeap::new());
        let seq = Arc::new(FakeSequences::new());
        let output = Arc::new(FakeOutputStreams::new());
        let metrics = Arc::new(EngineMetrics::for_test());

        let mut combiner = Combiner::new(
            CombinerId { group_id: 0, num_combiners: 1 },
            heap.clone(),
            seq,
            output,
            metrics,
        );
        combiner.register_query(cq(1, false), Arc::new(CountStarCombine), 1 << 20);

        let inbound: Arc<SlotQueue<PartialTupleState>> = Arc::new(SlotQueue::new(8));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let key = GroupKey(vec![ScalarValue::Text("a".into())]);
        let ack = Arc::new(Ack::new(0, 1));
        inbound
            .sender()
            .send(PartialTupleState {
                key: key.clone(),
                values: vec![ScalarValue::Int64(1)],
                ack: ack.clone(),
                hash: key.hash(),
                query_id: QueryId(1),
            })
            .await
            .unwrap();

        let handle = tokio::spawn(async move {
            combiner.run(inbound, Duration::from_millis(10), shutdown_rx).await;
        });

        for _ in 0..200 {
            if ack.is_satisfied() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(ack.is_satisfied(), "run loop should ack every partial it consumes");
        assert_eq!(heap.row_count("m1"), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
