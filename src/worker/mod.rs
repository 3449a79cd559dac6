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

//! Worker executor (spec §4.3): evaluates compiled pre-aggregate plans over
//! arriving stream tuples and hash-shards the resulting partials to their
//! owning combiner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::catalog::{Catalog, QueryId};
use crate::group::{combiner_for_hash, worker_for_query};
use crate::host::PreAggPlan;
use crate::ipc::microbatch::{CombinerBatch, PartialTupleState, StreamTupleState, WorkerBatch};
use crate::ipc::{Microbatch, MultiQueue, SlotQueue};
use crate::metrics::EngineMetrics;

/// A worker slot's per-CQ cached plan state (spec §4.3 step 2: "Retrieve
/// cached `ContQueryState` (memory contexts, plans)"). Plans themselves are
/// supplied externally since they're compiled by the host's query executor
/// (spec §6).
pub struct ContQueryState {
    pub plan: Arc<dyn PreAggPlan>,
}

/// Dense worker identity within a process group (spec §4.2, §4.3 step 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerId {
    pub group_id: u32,
    pub num_workers: u32,
}

/// Runs one worker's main loop body for a single batch (spec §4.3). Not a
/// `tokio::spawn`-driving loop itself — [`crate::scheduler::ProcessGroup`]
/// owns the task lifecycle; this is the per-batch unit of work a worker
/// slot's loop calls repeatedly.
pub struct Worker {
    id: WorkerId,
    queries: HashMap<QueryId, ContQueryState>,
    metrics: Arc<EngineMetrics>,
}

impl Worker {
    pub fn new(id: WorkerId, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            id,
            queries: HashMap::new(),
            metrics,
        }
    }

    pub fn register_query(&mut self, query_id: QueryId, plan: Arc<dyn PreAggPlan>) {
        self.queries.insert(query_id, ContQueryState { plan });
    }

    pub fn drop_query(&mut self, query_id: QueryId) {
        self.queries.remove(&query_id);
    }

    /// Processes one worker batch: for each target query this worker owns
    /// (`query_id mod W == group_id`), executes its pre-agg plan and
    /// hash-shards the resulting partials into `outbound`, one combiner
    /// batch per combiner slot (spec §4.3 steps 2-3).
    ///
    /// Returns the number of tuples consumed, which the caller uses to
    /// increment the owning ack's `num_wacks` (spec §4.3 step 4).
    pub fn process_batch(
        &self,
        batch: &WorkerBatch,
        catalog: &Catalog,
        num_combiners: u32,
        outbound: &mut HashMap<u32, CombinerBatch>,
        cap_bytes: usize,
    ) -> usize {
        let db_id = self
            .queries
            .keys()
            .next()
            .and_then(|q| catalog.query(*q))
            .map(|cq| cq.db_id.0.to_string())
            .unwrap_or_default();

        let mut consumed = 0usize;
        for tuple in batch.tuples() {
            for &query_id in &tuple.query_bitset {
                if worker_for_query(query_id.0, self.id.num_workers) != self.id.group_id {
                    continue;
                }
                let Some(state) = self.queries.get(&query_id) else {
                    continue;
                };
                let partials = state.plan.apply(&tuple.row);
                for partial in partials {
                    let hash = partial.key.hash();
                    let combiner = combiner_for_hash(hash, num_combiners);
                    let out_batch = outbound.entry(combiner).or_default();
                    let pushed = out_batch.try_push(
                        PartialTupleState {
                            key: partial.key,
                            values: partial.values,
                            ack: tuple.ack.clone(),
                            hash,
                            query_id: partial.query_id,
                        },
                        cap_bytes,
                    );
                    if pushed.is_ok() {
                        consumed += 1;
                    }
                }
            }
            // This worker slot has now done everything it will ever do with
            // `tuple`, whether or not it owned a matching query (spec §4.1:
            // "Σ num_wacks = Σ num_wtups for every completed ack").
            tuple.ack.inc_wacks(1);
            self.metrics
                .worker_tuples_processed
                .with_label_values(&[&db_id, &self.id.group_id.to_string()])
                .inc();
        }
        self.metrics
            .worker_batches_processed
            .with_label_values(&[&db_id, &self.id.group_id.to_string()])
            .inc();
        consumed
    }

    /// Flushes `outbound` batches into a combiner `MultiQueue`, as the last
    /// step of a worker iteration (spec §4.3 step 3's enqueue).
    pub fn flush_outbound(
        outbound: HashMap<u32, CombinerBatch>,
        queue: &MultiQueue<CombinerBatch>,
    ) {
        for (combiner, batch) in outbound {
            if !batch.is_empty() {
                let _ = queue.try_send(combiner, batch);
            }
        }
    }

    /// Drives this worker slot's main loop (spec §4.3): peek/wait on its
    /// inbound mailbox for up to `max_wait`, process whatever arrived, and
    /// flush the resulting partials to the combiners' multi-queue. Exits
    /// once `shutdown` is set.
    pub async fn run(
        &self,
        inbound: Arc<SlotQueue<StreamTupleState>>,
        outbound_queue: Arc<MultiQueue<CombinerBatch>>,
        catalog: Arc<RwLock<Catalog>>,
        num_combiners: u32,
        cap_bytes: usize,
        max_wait: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                tuples = inbound.recv_batch(usize::MAX, max_wait) => {
                    if tuples.is_empty() {
                        continue;
                    }
                    let mut batch = WorkerBatch::new();
                    for tuple in tuples {
                        let _ = batch.try_push(tuple, cap_bytes);
                    }
                    let mut outbound = HashMap::new();
                    {
                        let catalog = catalog.read();
                        self.process_batch(&batch, &catalog, num_combiners, &mut outbound, cap_bytes);
                    }
                    Self::flush_outbound(outbound, &outbound_queue);
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
    use crate::catalog::{ContinuousQuery, DatabaseEntry, DatabaseId, QueryKind};
    use crate::group::ScalarValue;
    use crate::host::StreamRow;
    use crate::ipc::ack::Ack;
    use crate::ipc::microbatch::StreamTupleState;
    use crate::plan::CountStarPlan;

    fn cq(id: i32) -> ContinuousQuery {
        ContinuousQuery {
            id: QueryId(id),
            db_id: DatabaseId(1),
            kind: QueryKind::View,
            matrel: "m".into(),
            output_stream: "s".into(),
            sliding_window: None,
            ttl: None,
            pk_sequence: None,
            group_key_indices: vec![0],
            distinct: false,
            is_aggregate: true,
        }
    }

    #[test]
    fn process_batch_shards_partials_by_group_hash() {
        let mut catalog = Catalog::new();
        catalog.register_database(DatabaseEntry {
            db_id: DatabaseId(1),
            cq_enabled: true,
        });
        catalog.register_query(cq(1));

        let mut worker = Worker::new(
            WorkerId {
                group_id: 0,
                num_workers: 1,
            },
            Arc::new(EngineMetrics::for_test()),
        );
        worker.register_query(
            QueryId(1),
            Arc::new(CountStarPlan {
                query_id: QueryId(1),
                group_key_indices: vec![0],
            }),
        );

        let ack = Arc::new(Ack::new(1, 1));
        let mut batch = WorkerBatch::new();
        batch
            .try_push(
                StreamTupleState {
                    row: StreamRow {
                        values: vec![ScalarValue::Text("a".into())],
                        arrival_ts_ms: 0,
                    },
                    ack,
                    query_bitset: vec![QueryId(1)],
                },
                1 << 20,
            )
            .unwrap();

        let mut outbound = HashMap::new();
        let consumed = worker.process_batch(&batch, &catalog, 4, &mut outbound, 1 << 20);
        assert_eq!(consumed, 1);
        assert_eq!(outbound.values().map(|b| b.len()).sum::<usize>(), 1);
    }

    #[test]
    fn worker_ignores_queries_outside_its_shard() {
        let worker = Worker::new(
            WorkerId {
                group_id: 1,
                num_workers: 2,
            },
            Arc::new(EngineMetrics::for_test()),
        );
        // query_id 2 mod 2 == 0, not this worker's group_id 1.
        assert_ne!(worker_for_query(2, 2), worker.id.group_id);
    }

    #[tokio::test]
    async fn run_drains_inbound_and_acks_every_tuple() {
        let mut catalog = Catalog::new();
        catalog.register_database(DatabaseEntry {
            db_id: DatabaseId(1),
            cq_enabled: true,
        });
        catalog.register_query(cq(1));
        let catalog = Arc::new(RwLock::new(catalog));

        let mut worker = Worker::new(
            WorkerId {
                group_id: 0,
                num_workers: 1,
            },
            Arc::new(EngineMetrics::for_test()),
        );
        worker.register_query(
            QueryId(1),
            Arc::new(CountStarPlan {
                query_id: QueryId(1),
                group_key_indices: vec![0],
            }),
        );

        let inbound: Arc<SlotQueue<StreamTupleState>> = Arc::new(SlotQueue::new(8));
        let outbound_queue: Arc<MultiQueue<CombinerBatch>> = Arc::new(MultiQueue::new(1, 8));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ack = Arc::new(Ack::new(1, 0));
        inbound
            .sender()
            .send(StreamTupleState {
                row: StreamRow {
                    values: vec![ScalarValue::Text("a".into())],
                    arrival_ts_ms: 0,
                },
                ack: ack.clone(),
                query_bitset: vec![QueryId(1)],
            })
            .await
            .unwrap();

        let handle = {
            let inbound = inbound.clone();
            let outbound_queue = outbound_queue.clone();
            let catalog = catalog.clone();
            tokio::spawn(async move {
                worker
                    .run(
                        inbound,
                        outbound_queue,
                        catalog,
                        1,
                        1 << 20,
                        Duration::from_millis(10),
                        shutdown_rx,
                    )
                    .await;
            })
        };

        for _ in 0..200 {
            if ack.is_satisfied() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(ack.is_satisfied(), "run loop should ack every tuple it consumes");

        let flushed = outbound_queue
            .slot(0)
            .recv_batch(8, Duration::from_millis(200))
            .await;
        assert_eq!(flushed.len(), 1, "the consumed tuple's partial should reach the combiner queue");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
