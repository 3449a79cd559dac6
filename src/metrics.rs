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

//! Prometheus metrics for the execution plane: one label-vectored
//! counter/gauge per observable quantity, labeled by database and
//! worker/combiner slot.

use prometheus::core::{AtomicI64, AtomicU64, GenericCounterVec, GenericGaugeVec};
use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, Registry,
};

#[derive(Clone)]
pub struct EngineMetrics {
    pub worker_batches_processed: GenericCounterVec<AtomicU64>,
    pub worker_tuples_processed: GenericCounterVec<AtomicU64>,
    pub combiner_batches_processed: GenericCounterVec<AtomicU64>,
    pub combiner_groups_synced: GenericCounterVec<AtomicU64>,
    pub combiner_query_errors: GenericCounterVec<AtomicU64>,
    pub ack_wait_retries: GenericCounterVec<AtomicU64>,
    pub group_cache_hits: GenericCounterVec<AtomicU64>,
    pub group_cache_misses: GenericCounterVec<AtomicU64>,
    pub group_cache_bytes_used: GenericGaugeVec<AtomicI64>,
    pub sketch_bytes_estimated: GenericGaugeVec<AtomicI64>,
    pub trigger_fires: GenericCounterVec<AtomicU64>,
    pub alert_server_clients: GenericGaugeVec<AtomicI64>,
    pub sliding_window_groups_expired: GenericCounterVec<AtomicU64>,
    pub ttl_rows_vacuumed: GenericCounterVec<AtomicU64>,
}

impl EngineMetrics {
    pub fn new(registry: &Registry) -> anyhow::Result<Self> {
        Ok(Self {
            worker_batches_processed: register_int_counter_vec_with_registry!(
                "contstream_worker_batches_processed",
                "Number of microbatches a worker has processed",
                &["db_id", "worker_id"],
                registry
            )?,
            worker_tuples_processed: register_int_counter_vec_with_registry!(
                "contstream_worker_tuples_processed",
                "Number of stream tuples a worker has processed",
                &["db_id", "worker_id"],
                registry
            )?,
            combiner_batches_processed: register_int_counter_vec_with_registry!(
                "contstream_combiner_batches_processed",
                "Number of microbatches a combiner has processed",
                &["db_id", "combiner_id"],
                registry
            )?,
            combiner_groups_synced: register_int_counter_vec_with_registry!(
                "contstream_combiner_groups_synced",
                "Number of group rows synced to the materialized relation",
                &["db_id", "query_id"],
                registry
            )?,
            combiner_query_errors: register_int_counter_vec_with_registry!(
                "contstream_combiner_query_errors",
                "Number of per-query combine failures isolated and recovered from",
                &["db_id", "query_id"],
                registry
            )?,
            ack_wait_retries: register_int_counter_vec_with_registry!(
                "contstream_ack_wait_retries",
                "Number of exponential-backoff retries while waiting on an ack",
                &["db_id"],
                registry
            )?,
            group_cache_hits: register_int_counter_vec_with_registry!(
                "contstream_group_cache_hits",
                "Group cache hits",
                &["db_id", "combiner_id"],
                registry
            )?,
            group_cache_misses: register_int_counter_vec_with_registry!(
                "contstream_group_cache_misses",
                "Group cache misses",
                &["db_id", "combiner_id"],
                registry
            )?,
            group_cache_bytes_used: register_int_gauge_vec_with_registry!(
                "contstream_group_cache_bytes_used",
                "Bytes currently held by the group cache",
                &["db_id", "combiner_id"],
                registry
            )?,
            sketch_bytes_estimated: register_int_gauge_vec_with_registry!(
                "contstream_sketch_bytes_estimated",
                "Estimated byte size of a sketch transition state",
                &["query_id", "kind"],
                registry
            )?,
            trigger_fires: register_int_counter_vec_with_registry!(
                "contstream_trigger_fires",
                "Number of times a trigger's WHEN predicate matched",
                &["query_id", "trigger"],
                registry
            )?,
            alert_server_clients: register_int_gauge_vec_with_registry!(
                "contstream_alert_server_clients",
                "Connected alert-server clients",
                &["db_id"],
                registry
            )?,
            sliding_window_groups_expired: register_int_counter_vec_with_registry!(
                "contstream_sliding_window_groups_expired",
                "Sliding-window overlay groups expired out of the window",
                &["query_id"],
                registry
            )?,
            ttl_rows_vacuumed: register_int_counter_vec_with_registry!(
                "contstream_ttl_rows_vacuumed",
                "Rows removed by the TTL vacuum",
                &["query_id"],
                registry
            )?,
        })
    }

    /// Test/embedding helper: a metrics instance registered against a
    /// private registry, so repeated construction in unit tests doesn't
    /// collide with the global default registry.
    pub fn for_test() -> Self {
        Self::new(&Registry::new()).expect("metric registration cannot fail on a fresh registry")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_without_collision() {
        let m = EngineMetrics::for_test();
        m.worker_batches_processed
            .with_label_values(&["1", "0"])
            .inc();
        assert_eq!(
            m.worker_batches_processed
                .with_label_values(&["1", "0"])
                .get(),
            1
        );
    }
}
