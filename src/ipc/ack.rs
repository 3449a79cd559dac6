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

//! Shared-memory acknowledgement object (spec §3 "Ack", §4.1). Producers
//! register expected tuple counts; workers/combiners increment the matching
//! counter as they finish processing; the producer busy-waits with
//! exponential back-off until both predicates hold.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::sleep;

use crate::metrics::EngineMetrics;

static NEXT_ACK_ID: AtomicU32 = AtomicU32::new(1);

/// `{id, num_wtups, num_ctups, num_wacks, num_cacks}` (spec §3). The four
/// counters are atomic; `id` is assigned once at construction and never
/// mutated.
pub struct Ack {
    pub id: u32,
    num_wtups: AtomicU32,
    num_ctups: AtomicU32,
    num_wacks: AtomicU32,
    num_cacks: AtomicU32,
}

impl Ack {
    /// Registers a new ack expecting `expected_worker_tups` worker-side and
    /// `expected_combiner_tups` combiner-side increments (spec §4.1).
    pub fn new(expected_worker_tups: u32, expected_combiner_tups: u32) -> Self {
        Self {
            id: NEXT_ACK_ID.fetch_add(1, Ordering::Relaxed),
            num_wtups: AtomicU32::new(expected_worker_tups),
            num_ctups: AtomicU32::new(expected_combiner_tups),
            num_wacks: AtomicU32::new(0),
            num_cacks: AtomicU32::new(0),
        }
    }

    /// A worker increments this by the number of tuples it consumed from
    /// the owning microbatch (spec §3 invariant).
    pub fn inc_wacks(&self, n: u32) {
        self.num_wacks.fetch_add(n, Ordering::AcqRel);
    }

    /// A combiner increments this by the number of tuples it consumed.
    pub fn inc_cacks(&self, n: u32) {
        self.num_cacks.fetch_add(n, Ordering::AcqRel);
    }

    pub fn is_satisfied(&self) -> bool {
        self.num_wacks.load(Ordering::Acquire) >= self.num_wtups.load(Ordering::Acquire)
            && self.num_cacks.load(Ordering::Acquire) >= self.num_ctups.load(Ordering::Acquire)
    }

    /// Busy-waits with exponential back-off (seed 1 ms, spec §4.1) until
    /// both predicates hold. `metrics`/`db_id` are optional observability
    /// hooks; pass `None` to skip them (e.g. in unit tests).
    pub async fn wait(&self, metrics: Option<(&EngineMetrics, &str)>) {
        let mut backoff_ms = 1u64;
        while !self.is_satisfied() {
            if let Some((metrics, db_id)) = metrics {
                metrics.ack_wait_retries.with_label_values(&[db_id]).inc();
            }
            sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = (backoff_ms * 2).min(1000);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn wait_returns_once_both_counters_catch_up() {
        let ack = Arc::new(Ack::new(2, 1));
        let bg = {
            let ack = ack.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                ack.inc_wacks(2);
                ack.inc_cacks(1);
            })
        };
        ack.wait(None).await;
        assert!(ack.is_satisfied());
        bg.await.unwrap();
    }

    #[test]
    fn ids_are_assigned_uniquely() {
        let a = Ack::new(0, 0);
        let b = Ack::new(0, 0);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn zero_expectations_are_satisfied_immediately() {
        let ack = Ack::new(0, 0);
        assert!(ack.is_satisfied());
    }
}
