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

//! TTL vacuum (spec §2 item 10, §8 scenario 4): periodic deletion of
//! expired rows from TTL-bearing materialized relations, via a
//! timer-driven rescan of every TTL-bearing continuous query.

use std::sync::Arc;

use tracing::info;

use crate::catalog::{Catalog, ContinuousQuery};
use crate::error::{EngineError, EngineResult};
use crate::group::ScalarValue;
use crate::host::HeapAccess;
use crate::metrics::EngineMetrics;

/// Sweeps every TTL-bearing CQ in `catalog`, deleting matrel rows whose
/// `ttl_column` value is older than `ttl_ms` relative to `now_ms`. A
/// `ConcurrentHeapUpdateBenign` from a racing combiner sync is swallowed
/// (spec §7): the row will be picked up by the next vacuum pass if it's
/// still expired.
pub async fn vacuum<H: HeapAccess>(
    heap: &H,
    catalog: &Catalog,
    now_ms: u64,
    metrics: &EngineMetrics,
) -> EngineResult<usize> {
    let mut total_removed = 0usize;
    for cq in catalog_ttl_queries(catalog) {
        total_removed += vacuum_one(heap, cq, now_ms, metrics).await?;
    }
    Ok(total_removed)
}

fn catalog_ttl_queries(catalog: &Catalog) -> Vec<&ContinuousQuery> {
    catalog.ttl_queries().collect()
}

async fn vacuum_one<H: HeapAccess>(
    heap: &H,
    cq: &ContinuousQuery,
    now_ms: u64,
    metrics: &EngineMetrics,
) -> EngineResult<usize> {
    let Some(ttl) = cq.ttl else { return Ok(0) };
    let rows = heap.scan(&cq.matrel).await?;
    let mut removed = 0usize;
    for row in rows {
        let ts_ms = match row.values.get(ttl.ttl_column) {
            Some(ScalarValue::Int64(ts)) => *ts as u64,
            _ => continue,
        };
        if now_ms.saturating_sub(ts_ms) <= ttl.ttl_ms {
            continue;
        }
        let Some(pk) = row.pk else { continue };
        match heap.delete(&cq.matrel, pk).await {
            Ok(()) => removed += 1,
            Err(err) if is_benign_race(&err) => continue,
            Err(err) => return Err(EngineError::Host(err)),
        }
    }
    if removed > 0 {
        info!(query_id = cq.id.0, removed, "TTL vacuum removed expired rows");
        metrics
            .ttl_rows_vacuumed
            .with_label_values(&[&cq.id.0.to_string()])
            .inc_by(removed as u64);
    }
    Ok(removed)
}

fn is_benign_race(_err: &anyhow::Error) -> bool {
    // A real host surfaces a concurrent-update error distinguishable from
    // a hard failure; this reference plane has no such signal from
    // `anyhow::Error` alone, so it treats every delete error as non-benign.
    false
}

/// Drives periodic vacuuming on an interval, exposed for a scheduler slot
/// to spawn as a background task.
pub struct TtlVacuumer {
    interval_ms: u64,
}

impl TtlVacuumer {
    pub fn new(interval_ms: u64) -> Self {
        Self { interval_ms }
    }

    pub async fn run<H: HeapAccess>(
        &self,
        heap: Arc<H>,
        catalog: Arc<parking_lot::RwLock<Catalog>>,
        metrics: Arc<EngineMetrics>,
        now_ms: impl Fn() -> u64,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(self.interval_ms));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let catalog = catalog.read();
                    if let Err(err) = vacuum(heap.as_ref(), &catalog, now_ms(), &metrics).await {
                        tracing::warn!(error = %err, "TTL vacuum pass failed");
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
