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

//! Sliding-window overlay (spec §4.5): recomputes instantaneous values over
//! a trailing time window and emits `(old, new)` pairs to the output
//! stream as groups enter/leave the window, via watermark comparison
//! against each group's last-touched tick.

use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::ContinuousQuery;
use crate::error::EngineResult;
use crate::group::GroupKey;
use crate::host::{HeapAccess, HeapTuple, OutputStreamSink, OverlayPlan};
use crate::metrics::EngineMetrics;

/// One step-bucketed matrel row, annotated with its arrival timestamp so
/// window membership can be checked without re-reading the row (spec §3
/// "Sliding-window state": `step_groups`).
#[derive(Debug, Clone)]
struct StepEntry {
    row: HeapTuple,
    arrival_ts_ms: u64,
}

/// An overlay group's last emitted output and the tick it was last touched
/// (spec §3: `overlay_groups`).
#[derive(Debug, Clone)]
struct OverlayEntry {
    row: HeapTuple,
    last_touched_tick: u64,
}

/// Per-CQ sliding-window state (spec §4.5).
pub struct SlidingWindowState {
    cq: ContinuousQuery,
    plan: Arc<dyn OverlayPlan>,
    step_groups: HashMap<GroupKey, StepEntry>,
    overlay_groups: HashMap<GroupKey, OverlayEntry>,
    synced_from_disk: bool,
}

impl SlidingWindowState {
    pub fn new(cq: ContinuousQuery, plan: Arc<dyn OverlayPlan>) -> Self {
        Self {
            cq,
            plan,
            step_groups: HashMap::new(),
            overlay_groups: HashMap::new(),
            synced_from_disk: false,
        }
    }

    fn interval_ms(&self) -> u64 {
        self.cq.sliding_window.expect("sliding-window CQ").interval_ms
    }

    /// Lazily syncs `step_groups` from disk on first tick (spec §4.5 step
    /// 1): scans the matrel for rows with `arrival_timestamp >= now -
    /// interval`.
    pub async fn sync_from_disk_if_needed<H: HeapAccess>(
        &mut self,
        heap: &H,
        now_ms: u64,
    ) -> EngineResult<()> {
        if self.synced_from_disk {
            return Ok(());
        }
        let rows = heap.scan(&self.cq.matrel).await?;
        let interval = self.interval_ms();
        let ts_col = self.cq.sliding_window.expect("sliding-window CQ").arrival_ts_col;
        for row in rows {
            let arrival_ts_ms = match row.values.get(ts_col) {
                Some(crate::group::ScalarValue::Int64(ts)) => *ts as u64,
                _ => now_ms,
            };
            if arrival_ts_ms + interval >= now_ms {
                self.step_groups.insert(
                    row.key.clone(),
                    StepEntry { row, arrival_ts_ms },
                );
            }
        }
        self.synced_from_disk = true;
        Ok(())
    }

    /// Inserts/refreshes a step row just combined by this batch.
    pub fn upsert_step(&mut self, row: HeapTuple, arrival_ts_ms: u64) {
        self.step_groups.insert(row.key.clone(), StepEntry { row, arrival_ts_ms });
    }

    /// Drops step rows outside the window (spec §4.5 step 2).
    fn evict_expired_steps(&mut self, now_ms: u64) {
        let interval = self.interval_ms();
        self.step_groups
            .retain(|_, entry| entry.arrival_ts_ms + interval >= now_ms);
    }

    /// One overlay tick (spec §4.5 steps 2-4): evict expired step rows,
    /// execute the overlay plan, diff against the last emitted row per
    /// group, and expire overlay groups that weren't touched this tick.
    pub async fn tick<O: OutputStreamSink>(
        &mut self,
        output: &O,
        now_ms: u64,
        tick: u64,
        metrics: &EngineMetrics,
    ) -> EngineResult<()> {
        self.evict_expired_steps(now_ms);

        let step_rows: Vec<HeapTuple> = self.step_groups.values().map(|e| e.row.clone()).collect();
        let overlay_rows = self.plan.evaluate(&step_rows);

        for row in overlay_rows {
            let key = row.key.clone();
            match self.overlay_groups.get(&key) {
                Some(existing) if existing.row.values == row.values => {
                    // No change; just mark touched.
                    self.overlay_groups.get_mut(&key).unwrap().last_touched_tick = tick;
                }
                Some(existing) => {
                    let old = existing.row.clone();
                    output
                        .emit(&self.cq.output_stream, Some(old), Some(row.clone()))
                        .await?;
                    self.overlay_groups.insert(
                        key,
                        OverlayEntry {
                            row,
                            last_touched_tick: tick,
                        },
                    );
                }
                None => {
                    output
                        .emit(&self.cq.output_stream, None, Some(row.clone()))
                        .await?;
                    self.overlay_groups.insert(
                        key,
                        OverlayEntry {
                            row,
                            last_touched_tick: tick,
                        },
                    );
                }
            }
        }

        // Step 4: expire overlay groups untouched this tick.
        let expired: Vec<GroupKey> = self
            .overlay_groups
            .iter()
            .filter(|(_, e)| e.last_touched_tick < tick)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = self.overlay_groups.remove(&key) {
                output.emit(&self.cq.output_stream, Some(entry.row), None).await?;
                metrics
                    .sliding_window_groups_expired
                    .with_label_values(&[&self.cq.id.0.to_string()])
                    .inc();
            }
        }
        Ok(())
    }

    pub fn step_group_count(&self) -> usize {
        self.step_groups.len()
    }

    pub fn overlay_group_count(&self) -> usize {
        self.overlay_groups.len()
    }
}

/// Computes the timer bound the combiner's main loop uses when it owns any
/// sliding-window CQs (spec §4.5: `min(step_ms)` across active SW CQs).
pub fn min_step_ms(queries: &[&ContinuousQuery]) -> Option<u64> {
    queries
        .iter()
        .filter_map(|q| q.sliding_window.map(|sw| sw.step_ms))
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DatabaseId, QueryId, QueryKind, SlidingWindowSpec};
    use crate::group::ScalarValue;
    use crate::host::fake::{FakeHeap, FakeOutputStreams};
    use crate::plan::SumOverlay;

    fn sw_cq() -> ContinuousQuery {
        ContinuousQuery {
            id: QueryId(1),
            db_id: DatabaseId(1),
            kind: QueryKind::View,
            matrel: "m1".into(),
            output_stream: "s1".into(),
            sliding_window: Some(SlidingWindowSpec {
                step_ms: 100,
                interval_ms: 1000,
                arrival_ts_col: 1,
            }),
            ttl: None,
            pk_sequence: None,
            group_key_indices: vec![],
            distinct: false,
            is_aggregate: true,
        }
    }

    #[tokio::test]
    async fn emits_new_row_on_first_tick() {
        let output = FakeOutputStreams::new();
        let mut state = SlidingWindowState::new(sw_cq(), Arc::new(SumOverlay { group_key_len: 0 }));
        state.upsert_step(
            HeapTuple {
                pk: Some(1),
                key: GroupKey::empty(),
                values: vec![ScalarValue::Float64(10.0)],
            },
            500,
        );
        let metrics = EngineMetrics::for_test();
        state.tick(&output, 900, 1, &metrics).await.unwrap();
        let rows = output.rows("s1");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].0.is_none());
    }

    #[tokio::test]
    async fn expires_group_once_untouched() {
        let output = FakeOutputStreams::new();
        let mut state = SlidingWindowState::new(sw_cq(), Arc::new(SumOverlay { group_key_len: 0 }));
        state.upsert_step(
            HeapTuple {
                pk: Some(1),
                key: GroupKey::empty(),
                values: vec![ScalarValue::Float64(10.0)],
            },
            500,
        );
        let metrics = EngineMetrics::for_test();
        state.tick(&output, 900, 1, &metrics).await.unwrap();

        // Step row falls out of the window (arrival 500 + interval 1000 < now 2000).
        state.evict_expired_steps(2000);
        state.tick(&output, 2000, 2, &metrics).await.unwrap();

        let rows = output.rows("s1");
        assert_eq!(rows.len(), 2);
        assert!(rows[1].1.is_none(), "expiry emits (old, null)");
    }

    #[tokio::test]
    async fn sync_from_disk_filters_out_of_window_rows() {
        let heap = FakeHeap::new();
        heap.insert(
            "m1",
            HeapTuple {
                pk: Some(1),
                key: GroupKey(vec![ScalarValue::Text("in".into())]),
                values: vec![ScalarValue::Int64(0), ScalarValue::Int64(4500)],
            },
        )
        .await
        .unwrap();
        heap.insert(
            "m1",
            HeapTuple {
                pk: Some(2),
                key: GroupKey(vec![ScalarValue::Text("out".into())]),
                values: vec![ScalarValue::Int64(0), ScalarValue::Int64(0)],
            },
        )
        .await
        .unwrap();

        let mut state = SlidingWindowState::new(sw_cq(), Arc::new(SumOverlay { group_key_len: 0 }));
        state.sync_from_disk_if_needed(&heap, 5000).await.unwrap();
        assert_eq!(state.step_group_count(), 1);
    }

    #[test]
    fn min_step_ms_picks_smallest() {
        let mut a = sw_cq();
        a.sliding_window.as_mut().unwrap().step_ms = 200;
        let mut b = sw_cq();
        b.sliding_window.as_mut().unwrap().step_ms = 50;
        assert_eq!(min_step_ms(&[&a, &b]), Some(50));
    }
}
