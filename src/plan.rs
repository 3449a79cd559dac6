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

//! Reference plan implementations. A real deployment plugs in compiled
//! plans from the host's query executor (spec §6: "Query executor: compiled
//! plan with a `TuplestoreScan` leaf"); this module supplies closures-backed
//! stand-ins adequate for embedding and for the integration tests in
//! `tests/`.

use crate::catalog::QueryId;
use crate::group::{GroupKey, ScalarValue};
use crate::host::{CombinePlan, HeapTuple, OverlayPlan, PartialTuple, PreAggPlan, StreamRow};

/// `SELECT <group_keys>, COUNT(*) FROM s GROUP BY <group_keys>`. Each input
/// row becomes a one-tuple-wide partial carrying a transition count of 1.
pub struct CountStarPlan {
    pub query_id: QueryId,
    pub group_key_indices: Vec<usize>,
}

impl PreAggPlan for CountStarPlan {
    fn apply(&self, row: &StreamRow) -> Vec<PartialTuple> {
        let key = GroupKey(
            self.group_key_indices
                .iter()
                .map(|&i| row.values[i].clone())
                .collect(),
        );
        vec![PartialTuple {
            query_id: self.query_id,
            key,
            values: vec![ScalarValue::Int64(1)],
        }]
    }
}

/// Combine plan for `COUNT(*)`: the transition state is additive.
pub struct CountStarCombine;

impl CombinePlan for CountStarCombine {
    fn combine(&self, existing: Option<&HeapTuple>, partials: &[PartialTuple]) -> HeapTuple {
        let base = existing.and_then(|t| t.values.first()).map_or(0, |v| match v {
            ScalarValue::Int64(i) => *i,
            _ => 0,
        });
        let added: i64 = partials
            .iter()
            .map(|p| match &p.values[0] {
                ScalarValue::Int64(i) => *i,
                _ => 0,
            })
            .sum();
        HeapTuple {
            pk: existing.and_then(|t| t.pk),
            key: partials[0].key.clone(),
            values: vec![ScalarValue::Int64(base + added)],
        }
    }
}

/// `SELECT SUM(x) FROM s` with an optional sliding-window, zero-group-by
/// variant used by end-to-end scenario 2.
pub struct SumPlan {
    pub query_id: QueryId,
    pub value_col: usize,
    pub group_key_indices: Vec<usize>,
}

impl PreAggPlan for SumPlan {
    fn apply(&self, row: &StreamRow) -> Vec<PartialTuple> {
        let key = GroupKey(
            self.group_key_indices
                .iter()
                .map(|&i| row.values[i].clone())
                .collect(),
        );
        vec![PartialTuple {
            query_id: self.query_id,
            key,
            values: vec![row.values[self.value_col].clone()],
        }]
    }
}

pub struct SumCombine;

impl CombinePlan for SumCombine {
    fn combine(&self, existing: Option<&HeapTuple>, partials: &[PartialTuple]) -> HeapTuple {
        fn as_f64(v: &ScalarValue) -> f64 {
            match v {
                ScalarValue::Int64(i) => *i as f64,
                ScalarValue::Float64(f) => *f,
                _ => 0.0,
            }
        }
        let base = existing.and_then(|t| t.values.first()).map_or(0.0, as_f64);
        let added: f64 = partials.iter().map(|p| as_f64(&p.values[0])).sum();
        HeapTuple {
            pk: existing.and_then(|t| t.pk),
            key: partials[0].key.clone(),
            values: vec![ScalarValue::Float64(base + added)],
        }
    }
}

/// Sums step-bucketed rows into one instantaneous overlay row per group
/// (spec §4.5 step 3), keyed by the rows' existing grouping key.
pub struct SumOverlay {
    pub group_key_len: usize,
}

impl OverlayPlan for SumOverlay {
    fn evaluate(&self, step_rows: &[HeapTuple]) -> Vec<HeapTuple> {
        use std::collections::HashMap;
        let mut sums: HashMap<GroupKey, f64> = HashMap::new();
        for row in step_rows {
            let sum = sums.entry(row.key.clone()).or_insert(0.0);
            for v in &row.values {
                if let ScalarValue::Float64(f) = v {
                    *sum += f;
                } else if let ScalarValue::Int64(i) = v {
                    *sum += *i as f64;
                }
            }
        }
        sums.into_iter()
            .map(|(key, sum)| HeapTuple {
                pk: None,
                key,
                values: vec![ScalarValue::Float64(sum)],
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_star_accumulates() {
        let plan = CountStarPlan {
            query_id: QueryId(1),
            group_key_indices: vec![0],
        };
        let row = StreamRow {
            values: vec![ScalarValue::Text("a".into())],
            arrival_ts_ms: 0,
        };
        let partials = plan.apply(&row);
        assert_eq!(partials.len(), 1);

        let combine = CountStarCombine;
        let combined = combine.combine(None, &partials);
        assert_eq!(combined.values, vec![ScalarValue::Int64(1)]);
        let combined2 = combine.combine(Some(&combined), &partials);
        assert_eq!(combined2.values, vec![ScalarValue::Int64(2)]);
    }

    #[test]
    fn sum_overlay_aggregates_step_rows() {
        let overlay = SumOverlay { group_key_len: 0 };
        let key = GroupKey::empty();
        let rows = vec![
            HeapTuple {
                pk: None,
                key: key.clone(),
                values: vec![ScalarValue::Float64(10.0)],
            },
            HeapTuple {
                pk: None,
                key: key.clone(),
                values: vec![ScalarValue::Float64(20.0)],
            },
        ];
        let out = overlay.evaluate(&rows);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].values, vec![ScalarValue::Float64(30.0)]);
    }
}
