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

//! Catalog: one persisted row per continuous query and per participating
//! database (spec §3, §6). Definitions never mutate after creation; a
//! definition change is a drop + recreate at the catalog layer.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Dense, stable-within-a-database identifier for a continuous query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(pub i32);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseId(pub i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    View,
    Transform,
}

/// Sliding-window parameters for a CQ (spec §3, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidingWindowSpec {
    pub step_ms: u64,
    pub interval_ms: u64,
    /// Index, in the CQ's input row, of the arrival-timestamp column.
    pub arrival_ts_col: usize,
}

/// TTL parameters for a CQ's materialized relation (spec §2 item 10,
/// end-to-end scenario 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlSpec {
    pub ttl_ms: u64,
    pub ttl_column: usize,
}

/// A trigger's `WHEN` predicate, already rewritten so `OLD`/`NEW` column
/// references are plain indices into a matrel row (spec §4.6: "rewrite
/// `OLD`/`NEW` var-refs to `INNER_VAR`/`OUTER_VAR`"). Only the shapes this
/// plane's end-to-end scenarios exercise are modeled; a host compiling a
/// richer `tgqual` expression tree would supply additional variants here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TriggerPredicate {
    /// No `WHEN` clause: fires on every change.
    Always,
    /// `NEW.<column> > <threshold>`.
    NewColumnGreaterThan { column: usize, threshold: i64 },
}

impl TriggerPredicate {
    pub fn matches(&self, new: Option<&crate::host::HeapTuple>) -> bool {
        match self {
            TriggerPredicate::Always => true,
            TriggerPredicate::NewColumnGreaterThan { column, threshold } => {
                let Some(new) = new else { return false };
                matches!(
                    new.values.get(*column),
                    Some(crate::group::ScalarValue::Int64(v)) if v > threshold
                )
            }
        }
    }
}

/// One registered trigger on a CQ's output (spec §3 "TrigInfo", §4.6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDef {
    /// Stand-in for the host's `tgoid`; stable identity across diffs.
    pub tgoid: i64,
    pub name: String,
    pub query_id: QueryId,
    pub when: TriggerPredicate,
}

/// A compiled registration of one continuous view (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuousQuery {
    pub id: QueryId,
    pub db_id: DatabaseId,
    pub kind: QueryKind,
    /// Relation name backing the materialized aggregate table.
    pub matrel: String,
    /// Logical relation other queries may read the CQ's (old, new) output from.
    pub output_stream: String,
    pub sliding_window: Option<SlidingWindowSpec>,
    pub ttl: Option<TtlSpec>,
    /// Sequence used for surrogate `$pk` generation; `None` when the CQ has a
    /// natural key (e.g. GROUP BY columns already uniquely identify a row).
    pub pk_sequence: Option<String>,
    /// Indices, in the CQ's partial-tuple schema, of the grouping columns.
    /// Empty for CQs without `GROUP BY`.
    pub group_key_indices: Vec<usize>,
    /// `DISTINCT`-qualified CQs never update an existing row in place (spec
    /// §8 boundary case): every partial inserts.
    pub distinct: bool,
    /// Whether this CQ has any aggregate at all, vs. a pure transform.
    pub is_aggregate: bool,
}

impl ContinuousQuery {
    pub fn zero_group_by(&self) -> bool {
        self.group_key_indices.is_empty()
    }

    pub fn should_update(&self) -> bool {
        self.is_aggregate && !self.distinct
    }
}

/// One catalog row per database participating in continuous-query execution
/// (spec §6: `dbid, cq_enabled`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub db_id: DatabaseId,
    pub cq_enabled: bool,
}

/// In-memory view of the catalog. A real deployment persists this via the
/// host database's own catalog tables (spec §6); this struct is the shape
/// the scheduler and combiners read from after the host notifies them of a
/// refresh.
#[derive(Debug, Default)]
pub struct Catalog {
    queries: HashMap<QueryId, ContinuousQuery>,
    databases: HashMap<DatabaseId, DatabaseEntry>,
    triggers: HashMap<QueryId, Vec<TriggerDef>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_database(&mut self, entry: DatabaseEntry) {
        self.databases.insert(entry.db_id, entry);
    }

    pub fn databases(&self) -> impl Iterator<Item = &DatabaseEntry> {
        self.databases.values()
    }

    pub fn register_query(&mut self, cq: ContinuousQuery) {
        self.queries.insert(cq.id, cq);
    }

    pub fn drop_query(&mut self, id: QueryId) -> Option<ContinuousQuery> {
        self.queries.remove(&id)
    }

    pub fn query(&self, id: QueryId) -> Option<&ContinuousQuery> {
        self.queries.get(&id)
    }

    pub fn queries_for_db(&self, db_id: DatabaseId) -> impl Iterator<Item = &ContinuousQuery> {
        self.queries.values().filter(move |q| q.db_id == db_id)
    }

    pub fn sliding_window_queries(&self) -> impl Iterator<Item = &ContinuousQuery> {
        self.queries.values().filter(|q| q.sliding_window.is_some())
    }

    pub fn ttl_queries(&self) -> impl Iterator<Item = &ContinuousQuery> {
        self.queries.values().filter(|q| q.ttl.is_some())
    }

    /// The CQ whose materialized relation is named `matrel`, if any (spec
    /// §4.6: "for every touched relation identified as a matrel").
    pub fn query_by_matrel(&self, matrel: &str) -> Option<&ContinuousQuery> {
        self.queries.values().find(|q| q.matrel == matrel)
    }

    pub fn register_trigger(&mut self, trigger: TriggerDef) {
        self.triggers.entry(trigger.query_id).or_default().push(trigger);
    }

    pub fn drop_trigger(&mut self, query_id: QueryId, tgoid: i64) -> Option<TriggerDef> {
        let triggers = self.triggers.get_mut(&query_id)?;
        let idx = triggers.iter().position(|t| t.tgoid == tgoid)?;
        Some(triggers.remove(idx))
    }

    /// The live `TriggerDesc` for a query (spec §4.6 "diff its current
    /// triggers against the live relation's `TriggerDesc`"). Empty slice if
    /// the query has no triggers or doesn't exist.
    pub fn triggers_for_query(&self, query_id: QueryId) -> &[TriggerDef] {
        self.triggers.get(&query_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cq(id: i32, group_key: Vec<usize>) -> ContinuousQuery {
        ContinuousQuery {
            id: QueryId(id),
            db_id: DatabaseId(1),
            kind: QueryKind::View,
            matrel: format!("mrel_{id}"),
            output_stream: format!("v{id}_output"),
            sliding_window: None,
            ttl: None,
            pk_sequence: Some(format!("mrel_{id}_seq")),
            group_key_indices: group_key,
            distinct: false,
            is_aggregate: true,
        }
    }

    #[test]
    fn zero_group_by_short_circuits() {
        let cq = sample_cq(1, vec![]);
        assert!(cq.zero_group_by());
        assert!(cq.should_update());
    }

    #[test]
    fn distinct_never_updates() {
        let mut cq = sample_cq(2, vec![0]);
        cq.distinct = true;
        assert!(!cq.should_update());
    }

    #[test]
    fn catalog_filters_by_database() {
        let mut cat = Catalog::new();
        cat.register_query(sample_cq(1, vec![0]));
        let mut other = sample_cq(2, vec![0]);
        other.db_id = DatabaseId(2);
        cat.register_query(other);

        let db1: Vec<_> = cat.queries_for_db(DatabaseId(1)).collect();
        assert_eq!(db1.len(), 1);
        assert_eq!(db1[0].id, QueryId(1));
    }

    #[test]
    fn trigger_register_and_drop_round_trips() {
        let mut cat = Catalog::new();
        cat.register_query(sample_cq(1, vec![0]));
        cat.register_trigger(TriggerDef {
            tgoid: 100,
            name: "alert".into(),
            query_id: QueryId(1),
            when: TriggerPredicate::NewColumnGreaterThan { column: 1, threshold: 100 },
        });
        assert_eq!(cat.triggers_for_query(QueryId(1)).len(), 1);
        let dropped = cat.drop_trigger(QueryId(1), 100);
        assert!(dropped.is_some());
        assert!(cat.triggers_for_query(QueryId(1)).is_empty());
    }

    #[test]
    fn query_by_matrel_finds_registration() {
        let mut cat = Catalog::new();
        cat.register_query(sample_cq(7, vec![0]));
        assert_eq!(cat.query_by_matrel("mrel_7").unwrap().id, QueryId(7));
        assert!(cat.query_by_matrel("nonexistent").is_none());
    }
}
