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

//! Trigger WAL decoder (spec §4.6): a per-database background task that
//! tails logical-decoding output, diffs each touched matrel's trigger set
//! against the catalog, and fires matching triggers to the alert server.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, warn};

use crate::catalog::{Catalog, DatabaseId};
use crate::error::EngineResult;
use crate::host::{WalChange, WalSource, XactBatch};
use crate::metrics::EngineMetrics;

use super::cache::{AlertSink, TriggerCacheEntry};

/// Housekeeping cadence for resetting cache entries of dropped relations
/// (spec §4.6: "every `TRIGGER_CACHE_CLEANUP_INTERVAL` (1 s)").
pub const TRIGGER_CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Drives the trigger WAL decoder for one database. Keyed by matrel name
/// rather than a real relation oid (spec §9: "arena of `TriggerCacheEntry`
/// indexed by matrel-oid").
pub struct TriggerDecoder<W, A> {
    db_id: DatabaseId,
    wal: Arc<W>,
    alert: Arc<A>,
    entries: HashMap<String, TriggerCacheEntry>,
    metrics: Arc<EngineMetrics>,
}

impl<W, A> TriggerDecoder<W, A>
where
    W: WalSource,
    A: AlertSink,
{
    pub fn new(db_id: DatabaseId, wal: Arc<W>, alert: Arc<A>, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            db_id,
            wal,
            alert,
            entries: HashMap::new(),
            metrics,
        }
    }

    /// Main loop body (spec §4.6, §5 "trigger decoder suspends in its WAL
    /// reader with a 10 ms poll"): polls the WAL source, processes whatever
    /// transaction arrives, and runs periodic housekeeping on a fixed
    /// interval regardless of WAL activity. Exits when `shutdown` is set.
    pub async fn run(&mut self, catalog: Arc<parking_lot::RwLock<Catalog>>, mut shutdown: watch::Receiver<bool>) {
        let mut cleanup = tokio::time::interval(TRIGGER_CACHE_CLEANUP_INTERVAL);
        loop {
            tokio::select! {
                result = self.wal.next_transaction(Duration::from_millis(10)) => {
                    match result {
                        Ok(Some(batch)) => {
                            let catalog = catalog.read();
                            if let Err(err) = self.process_transaction(batch, &catalog) {
                                error!(db_id = self.db_id.0, error = %err, "trigger decoder failed on transaction, continuing");
                            }
                        }
                        Ok(None) => {}
                        Err(err) => warn!(db_id = self.db_id.0, error = %err, "WAL read error"),
                    }
                }
                _ = cleanup.tick() => {
                    let catalog = catalog.read();
                    self.housekeeping(&catalog);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Processes one decoded transaction (spec §4.6 "Batch processing").
    pub fn process_transaction(&mut self, batch: XactBatch, catalog: &Catalog) -> EngineResult<()> {
        for change in batch.changes {
            let (relation, new) = match &change {
                WalChange::Insert { relation, new } => (relation, Some(new)),
                WalChange::Update { relation, new, .. } => (relation, Some(new)),
                WalChange::Delete { relation, .. } => (relation, None),
                WalChange::Noop { relation } => (relation, None),
            };
            let Some(cq) = catalog.query_by_matrel(relation) else {
                continue;
            };
            let entry = self.entries.entry(relation.clone()).or_insert_with(|| {
                TriggerCacheEntry::new(relation.clone(), cq.id, cq.output_stream.clone())
            });
            let live = catalog.triggers_for_query(cq.id);
            entry.diff_and_sync(live, self.alert.as_ref());
            entry.fire(new, self.alert.as_ref(), &self.metrics)?;
        }
        Ok(())
    }

    /// Recomputes trigger sets for every CQ without an actual WAL change
    /// (spec §4.6 "Catalog-sync scans ... enqueue a synthetic 'sync'
    /// batch"), e.g. in response to a host SIGHUP.
    pub fn sync_catalog(&mut self, catalog: &Catalog) {
        for cq in catalog.queries_for_db(self.db_id) {
            let entry = self
                .entries
                .entry(cq.matrel.clone())
                .or_insert_with(|| TriggerCacheEntry::new(cq.matrel.clone(), cq.id, cq.output_stream.clone()));
            let live = catalog.triggers_for_query(cq.id);
            entry.diff_and_sync(live, self.alert.as_ref());
        }
    }

    /// Resets entries whose matrel no longer exists in the catalog (spec
    /// §4.6 housekeeping).
    fn housekeeping(&mut self, catalog: &Catalog) {
        let gone: Vec<String> = self
            .entries
            .keys()
            .filter(|matrel| catalog.query_by_matrel(matrel).is_none())
            .cloned()
            .collect();
        for matrel in gone {
            if let Some(mut entry) = self.entries.remove(&matrel) {
                entry.mark_dropped(self.alert.as_ref());
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ContinuousQuery, DatabaseId as DbId, QueryId, QueryKind, TriggerDef, TriggerPredicate};
    use crate::group::{GroupKey, ScalarValue};
    use crate::host::{fake::FakeWalSource, HeapTuple};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAlertSink {
        pushed: Mutex<Vec<String>>,
    }

    impl AlertSink for RecordingAlertSink {
        fn register_trigger(&self, _subscription_name: &str) {}
        fn unregister_trigger(&self, _subscription_name: &str) {}
        fn push_alert(&self, subscription_name: &str, _row: &HeapTuple) -> EngineResult<()> {
            self.pushed.lock().unwrap().push(subscription_name.to_string());
            Ok(())
        }
    }

    fn cq() -> ContinuousQuery {
        ContinuousQuery {
            id: QueryId(1),
            db_id: DbId(1),
            kind: QueryKind::View,
            matrel: "m1".into(),
            output_stream: "v1".into(),
            sliding_window: None,
            ttl: None,
            pk_sequence: None,
            group_key_indices: vec![],
            distinct: false,
            is_aggregate: true,
        }
    }

    #[test]
    fn process_transaction_fires_matching_trigger() {
        let alert = Arc::new(RecordingAlertSink::default());
        let wal = Arc::new(FakeWalSource::new());
        let mut decoder = TriggerDecoder::new(DbId(1), wal, alert.clone(), Arc::new(EngineMetrics::for_test()));

        let mut catalog = Catalog::new();
        catalog.register_query(cq());
        catalog.register_trigger(TriggerDef {
            tgoid: 1,
            name: "alert".into(),
            query_id: QueryId(1),
            when: TriggerPredicate::NewColumnGreaterThan { column: 0, threshold: 100 },
        });

        let batch = XactBatch {
            changes: vec![WalChange::Insert {
                relation: "m1".into(),
                new: HeapTuple { pk: Some(1), key: GroupKey::empty(), values: vec![ScalarValue::Int64(150)] },
            }],
        };
        decoder.process_transaction(batch, &catalog).unwrap();
        assert_eq!(alert.pushed.lock().unwrap().as_slice(), ["v1.alert"]);
        assert_eq!(decoder.entry_count(), 1);
    }

    #[test]
    fn housekeeping_drops_entries_for_removed_matrels() {
        let alert = Arc::new(RecordingAlertSink::default());
        let wal = Arc::new(FakeWalSource::new());
        let mut decoder = TriggerDecoder::new(DbId(1), wal, alert, Arc::new(EngineMetrics::for_test()));

        let mut catalog = Catalog::new();
        catalog.register_query(cq());
        decoder.sync_catalog(&catalog);
        assert_eq!(decoder.entry_count(), 1);

        let empty_catalog = Catalog::new();
        decoder.housekeeping(&empty_catalog);
        assert_eq!(decoder.entry_count(), 0);
    }
}
