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

//! Per-matrel trigger decoder state (spec §3 "TriggerCacheEntry", §4.6).
//! Lifecycle: `empty -> has-triggers (lazy init) -> empty (last trigger
//! dropped) -> dropped (relation disappeared)`.

use crate::catalog::{QueryId, TriggerDef};
use crate::host::HeapTuple;
use crate::metrics::EngineMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCacheState {
    Empty,
    HasTriggers,
    Dropped,
}

/// A trigger compiled against this entry's matrel: spec §4.6 "compiled
/// (parse `tgqual`, rewrite `OLD`/`NEW` var-refs..., build an implicit-AND
/// expression tree, cached per `TrigInfo`)". This plane's `TriggerPredicate`
/// is already host-compiled, so "compiling" here is just caching the
/// subscription name alongside it.
#[derive(Debug, Clone)]
pub struct CompiledTrigger {
    pub def: TriggerDef,
    /// Dotted `view.trigger_name` the alert server's subscription table
    /// keys on (spec §4.7).
    pub subscription_name: String,
}

/// Trigger-registration and fan-out seam the decoder drives the alert
/// server through (spec §4.6 "registered with the alert server", §4.7
/// subscription table). Kept separate from [`crate::host`] because it's an
/// in-process collaborator, not an external database contract.
pub trait AlertSink: Send + Sync {
    fn register_trigger(&self, subscription_name: &str);
    fn unregister_trigger(&self, subscription_name: &str);
    fn push_alert(&self, subscription_name: &str, row: &HeapTuple) -> crate::error::EngineResult<()>;
}

pub struct TriggerCacheEntry {
    pub matrel: String,
    pub query_id: QueryId,
    /// The view name triggers on this matrel are addressed under
    /// (`view.trigger_name`); typically the CQ's output stream name.
    pub view_name: String,
    state: TriggerCacheState,
    triggers: Vec<CompiledTrigger>,
}

impl TriggerCacheEntry {
    pub fn new(matrel: String, query_id: QueryId, view_name: String) -> Self {
        Self {
            matrel,
            query_id,
            view_name,
            state: TriggerCacheState::Empty,
            triggers: Vec::new(),
        }
    }

    pub fn state(&self) -> TriggerCacheState {
        self.state
    }

    pub fn triggers(&self) -> &[CompiledTrigger] {
        &self.triggers
    }

    /// Diffs `live` (the catalog's current `TriggerDesc` for this query)
    /// against this entry's cached set, unregistering removed triggers and
    /// registering/compiling added ones (spec §4.6 "Diff").
    pub fn diff_and_sync(&mut self, live: &[TriggerDef], alert: &dyn AlertSink) {
        let removed: Vec<usize> = self
            .triggers
            .iter()
            .enumerate()
            .filter(|(_, t)| !live.iter().any(|l| l.tgoid == t.def.tgoid))
            .map(|(i, _)| i)
            .collect();
        for idx in removed.into_iter().rev() {
            let removed = self.triggers.remove(idx);
            alert.unregister_trigger(&removed.subscription_name);
        }

        for def in live {
            if self.triggers.iter().any(|t| t.def.tgoid == def.tgoid) {
                continue;
            }
            let subscription_name = format!("{}.{}", self.view_name, def.name);
            alert.register_trigger(&subscription_name);
            self.triggers.push(CompiledTrigger {
                def: def.clone(),
                subscription_name,
            });
        }

        self.state = if self.triggers.is_empty() {
            TriggerCacheState::Empty
        } else {
            TriggerCacheState::HasTriggers
        };
    }

    /// Fires every trigger whose `WHEN` predicate matches `new`, pushing an
    /// alert for each (spec §4.6 "fire every matching trigger").
    pub fn fire(
        &self,
        new: Option<&HeapTuple>,
        alert: &dyn AlertSink,
        metrics: &EngineMetrics,
    ) -> crate::error::EngineResult<()> {
        for trigger in &self.triggers {
            if !trigger.def.when.matches(new) {
                continue;
            }
            if let Some(row) = new {
                alert.push_alert(&trigger.subscription_name, row)?;
                metrics
                    .trigger_fires
                    .with_label_values(&[&self.query_id.0.to_string(), &trigger.def.name])
                    .inc();
            }
        }
        Ok(())
    }

    /// Relation has disappeared from the catalog (spec §4.6 housekeeping):
    /// unregister every subscription and mark terminal.
    pub fn mark_dropped(&mut self, alert: &dyn AlertSink) {
        for trigger in self.triggers.drain(..) {
            alert.unregister_trigger(&trigger.subscription_name);
        }
        self.state = TriggerCacheState::Dropped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TriggerPredicate;
    use crate::group::{GroupKey, ScalarValue};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAlertSink {
        registered: Mutex<Vec<String>>,
        unregistered: Mutex<Vec<String>>,
        pushed: Mutex<Vec<(String, i64)>>,
    }

    impl AlertSink for RecordingAlertSink {
        fn register_trigger(&self, subscription_name: &str) {
            self.registered.lock().unwrap().push(subscription_name.to_string());
        }
        fn unregister_trigger(&self, subscription_name: &str) {
            self.unregistered.lock().unwrap().push(subscription_name.to_string());
        }
        fn push_alert(&self, subscription_name: &str, row: &HeapTuple) -> crate::error::EngineResult<()> {
            let ScalarValue::Int64(v) = row.values[0] else { panic!("expected int") };
            self.pushed.lock().unwrap().push((subscription_name.to_string(), v));
            Ok(())
        }
    }

    fn trigger_def(tgoid: i64, threshold: i64) -> TriggerDef {
        TriggerDef {
            tgoid,
            name: "alert".into(),
            query_id: QueryId(1),
            when: TriggerPredicate::NewColumnGreaterThan { column: 0, threshold },
        }
    }

    #[test]
    fn diff_registers_added_and_unregisters_removed() {
        let sink = RecordingAlertSink::default();
        let mut entry = TriggerCacheEntry::new("m1".into(), QueryId(1), "v1".into());
        assert_eq!(entry.state(), TriggerCacheState::Empty);

        entry.diff_and_sync(&[trigger_def(1, 100)], &sink);
        assert_eq!(entry.state(), TriggerCacheState::HasTriggers);
        assert_eq!(sink.registered.lock().unwrap().as_slice(), ["v1.alert"]);

        entry.diff_and_sync(&[], &sink);
        assert_eq!(entry.state(), TriggerCacheState::Empty);
        assert_eq!(sink.unregistered.lock().unwrap().as_slice(), ["v1.alert"]);
    }

    #[test]
    fn fire_only_calls_matching_triggers() {
        let sink = RecordingAlertSink::default();
        let mut entry = TriggerCacheEntry::new("m1".into(), QueryId(1), "v1".into());
        entry.diff_and_sync(&[trigger_def(1, 100)], &sink);
        let metrics = EngineMetrics::for_test();

        let below = HeapTuple { pk: Some(1), key: GroupKey::empty(), values: vec![ScalarValue::Int64(50)] };
        entry.fire(Some(&below), &sink, &metrics).unwrap();
        assert!(sink.pushed.lock().unwrap().is_empty());

        let above = HeapTuple { pk: Some(1), key: GroupKey::empty(), values: vec![ScalarValue::Int64(150)] };
        entry.fire(Some(&above), &sink, &metrics).unwrap();
        assert_eq!(sink.pushed.lock().unwrap().as_slice(), [("v1.alert".to_string(), 150)]);
    }

    #[test]
    fn mark_dropped_unregisters_everything() {
        let sink = RecordingAlertSink::default();
        let mut entry = TriggerCacheEntry::new("m1".into(), QueryId(1), "v1".into());
        entry.diff_and_sync(&[trigger_def(1, 100)], &sink);
        entry.mark_dropped(&sink);
        assert_eq!(entry.state(), TriggerCacheState::Dropped);
        assert_eq!(sink.unregistered.lock().unwrap().as_slice(), ["v1.alert"]);
    }
}
