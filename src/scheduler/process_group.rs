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

//! A single database's worker/combiner process group (spec §4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::catalog::DatabaseId;
use crate::config::EngineConfig;
use crate::metrics::EngineMetrics;

/// Minimum grace period before a terminating group's stragglers are killed
/// (spec §4.2).
pub const MIN_WAIT_TERMINATE_MS: u64 = 250;

/// Soft-activation state a slot's main loop polls and yields on (spec §4.2
/// "soft activation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Active,
    Paused,
}

pub struct ProcessGroup {
    db_id: DatabaseId,
    config: watch::Sender<Arc<EngineConfig>>,
    metrics: Arc<EngineMetrics>,
    activation: watch::Sender<ActivationState>,
    terminating: Arc<AtomicBool>,
    handles: HashMap<u32, JoinHandle<()>>,
}

impl ProcessGroup {
    pub fn new(db_id: DatabaseId, config: Arc<EngineConfig>, metrics: Arc<EngineMetrics>) -> Self {
        let (config_tx, _) = watch::channel(config);
        let (activation_tx, _) = watch::channel(ActivationState::Active);
        Self {
            db_id,
            config: config_tx,
            metrics,
            activation: activation_tx,
            terminating: Arc::new(AtomicBool::new(false)),
            handles: HashMap::new(),
        }
    }

    pub fn db_id(&self) -> DatabaseId {
        self.db_id
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.borrow().clone()
    }

    pub fn config_watch(&self) -> watch::Receiver<Arc<EngineConfig>> {
        self.config.subscribe()
    }

    pub fn activation_watch(&self) -> watch::Receiver<ActivationState> {
        self.activation.subscribe()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Publishes an updated config to every slot watching it (spec §4.2
    /// "reload config").
    pub fn reload_config(&mut self, config: Arc<EngineConfig>) {
        let _ = self.config.send(config);
    }

    /// Spawns one background task per slot, `0..num_workers + num_combiners`
    /// dense ids, via `make_task` (spec §4.2: "spawns W+C background tasks
    /// ... pinned to its slot and assigned a dense `group_id`").
    pub fn spawn_slots<F>(&mut self, make_task: F)
    where
        F: Fn(u32) -> JoinHandle<()>,
    {
        let cfg = self.config();
        let total = cfg.num_workers + cfg.num_combiners;
        for slot in 0..total {
            self.handles.insert(slot, make_task(slot));
        }
    }

    pub fn register_handle(&mut self, slot: u32, handle: JoinHandle<()>) {
        self.handles.insert(slot, handle);
    }

    pub fn num_slots(&self) -> usize {
        self.handles.len()
    }

    /// `SetStateAndWait(state, ms)`: sets activation, then waits up to `ms`
    /// for the running slot count to settle (spec §4.2). Degenerate in this
    /// in-process model (no separate ack channel per slot), so this only
    /// publishes the new state and sleeps a bounded grace period.
    pub async fn set_state_and_wait(&mut self, state: ActivationState, wait: Duration) {
        let _ = self.activation.send(state);
        tokio::time::sleep(wait.min(Duration::from_millis(MIN_WAIT_TERMINATE_MS))).await;
    }

    /// Terminate policy (spec §4.2): mark for shutdown, wake every slot's
    /// activation latch, wait `MIN_WAIT_TERMINATE_MS`, then abort stragglers.
    pub async fn terminate(&mut self) {
        self.terminating.store(true, Ordering::Release);
        let _ = self.activation.send(ActivationState::Paused);
        tokio::time::sleep(Duration::from_millis(MIN_WAIT_TERMINATE_MS)).await;
        for (slot, handle) in self.handles.drain() {
            if !handle.is_finished() {
                warn!(db_id = self.db_id.0, slot, "killing straggler slot task");
                handle.abort();
            }
        }
        info!(db_id = self.db_id.0, "process group terminated");
    }

    /// Whether a fatal slot failure should be caught and the loop restarted
    /// in place (spec §4.2 "Failure semantics"), vs. letting the task exit
    /// for the scheduler to respawn after 1s.
    pub fn crash_recovery_enabled(&self) -> bool {
        self.config().crash_recovery
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }
}
