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

//! Recognized configuration options (spec §6) and their defaults.

use serde::{Deserialize, Serialize};

/// Commit level requested for combiner transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncCommit {
    On,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker slots per database process group.
    pub num_workers: u32,
    /// Number of combiner slots per database process group.
    pub num_combiners: u32,
    /// Max KB per microbatch; hard ceiling per spec §4.1.
    pub batch_size_kb: u32,
    /// Max wait, in ms, when peeking an IPC queue for a batch.
    pub max_wait_ms: u64,
    /// Hard cap, in KB, on combiner transient per-batch state.
    pub combiner_work_mem_kb: u64,
    /// `GroupCache` size, in KB, per combiner.
    pub combiner_cache_mem_kb: u64,
    pub combiner_sync_commit: SyncCommit,
    /// `[0,1]` niceness scaler (spec §4.2).
    pub proc_priority: f64,
    /// Max coalesced delay, in ms, between combiner commits.
    pub commit_interval_ms: u64,
    /// Whether a crashing worker/combiner is restarted in place vs. the task exiting.
    pub crash_recovery: bool,
    /// Base port; the alert server binds `[alert_server_port, +num_workers)`.
    pub alert_server_port: u16,
    /// Per-client ring buffer size, in KB (rounded up to a power of two).
    pub alert_socket_mem_kb: u32,
    /// Logical-replication slot name template for the trigger WAL decoder.
    pub trigger_replication_slot_name: String,
    /// Whether stream inserts block on the ack-wait protocol (spec §4.1, §8
    /// scenario 6).
    pub synchronous_stream_insert: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            num_combiners: 4,
            batch_size_kb: 256,
            max_wait_ms: 50,
            combiner_work_mem_kb: 64 * 1024,
            combiner_cache_mem_kb: 32 * 1024,
            combiner_sync_commit: SyncCommit::Off,
            proc_priority: 0.0,
            commit_interval_ms: 50,
            crash_recovery: true,
            alert_server_port: 7432,
            alert_socket_mem_kb: 32,
            trigger_replication_slot_name: "contstream_trigger".to_string(),
            synchronous_stream_insert: false,
        }
    }
}

impl EngineConfig {
    /// Hard byte cap for one packed microbatch (spec §4.1: `batch_size_kb *
    /// 1024 - 2048` reserved for ack overhead).
    pub fn batch_byte_cap(&self) -> usize {
        (self.batch_size_kb as usize * 1024).saturating_sub(2048)
    }

    /// Scheduler niceness offset derived from `proc_priority` (spec §4.2):
    /// `nice = max(default, 20 - ceil(p * (20 - default)))`.
    pub fn niceness(&self, default_nice: i32) -> i32 {
        let p = self.proc_priority.clamp(0.0, 1.0);
        let scaled = (p * (20 - default_nice) as f64).ceil() as i32;
        std::cmp::max(default_nice, 20 - scaled)
    }

    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml_like::from_str(s)?)
    }
}

/// Minimal TOML-subset reader so the crate doesn't need a TOML dependency
/// beyond what `serde` already buys us; values are limited to the flat
/// key = value shape `EngineConfig` actually needs.
mod toml_like {
    use serde::de::DeserializeOwned;
    use serde_json::{Map, Value};

    pub fn from_str<T: DeserializeOwned>(input: &str) -> anyhow::Result<T> {
        let mut map = Map::new();
        for line in input.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                anyhow::bail!("malformed config line: {line}");
            };
            let key = key.trim().to_string();
            let value = value.trim();
            let parsed = if let Ok(n) = value.parse::<i64>() {
                Value::from(n)
            } else if let Ok(f) = value.parse::<f64>() {
                Value::from(f)
            } else if let Ok(b) = value.parse::<bool>() {
                Value::from(b)
            } else {
                Value::from(value.trim_matches('"'))
            };
            map.insert(key, parsed);
        }
        Ok(serde_json::from_value(Value::Object(map))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.num_workers, 4);
        assert_eq!(cfg.batch_byte_cap(), 256 * 1024 - 2048);
    }

    #[test]
    fn niceness_scales_with_priority() {
        let mut cfg = EngineConfig::default();
        cfg.proc_priority = 0.0;
        assert_eq!(cfg.niceness(0), 20);
        cfg.proc_priority = 1.0;
        assert_eq!(cfg.niceness(0), 0);
    }

    #[test]
    fn parses_flat_config() {
        let cfg: EngineConfig =
            EngineConfig::from_toml_str("num_workers = 8\ncrash_recovery = false\n").unwrap();
        assert_eq!(cfg.num_workers, 8);
        assert!(!cfg.crash_recovery);
        // Fields omitted from the input keep their serde defaults.
        assert_eq!(cfg.num_combiners, 4);
    }
}
