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

//! Trigger WAL decoder and alert fan-out (spec §4.6, §4.7).

pub mod alert_server;
pub mod cache;
pub mod decoder;
pub mod ring_buffer;

pub use alert_server::{handle_client, serve as serve_alert_server, AlertServerState};
pub use cache::{AlertSink, CompiledTrigger, TriggerCacheEntry, TriggerCacheState};
pub use decoder::TriggerDecoder;
pub use ring_buffer::MirroredRingBuffer;
