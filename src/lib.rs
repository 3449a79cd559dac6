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

//! Continuous-query execution plane: the partitioned worker/combiner
//! pipeline that turns a stream of tuples into incrementally maintained
//! aggregate groupings.
//!
//! The host SQL database (parser, planner, heap/index access, transaction
//! manager, expression evaluator) is treated as an external collaborator
//! reached only through the traits in [`host`].

pub mod cache;
pub mod catalog;
pub mod combiner;
pub mod config;
pub mod error;
pub mod group;
pub mod host;
pub mod ipc;
pub mod metrics;
pub mod plan;
pub mod scheduler;
pub mod shmem;
pub mod sketches;
pub mod sliding_window;
pub mod trigger;
pub mod ttl;
pub mod worker;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
