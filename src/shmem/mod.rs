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

//! Primitive storage shared across worker/combiner tasks (spec §2 item 1,
//! §5: "all cross-task structures ... live here").
//!
//! A process-per-slot deployment would back this with an actual POSIX
//! shared memory segment; this crate runs every slot as a `tokio` task
//! within one process, so "shared memory" is a `parking_lot`-guarded arena
//! reachable from every task's `Arc` handle. The allocation/free-list
//! contract and its failure mode (a full arena surfaces as
//! [`crate::EngineError::OutOfMemory`]) are unchanged either way.

pub mod allocator;
pub mod array;

pub use allocator::Arena;
pub use array::SharedArray;
