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

//! Microbatch wire format and acknowledgement bookkeeping (spec §4.1), and
//! the IPC queues that carry batches between stream writers, workers, and
//! combiners (spec §5).

pub mod ack;
pub mod microbatch;
pub mod queue;

pub use ack::Ack;
pub use microbatch::{CombinerBatch, Microbatch, PartialTupleState, StreamTupleState, WorkerBatch};
pub use queue::{MultiQueue, SlotQueue};
