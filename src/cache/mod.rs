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

//! Per-combiner caches: the bounded-memory `GroupCache` LRU (spec §3, §4.8)
//! and the transient `ExistingGroups` hash table scoped to one batch (spec
//! §3, §4.4 step b/c).

pub mod existing_groups;
pub mod group_cache;

pub use existing_groups::ExistingGroups;
pub use group_cache::GroupCache;
