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

//! Self-describing probabilistic sketches used as aggregate transition
//! states (spec §2 item 2, §3, §4.9). Each sketch is a self-contained value
//! type that can be merged/unioned independently of any particular combiner,
//! matching the "varlena-style, self-describing size" framing of spec §3 —
//! here that's simply `#[derive(Clone)]` plus an `estimated_size` method
//! rather than an on-disk varlena header, since storage layout is the host
//! database's concern (spec §1 non-goals).

pub mod bloom;
pub mod cuckoo;
pub mod cms;
pub mod fss;
pub mod gcs;

pub use bloom::BloomFilter;
pub use cms::CountMinSketch;
pub use cuckoo::CuckooFilter;
pub use fss::FilteredSpaceSaving;
pub use gcs::GolombCodedSet;
