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

//! Microbatch packing (spec §4.1): `[kind][n_acks][ack*n_acks][n_tuples]
//! [tuple*n_tuples]`, followed by a worker-batch's query bitset or a
//! combiner-batch's `(query_id, group_hash)` pair. A trailing CRC32 guards
//! the packed buffer against corruption in transit.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::catalog::QueryId;
use crate::error::{EngineError, EngineResult};
use crate::group::{GroupKey, ScalarValue};
use crate::host::StreamRow;
use crate::ipc::ack::Ack;

const KIND_WORKER: u8 = 0;
const KIND_COMBINER: u8 = 1;

/// Reserved overhead per spec §4.1's cap formula (`batch_size_kb * 1024 -
/// 2048`, the 2048 standing for worst-case ack/header overhead).
pub const ACK_OVERHEAD_BYTES: usize = 2048;

fn encode_row(row: &StreamRow, out: &mut Vec<u8>) {
    out.extend_from_slice(&row.arrival_ts_ms.to_le_bytes());
    out.extend_from_slice(&(row.values.len() as u32).to_le_bytes());
    for v in &row.values {
        v.encode(out);
    }
}

fn decode_scalar(buf: &mut Bytes) -> EngineResult<ScalarValue> {
    if !buf.has_remaining() {
        return Err(EngineError::WalReadError("truncated scalar tag".into()));
    }
    let tag = buf.get_u8();
    Ok(match tag {
        0 => ScalarValue::Null,
        1 => ScalarValue::Bool(buf.get_u8() != 0),
        2 => ScalarValue::Int64(buf.get_i64_le()),
        3 => ScalarValue::Float64(buf.get_f64_le()),
        4 => {
            let len = buf.get_u32_le() as usize;
            let bytes = buf.copy_to_bytes(len);
            ScalarValue::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        5 => {
            let len = buf.get_u32_le() as usize;
            ScalarValue::Bytes(buf.copy_to_bytes(len).to_vec())
        }
        other => return Err(EngineError::WalReadError(format!("unknown scalar tag {other}"))),
    })
}

fn decode_row(buf: &mut Bytes) -> EngineResult<StreamRow> {
    let arrival_ts_ms = buf.get_u64_le();
    let n = buf.get_u32_le() as usize;
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(decode_scalar(buf)?);
    }
    Ok(StreamRow { values, arrival_ts_ms })
}

/// `StreamTupleState{tuple, descriptor, acks, query_bitset}` (spec §4.3
/// step 2). `descriptor` is carried implicitly: every row in a batch shares
/// the batch's own column types, so no separate descriptor is packed.
#[derive(Clone)]
pub struct StreamTupleState {
    pub row: StreamRow,
    pub ack: Arc<Ack>,
    /// Dense set of query ids this tuple targets (spec §4.3 step 3).
    pub query_bitset: Vec<QueryId>,
}

/// `PartialTupleState{tuple, acks, hash, query_id}` (spec §4.3 step 3).
#[derive(Clone)]
pub struct PartialTupleState {
    pub key: GroupKey,
    pub values: Vec<ScalarValue>,
    pub ack: Arc<Ack>,
    pub hash: u64,
    pub query_id: QueryId,
}

fn packed_row_size(row: &StreamRow) -> usize {
    let mut buf = Vec::new();
    encode_row(row, &mut buf);
    buf.len()
}

/// A worker-bound batch: new stream tuples plus the query bitset each
/// targets (spec §3 "Microbatch").
#[derive(Default)]
pub struct WorkerBatch {
    tuples: Vec<StreamTupleState>,
    packed_bytes: usize,
}

/// A combiner-bound batch: partial tuples sharded to this combiner's group
/// hash range.
#[derive(Default)]
pub struct CombinerBatch {
    tuples: Vec<PartialTupleState>,
    packed_bytes: usize,
}

pub trait Microbatch {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn packed_bytes(&self) -> usize;
}

impl Microbatch for WorkerBatch {
    fn len(&self) -> usize {
        self.tuples.len()
    }
    fn packed_bytes(&self) -> usize {
        self.packed_bytes
    }
}

impl Microbatch for CombinerBatch {
    fn len(&self) -> usize {
        self.tuples.len()
    }
    fn packed_bytes(&self) -> usize {
        self.packed_bytes
    }
}

impl WorkerBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tuples(&self) -> &[StreamTupleState] {
        &self.tuples
    }

    /// Appends `state`, failing with [`EngineError::BatchFull`] if doing so
    /// would exceed `cap` bytes (spec §4.1). The caller flushes and starts
    /// a new batch on failure.
    pub fn try_push(&mut self, state: StreamTupleState, cap: usize) -> EngineResult<()> {
        let added = packed_row_size(&state.row) + state.query_bitset.len() * 4 + 16;
        if self.packed_bytes + added > cap {
            return Err(EngineError::BatchFull);
        }
        self.packed_bytes += added;
        self.tuples.push(state);
        Ok(())
    }

    /// Packs the batch to its wire form (spec §4.1). Acks aren't embedded
    /// in the byte stream (they live in shared memory / an `Arc` in this
    /// crate's model); only the kind tag, tuple count, and tuples are
    /// packed, matching spec's `[kind][n_acks][ack*n_acks][n_tuples]
    /// [tuple*n_tuples]` shape with `n_acks` always `0` for the in-process
    /// transport.
    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(KIND_WORKER);
        buf.put_u32_le(0); // n_acks
        buf.put_u32_le(self.tuples.len() as u32);
        for t in &self.tuples {
            let mut row_bytes = Vec::new();
            encode_row(&t.row, &mut row_bytes);
            buf.put_u32_le(row_bytes.len() as u32);
            buf.put_slice(&row_bytes);
            buf.put_u32_le(t.query_bitset.len() as u32);
            for q in &t.query_bitset {
                buf.put_i32_le(q.0);
            }
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.freeze()
    }

    /// Unpacks rows and query bitsets from [`pack`]; acks must be supplied
    /// by the caller since they aren't embedded (see [`Self::pack`]).
    pub fn unpack(mut bytes: Bytes, ack: Arc<Ack>) -> EngineResult<Self> {
        if bytes.len() < 4 {
            return Err(EngineError::WalReadError("microbatch too short".into()));
        }
        let body = bytes.split_to(bytes.len() - 4);
        let expected = bytes.get_u32_le();
        if crc32fast::hash(&body) != expected {
            return Err(EngineError::WalReadError("microbatch checksum mismatch".into()));
        }
        let mut buf = body;
        let kind = buf.get_u8();
        if kind != KIND_WORKER {
            return Err(EngineError::WalReadError("expected worker batch kind".into()));
        }
        let _n_acks = buf.get_u32_le();
        let n_tuples = buf.get_u32_le() as usize;
        let mut batch = WorkerBatch::new();
        for _ in 0..n_tuples {
            let row_len = buf.get_u32_le() as usize;
            let mut row_bytes = buf.copy_to_bytes(row_len);
            let row = decode_row(&mut row_bytes)?;
            let n_bits = buf.get_u32_le() as usize;
            let mut query_bitset = Vec::with_capacity(n_bits);
            for _ in 0..n_bits {
                query_bitset.push(QueryId(buf.get_i32_le()));
            }
            batch.packed_bytes += packed_row_size(&row) + query_bitset.len() * 4 + 16;
            batch.tuples.push(StreamTupleState {
                row,
                ack: ack.clone(),
                query_bitset,
            });
        }
        Ok(batch)
    }
}

impl CombinerBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tuples(&self) -> &[PartialTupleState] {
        &self.tuples
    }

    pub fn try_push(&mut self, state: PartialTupleState, cap: usize) -> EngineResult<()> {
        let mut encoded_key = Vec::new();
        for v in &state.key.0 {
            v.encode(&mut encoded_key);
        }
        let mut encoded_values = Vec::new();
        for v in &state.values {
            v.encode(&mut encoded_values);
        }
        let added = encoded_key.len() + encoded_values.len() + 16;
        if self.packed_bytes + added > cap {
            return Err(EngineError::BatchFull);
        }
        self.packed_bytes += added;
        self.tuples.push(state);
        Ok(())
    }

    pub fn pack(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(KIND_COMBINER);
        buf.put_u32_le(0);
        buf.put_u32_le(self.tuples.len() as u32);
        for t in &self.tuples {
            buf.put_i32_le(t.query_id.0);
            buf.put_u64_le(t.hash);
            let mut key_bytes = Vec::new();
            for v in &t.key.0 {
                v.encode(&mut key_bytes);
            }
            buf.put_u32_le(t.key.0.len() as u32);
            buf.put_u32_le(key_bytes.len() as u32);
            buf.put_slice(&key_bytes);
            let mut value_bytes = Vec::new();
            for v in &t.values {
                v.encode(&mut value_bytes);
            }
            buf.put_u32_le(t.values.len() as u32);
            buf.put_u32_le(value_bytes.len() as u32);
            buf.put_slice(&value_bytes);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.freeze()
    }

    pub fn unpack(mut bytes: Bytes, ack: Arc<Ack>) -> EngineResult<Self> {
        if bytes.len() < 4 {
            return Err(EngineError::WalReadError("microbatch too short".into()));
        }
        let body = bytes.split_to(bytes.len() - 4);
        let expected = bytes.get_u32_le();
        if crc32fast::hash(&body) != expected {
            return Err(EngineError::WalReadError("microbatch checksum mismatch".into()));
        }
        let mut buf = body;
        let kind = buf.get_u8();
        if kind != KIND_COMBINER {
            return Err(EngineError::WalReadError("expected combiner batch kind".into()));
        }
        let _n_acks = buf.get_u32_le();
        let n_tuples = buf.get_u32_le() as usize;
        let mut batch = CombinerBatch::new();
        for _ in 0..n_tuples {
            let query_id = QueryId(buf.get_i32_le());
            let hash = buf.get_u64_le();
            let n_key_vals = buf.get_u32_le() as usize;
            let key_len = buf.get_u32_le() as usize;
            let mut key_bytes = buf.copy_to_bytes(key_len);
            let mut key_vals = Vec::with_capacity(n_key_vals);
            for _ in 0..n_key_vals {
                key_vals.push(decode_scalar(&mut key_bytes)?);
            }
            let n_vals = buf.get_u32_le() as usize;
            let val_len = buf.get_u32_le() as usize;
            let mut val_bytes = buf.copy_to_bytes(val_len);
            let mut values = Vec::with_capacity(n_vals);
            for _ in 0..n_vals {
                values.push(decode_scalar(&mut val_bytes)?);
            }
            batch.tuples.push(PartialTupleState {
                key: GroupKey(key_vals),
                values,
                ack: ack.clone(),
                hash,
                query_id,
            });
        }
        Ok(batch)
    }
}
