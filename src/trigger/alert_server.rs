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

//! Alert server (spec §4.7): a TCP server binding `[alert_server_port,
//! +max_workers)` that fans `trigger::decoder` alerts out to subscribed
//! clients. The source multiplexes clients with `poll` on one thread; this
//! plane uses `tokio`'s multiplexing instead (one task per connection) but
//! keeps the same per-client mirrored ring buffer, subscription protocol,
//! 10 s read timeout, and 5 s heartbeat cadence (spec §5, §9).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};

use crate::catalog::DatabaseId;
use crate::error::{EngineError, EngineResult};
use crate::group::ScalarValue;
use crate::host::HeapTuple;
use crate::metrics::EngineMetrics;

use super::cache::AlertSink;
use super::ring_buffer::MirroredRingBuffer;

const READ_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Escapes one text value per COPY TEXT rules (spec §6: `\b \f \n \r \t \v`
/// and `\\`).
fn escape_copy_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{b}' => out.push_str("\\v"),
            other => out.push(other),
        }
    }
    out
}

fn scalar_to_copy_text(v: &ScalarValue) -> String {
    match v {
        ScalarValue::Null => "\\N".to_string(),
        ScalarValue::Bool(b) => b.to_string(),
        ScalarValue::Int64(n) => n.to_string(),
        ScalarValue::Float64(f) => f.to_string(),
        ScalarValue::Text(s) => escape_copy_text(s),
        ScalarValue::Bytes(b) => escape_copy_text(&String::from_utf8_lossy(b)),
    }
}

/// Serializes a row's columns as a single COPY TEXT line, `\t`-delimited
/// (spec §6).
fn row_to_copy_text(row: &HeapTuple) -> String {
    row.values.iter().map(scalar_to_copy_text).collect::<Vec<_>>().join("\t")
}

struct ClientHandle {
    ring: Mutex<MirroredRingBuffer>,
    subscribed: Mutex<Option<String>>,
    wake: Notify,
}

/// Shared alert-server state: the subscription table and per-client ring
/// buffers (spec §4.7). Implements [`AlertSink`] so [`super::decoder`] can
/// drive trigger registration and alert push without depending on the
/// networking layer directly.
pub struct AlertServerState {
    db_id: DatabaseId,
    subscriptions: DashMap<String, Vec<u64>>,
    clients: DashMap<u64, Arc<ClientHandle>>,
    next_client_id: AtomicU64,
    ring_capacity_bytes: usize,
    metrics: Arc<EngineMetrics>,
}

impl AlertServerState {
    pub fn new(db_id: DatabaseId, ring_capacity_bytes: usize, metrics: Arc<EngineMetrics>) -> Self {
        Self {
            db_id,
            subscriptions: DashMap::new(),
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(0),
            ring_capacity_bytes,
            metrics,
        }
    }

    fn new_client(&self) -> (u64, Arc<ClientHandle>) {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ClientHandle {
            ring: Mutex::new(MirroredRingBuffer::new(self.ring_capacity_bytes)),
            subscribed: Mutex::new(None),
            wake: Notify::new(),
        });
        self.clients.insert(id, handle.clone());
        self.metrics
            .alert_server_clients
            .with_label_values(&[&self.db_id.0.to_string()])
            .inc();
        (id, handle)
    }

    fn drop_client(&self, id: u64) {
        if let Some((_, handle)) = self.clients.remove(&id) {
            if let Some(name) = handle.subscribed.lock().take() {
                if let Some(mut subs) = self.subscriptions.get_mut(&name) {
                    subs.retain(|&c| c != id);
                }
            }
            self.metrics
                .alert_server_clients
                .with_label_values(&[&self.db_id.0.to_string()])
                .dec();
        }
    }

    /// `subscribe\t<name>`: fails if `name` isn't a registered trigger
    /// (spec §7 `SubscribeUnknownTrigger`).
    fn subscribe(&self, client_id: u64, name: &str) -> EngineResult<()> {
        let mut entry = self
            .subscriptions
            .get_mut(name)
            .ok_or_else(|| EngineError::SubscribeUnknownTrigger(name.to_string()))?;
        entry.push(client_id);
        drop(entry);
        if let Some(handle) = self.clients.get(&client_id) {
            *handle.subscribed.lock() = Some(name.to_string());
        }
        Ok(())
    }

    fn unsubscribe(&self, client_id: u64, name: &str) -> bool {
        let Some(mut entry) = self.subscriptions.get_mut(name) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|&c| c != client_id);
        let removed = entry.len() != before;
        if removed {
            if let Some(handle) = self.clients.get(&client_id) {
                *handle.subscribed.lock() = None;
            }
        }
        removed
    }

    fn push_heartbeats(&self) {
        for client in self.clients.iter() {
            let mut ring = client.ring.lock();
            if ring.write(&client.key().to_string(), b"heartbeat\n").is_ok() {
                client.wake.notify_one();
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl AlertSink for AlertServerState {
    fn register_trigger(&self, subscription_name: &str) {
        self.subscriptions.entry(subscription_name.to_string()).or_default();
    }

    fn unregister_trigger(&self, subscription_name: &str) {
        if let Some((_, clients)) = self.subscriptions.remove(subscription_name) {
            for client_id in clients {
                if let Some(handle) = self.clients.get(&client_id) {
                    if handle.ring.lock().write(&client_id.to_string(), b"dropped\n").is_ok() {
                        handle.wake.notify_one();
                    }
                    *handle.subscribed.lock() = None;
                }
            }
        }
    }

    fn push_alert(&self, subscription_name: &str, row: &HeapTuple) -> EngineResult<()> {
        let Some(clients) = self.subscriptions.get(subscription_name) else {
            return Ok(());
        };
        let line = format!("alert\t{}\n", row_to_copy_text(row));
        let mut watermarked = Vec::new();
        for &client_id in clients.iter() {
            if let Some(handle) = self.clients.get(&client_id) {
                match handle.ring.lock().write(&client_id.to_string(), line.as_bytes()) {
                    Ok(()) => handle.wake.notify_one(),
                    Err(EngineError::ClientWatermark(_)) => watermarked.push(client_id),
                    Err(err) => return Err(err),
                }
            }
        }
        drop(clients);
        for client_id in watermarked {
            self.drop_client(client_id);
        }
        Ok(())
    }
}

/// Binds a listener in `[base_port, base_port + max_clients)` and serves
/// connections until `shutdown` fires (spec §4.7). Heartbeats are driven by
/// a separate ticker task sharing the same [`AlertServerState`].
pub async fn serve(
    state: Arc<AlertServerState>,
    base_port: u16,
    max_clients: u16,
    mut shutdown: watch::Receiver<bool>,
) -> EngineResult<()> {
    let mut listener = None;
    for offset in 0..max_clients {
        let port = base_port.wrapping_add(offset);
        if let Ok(l) = TcpListener::bind(("0.0.0.0", port)).await {
            listener = Some(l);
            break;
        }
    }
    let Some(listener) = listener else {
        return Err(EngineError::FatalCatalogLookup(format!(
            "alert server could not bind any port in [{base_port}, {})",
            base_port as u32 + max_clients as u32
        )));
    };

    let heartbeat_state = state.clone();
    let mut heartbeat_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => heartbeat_state.push_heartbeats(),
                _ = heartbeat_shutdown.changed() => {
                    if *heartbeat_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                if let Ok((stream, _)) = accepted {
                    let state = state.clone();
                    tokio::spawn(async move { handle_client(state, stream).await });
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

/// One client connection's lifecycle: subscribe/unsubscribe protocol loop
/// plus a concurrent writer task draining the client's ring buffer (spec
/// §4.7). Exposed so a caller that wants control over the listening socket
/// (e.g. an ephemeral port in tests) can still reuse the connection logic.
pub async fn handle_client(state: Arc<AlertServerState>, stream: TcpStream) {
    let (id, handle) = state.new_client();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let writer_handle = handle.clone();
    let writer = tokio::spawn(async move {
        loop {
            let bytes = {
                let mut ring = writer_handle.ring.lock();
                ring.drain()
            };
            if !bytes.is_empty() && write_half.write_all(&bytes).await.is_err() {
                return;
            }
            tokio::select! {
                _ = writer_handle.wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await;
        match read {
            Ok(Ok(0)) | Err(_) => break, // EOF or 10s silence (spec §4.7 read timeout)
            Ok(Err(_)) => break,
            Ok(Ok(_)) => {}
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if let Some(name) = trimmed.strip_prefix("subscribe\t") {
            let reply = match state.subscribe(id, name) {
                Ok(()) => "subscribe_ok\n",
                Err(_) => "subscribe_fail\n",
            };
            handle.ring.lock().write(&id.to_string(), reply.as_bytes()).ok();
            handle.wake.notify_one();
        } else if let Some(name) = trimmed.strip_prefix("unsubscribe\t") {
            let reply = if state.unsubscribe(id, name) {
                "unsubscribe_ok\n"
            } else {
                "unsubscribe_fail\n"
            };
            handle.ring.lock().write(&id.to_string(), reply.as_bytes()).ok();
            handle.wake.notify_one();
        }
    }

    writer.abort();
    state.drop_client(id);
}
