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

//! IPC queues built on an in-process mailbox (spec §5: "single-producer
//! single-consumer at the queue level; multi-queues fan several producers
//! in via a mutex only on the producer side"). A single slot's queue is a
//! bounded `tokio::sync::mpsc` channel; [`MultiQueue`] wraps the sender
//! side in a `parking_lot::Mutex` so many stream writers can push into one
//! worker's mailbox without contending on the consumer.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;

/// One slot's inbound mailbox: bounded, single-consumer. The bound itself
/// is the natural backpressure point named in spec §4.1's ack contract —
/// `QueueBackpressure` surfaces when `try_send` finds the channel full.
pub struct SlotQueue<T> {
    tx: Mutex<mpsc::Sender<T>>,
    rx: AsyncMutex<mpsc::Receiver<T>>,
}

impl<T: Send + 'static> SlotQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: Mutex::new(tx),
            rx: AsyncMutex::new(rx),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<T> {
        self.tx.lock().clone()
    }

    /// Peeks up to `max_items` messages, waiting at most `max_wait` for the
    /// first one to arrive (spec §4.3 step 1, §4.4 step 1's "same
    /// peek/wait policy"). Returns an empty vec on timeout with nothing
    /// buffered.
    pub async fn recv_batch(&self, max_items: usize, max_wait: Duration) -> Vec<T> {
        let mut rx = self.rx.lock().await;
        let mut items = Vec::new();
        match timeout(max_wait, rx.recv()).await {
            Ok(Some(first)) => items.push(first),
            Ok(None) | Err(_) => return items,
        }
        while items.len() < max_items {
            match rx.try_recv() {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }
        items
    }
}

/// Fan-in point for several producers sharing one consumer's dense set of
/// slot mailboxes, keyed by slot index (spec §4.2: each task "pinned to its
/// slot"; spec §5: multi-queue fans in via a mutex on the producer side
/// only).
pub struct MultiQueue<T> {
    slots: Vec<SlotQueue<T>>,
}

impl<T: Send + 'static> MultiQueue<T> {
    pub fn new(num_slots: u32, capacity_per_slot: usize) -> Self {
        Self {
            slots: (0..num_slots).map(|_| SlotQueue::new(capacity_per_slot)).collect(),
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, idx: u32) -> &SlotQueue<T> {
        &self.slots[idx as usize]
    }

    /// Enqueues `item` onto `slot`, failing immediately (no async wait) if
    /// that slot's mailbox is full.
    pub fn try_send(&self, slot: u32, item: T) -> Result<(), T> {
        match self.slots[slot as usize].sender().try_send(item) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(item)) => Err(item),
            Err(mpsc::error::TrySendError::Closed(item)) => Err(item),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_batch_waits_for_first_then_drains_ready() {
        let queue: SlotQueue<i32> = SlotQueue::new(8);
        let tx = queue.sender();
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        tx.send(3).await.unwrap();

        let batch = queue.recv_batch(2, Duration::from_millis(50)).await;
        assert_eq!(batch, vec![1, 2]);
    }

    #[tokio::test]
    async fn recv_batch_times_out_empty_when_nothing_arrives() {
        let queue: SlotQueue<i32> = SlotQueue::new(8);
        let batch = queue.recv_batch(4, Duration::from_millis(10)).await;
        assert!(batch.is_empty());
    }

    #[test]
    fn multi_queue_routes_by_slot() {
        let mq: MultiQueue<i32> = MultiQueue::new(2, 4);
        mq.try_send(0, 10).unwrap();
        mq.try_send(1, 20).unwrap();
        assert_eq!(mq.num_slots(), 2);
    }

    #[test]
    fn full_slot_rejects_send() {
        let mq: MultiQueue<i32> = MultiQueue::new(1, 1);
        mq.try_send(0, 1).unwrap();
        assert_eq!(mq.try_send(0, 2), Err(2));
    }
}
