// Copyright 2026 Daniel Pelikan
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

//! Bounded FIFO of notifications waiting for platform buffer space.

use std::collections::VecDeque;

use tracing::{debug, warn};

use super::ble_constants::config;

/// Outbound payloads the platform could not accept yet.
///
/// Oldest entries are dropped first once the capacity is reached.
pub struct NotifyQueue {
    entries: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl NotifyQueue {
    pub fn new() -> Self {
        Self::with_capacity(config::NOTIFY_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a payload, discarding the oldest entry on overflow.
    pub fn push(&mut self, payload: Vec<u8>) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
            warn!("Notify queue full, dropped oldest payload");
        }
        self.entries.push_back(payload);
    }

    /// Offer queued payloads to `deliver` in order, stopping at the first one
    /// it rejects. Returns the number delivered.
    pub fn drain_with(&mut self, mut deliver: impl FnMut(&[u8]) -> bool) -> usize {
        let mut delivered = 0;
        while let Some(front) = self.entries.front() {
            if !deliver(front) {
                break;
            }
            self.entries.pop_front();
            delivered += 1;
        }
        if delivered > 0 {
            debug!(
                "Flushed {} queued notifications, {} remaining",
                delivered,
                self.entries.len()
            );
        }
        delivered
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for NotifyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_drops_oldest() {
        let mut queue = NotifyQueue::new();
        for i in 0..150u32 {
            queue.push(i.to_be_bytes().to_vec());
        }
        assert_eq!(queue.len(), 100);

        let mut seen = Vec::new();
        queue.drain_with(|payload| {
            seen.push(u32::from_be_bytes(payload.try_into().unwrap()));
            true
        });
        assert_eq!(seen, (50..150).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_stops_at_first_rejection() {
        let mut queue = NotifyQueue::with_capacity(10);
        for b in [1u8, 2, 3, 4] {
            queue.push(vec![b]);
        }

        let mut budget = 2;
        let mut seen = Vec::new();
        let delivered = queue.drain_with(|payload| {
            if budget == 0 {
                return false;
            }
            budget -= 1;
            seen.push(payload[0]);
            true
        });

        assert_eq!(delivered, 2);
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(queue.len(), 2);

        let mut rest = Vec::new();
        queue.drain_with(|payload| {
            rest.push(payload[0]);
            true
        });
        assert_eq!(rest, vec![3, 4]);
    }
}
