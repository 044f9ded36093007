//! Bounded per-session metric history.

use std::collections::VecDeque;

use serde::Serialize;

use super::events::StatsSample;
use crate::daemon::{MemoryUsage, NetworkUsage};

/// Samples kept per metric family.
pub const HISTORY_CAPACITY: usize = 24;

/// Fixed-capacity FIFO; pushing onto a full buffer evicts the oldest item.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Bytes moved since the previous sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkRate {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Point-in-time copy of every buffer, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistorySnapshot {
    pub cpu: Vec<f64>,
    pub memory: Vec<MemoryUsage>,
    pub network: Vec<NetworkRate>,
}

/// Three independent buffers, one per metric family.
///
/// Daemons report cumulative network counters; the stored value is the
/// non-negative difference to the previous sample. The first sample seeds the
/// baseline and records a rate of zero.
#[derive(Debug, Clone)]
pub struct StatsHistory {
    cpu: RingBuffer<f64>,
    memory: RingBuffer<MemoryUsage>,
    network: RingBuffer<NetworkRate>,
    previous: Option<NetworkUsage>,
}

impl Default for StatsHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsHistory {
    pub fn new() -> Self {
        Self {
            cpu: RingBuffer::new(HISTORY_CAPACITY),
            memory: RingBuffer::new(HISTORY_CAPACITY),
            network: RingBuffer::new(HISTORY_CAPACITY),
            previous: None,
        }
    }

    pub fn record(&mut self, sample: &StatsSample) -> NetworkRate {
        let previous = self.previous.unwrap_or(sample.network);
        let rate = NetworkRate {
            rx_bytes: sample.network.rx_bytes.saturating_sub(previous.rx_bytes),
            tx_bytes: sample.network.tx_bytes.saturating_sub(previous.tx_bytes),
        };
        self.previous = Some(sample.network);

        self.cpu.push(sample.cpu_percent);
        self.memory.push(sample.memory);
        self.network.push(rate);
        rate
    }

    pub fn cpu(&self) -> &RingBuffer<f64> {
        &self.cpu
    }

    pub fn memory(&self) -> &RingBuffer<MemoryUsage> {
        &self.memory
    }

    pub fn network(&self) -> &RingBuffer<NetworkRate> {
        &self.network
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            cpu: self.cpu.to_vec(),
            memory: self.memory.to_vec(),
            network: self.network.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: u64, rx: u64) -> StatsSample {
        StatsSample {
            cpu_percent: n as f64,
            memory: MemoryUsage {
                used: n,
                limit: 100,
                percent: n as f64,
            },
            network: NetworkUsage {
                rx_bytes: rx,
                tx_bytes: 0,
            },
        }
    }

    #[test]
    fn test_rates_are_seeded_and_never_negative() {
        let mut history = StatsHistory::new();
        let rates: Vec<u64> = [1000, 1000, 1500, 1400]
            .into_iter()
            .enumerate()
            .map(|(i, rx)| history.record(&sample(i as u64, rx)).rx_bytes)
            .collect();
        assert_eq!(rates, vec![0, 0, 500, 0]);
    }

    #[test]
    fn test_buffers_keep_last_24_samples() {
        let mut history = StatsHistory::new();
        for n in 1..=30 {
            history.record(&sample(n, n * 10));
        }

        assert_eq!(history.cpu().len(), HISTORY_CAPACITY);
        assert_eq!(history.memory().len(), HISTORY_CAPACITY);
        assert_eq!(history.network().len(), HISTORY_CAPACITY);

        let cpu: Vec<f64> = history.cpu().iter().copied().collect();
        let expected: Vec<f64> = (7..=30).map(|n| n as f64).collect();
        assert_eq!(cpu, expected);

        let used: Vec<u64> = history.memory().iter().map(|m| m.used).collect();
        assert_eq!(used, (7..=30).collect::<Vec<u64>>());
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut buffer = RingBuffer::new(2);
        assert!(buffer.is_empty());
        buffer.push(1);
        buffer.push(2);
        buffer.push(3);
        assert_eq!(buffer.to_vec(), vec![2, 3]);
    }

    #[test]
    fn test_snapshot_matches_buffers() {
        let mut history = StatsHistory::new();
        history.record(&sample(1, 100));
        history.record(&sample(2, 250));

        let snapshot = history.snapshot();
        assert_eq!(snapshot.cpu, vec![1.0, 2.0]);
        assert_eq!(snapshot.network[1].rx_bytes, 150);
    }
}
