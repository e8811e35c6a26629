use std::collections::VecDeque;

use crate::types::NormalizedSample;

/// Hard ceiling on pending samples, about 40 s of a 4-sensor stream at 60 Hz.
pub const MAX_PENDING: usize = 10_000;

/// Bounded drop-oldest queue between normalization and the flush tick.
#[derive(Debug)]
pub struct IngressQueue {
    pending: VecDeque<NormalizedSample>,
    max_pending: usize,
    dropped: u64,
}

impl IngressQueue {
    pub fn new() -> Self {
        Self::with_limit(MAX_PENDING)
    }

    pub fn with_limit(max_pending: usize) -> Self {
        let max_pending = max_pending.max(1);
        IngressQueue {
            pending: VecDeque::with_capacity(max_pending.min(1024)),
            max_pending,
            dropped: 0,
        }
    }

    /// Append a sample, evicting the oldest entries past the ceiling.
    pub fn enqueue(&mut self, sample: NormalizedSample) {
        self.pending.push_back(sample);
        if self.pending.len() > self.max_pending {
            let excess = self.pending.len() - self.max_pending;
            self.discard_oldest(excess);
        }
    }

    /// Remove and return up to `n` of the oldest samples, in arrival order.
    pub fn drain_up_to(&mut self, n: usize) -> Vec<NormalizedSample> {
        let take = n.min(self.pending.len());
        self.pending.drain(..take).collect()
    }

    /// Drop the `n` oldest samples. Returns how many were dropped.
    pub fn discard_oldest(&mut self, n: usize) -> usize {
        let n = n.min(self.pending.len());
        self.pending.drain(..n);
        self.dropped += n as u64;
        n
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Total samples evicted since creation, by overflow or lag cap.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for IngressQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Reading, SensorId};

    fn sample(ts_ms: i64) -> NormalizedSample {
        NormalizedSample {
            sensor: SensorId::Temp,
            ts_ms,
            reading: Reading::Value(ts_ms as f64),
        }
    }

    fn timestamps(samples: &[NormalizedSample]) -> Vec<i64> {
        samples.iter().map(|s| s.ts_ms).collect()
    }

    #[test]
    fn test_drain_preserves_order() {
        let mut queue = IngressQueue::new();
        for ts in 0..5 {
            queue.enqueue(sample(ts));
        }
        assert_eq!(timestamps(&queue.drain_up_to(3)), vec![0, 1, 2]);
        assert_eq!(timestamps(&queue.drain_up_to(10)), vec![3, 4]);
        assert!(queue.drain_up_to(10).is_empty());
    }

    #[test]
    fn test_overflow_keeps_most_recent() {
        let limit = 8;
        for total in [limit, limit + 1, 3 * limit + 5] {
            let mut queue = IngressQueue::with_limit(limit);
            for ts in 0..total as i64 {
                queue.enqueue(sample(ts));
                assert!(queue.len() <= limit);
            }
            let expected: Vec<i64> = (total.saturating_sub(limit) as i64..total as i64).collect();
            assert_eq!(queue.dropped(), total.saturating_sub(limit) as u64);
            assert_eq!(timestamps(&queue.drain_up_to(usize::MAX)), expected);
        }
    }

    #[test]
    fn test_default_ceiling() {
        let mut queue = IngressQueue::default();
        for ts in 0..(MAX_PENDING as i64 + 250) {
            queue.enqueue(sample(ts));
        }
        assert_eq!(queue.len(), MAX_PENDING);
        let drained = queue.drain_up_to(1);
        assert_eq!(drained[0].ts_ms, 250);
    }

    #[test]
    fn test_discard_oldest_counts() {
        let mut queue = IngressQueue::new();
        for ts in 0..4 {
            queue.enqueue(sample(ts));
        }
        assert_eq!(queue.discard_oldest(10), 4);
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 4);
    }
}
