//! Size- and time-triggered batching.
//!
//! A [`BatchAccumulator`] buffers consumed entries and reports when the
//! buffer should be flushed:
//!
//! - **size**: buffered count reached the batch size
//! - **interval**: the flush interval elapsed since the last flush and the
//!   buffer is not empty
//!
//! The size trigger bounds the work per write; the interval trigger bounds
//! how long an event can wait in the buffer when traffic is low.

use std::time::{Duration, Instant};

/// Why a flush is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Interval,
}

#[derive(Debug)]
pub struct BatchAccumulator<T> {
    buffer: Vec<T>,
    batch_size: usize,
    flush_interval: Duration,
    last_flush: Instant,
}

impl<T> BatchAccumulator<T> {
    /// `batch_size` is clamped to at least 1.
    pub fn new(batch_size: usize, flush_interval: Duration) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            buffer: Vec::with_capacity(batch_size),
            batch_size,
            flush_interval,
            last_flush: Instant::now(),
        }
    }

    pub fn push(&mut self, item: T) {
        self.buffer.push(item);
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = T>) {
        self.buffer.extend(items);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// How many more items fit before the size trigger fires (at least 1).
    pub fn remaining_capacity(&self) -> usize {
        self.batch_size.saturating_sub(self.buffer.len()).max(1)
    }

    pub fn should_flush(&self) -> Option<FlushTrigger> {
        self.should_flush_at(Instant::now())
    }

    pub fn should_flush_at(&self, now: Instant) -> Option<FlushTrigger> {
        if self.buffer.len() >= self.batch_size {
            Some(FlushTrigger::Size)
        } else if !self.buffer.is_empty()
            && now.saturating_duration_since(self.last_flush) >= self.flush_interval
        {
            Some(FlushTrigger::Interval)
        } else {
            None
        }
    }

    /// Take the buffered items and restart the interval.
    pub fn drain(&mut self) -> Vec<T> {
        self.drain_at(Instant::now())
    }

    pub fn drain_at(&mut self, now: Instant) -> Vec<T> {
        self.last_flush = now;
        std::mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_trigger_ignores_elapsed_time() {
        let start = Instant::now();
        let mut acc = BatchAccumulator::new(3, Duration::from_secs(3600));
        acc.drain_at(start);
        acc.extend([1, 2]);
        assert_eq!(acc.should_flush_at(start), None);

        acc.push(3);
        assert_eq!(acc.should_flush_at(start), Some(FlushTrigger::Size));
    }

    #[test]
    fn test_interval_trigger_for_partial_batch() {
        let start = Instant::now();
        let interval = Duration::from_millis(250);
        let mut acc = BatchAccumulator::new(200, interval);
        acc.drain_at(start);
        acc.push("only one");

        assert_eq!(acc.should_flush_at(start + Duration::from_millis(249)), None);
        assert_eq!(
            acc.should_flush_at(start + interval),
            Some(FlushTrigger::Interval)
        );
    }

    #[test]
    fn test_empty_buffer_never_flushes_on_time() {
        let start = Instant::now();
        let mut acc: BatchAccumulator<u8> = BatchAccumulator::new(10, Duration::from_millis(1));
        acc.drain_at(start);
        assert_eq!(acc.should_flush_at(start + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_drain_resets_interval() {
        let start = Instant::now();
        let interval = Duration::from_millis(100);
        let mut acc = BatchAccumulator::new(10, interval);
        acc.drain_at(start);
        acc.push(1);

        let later = start + Duration::from_millis(150);
        assert_eq!(acc.drain_at(later), vec![1]);
        assert!(acc.is_empty());

        acc.push(2);
        assert_eq!(acc.should_flush_at(later + Duration::from_millis(50)), None);
        assert_eq!(
            acc.should_flush_at(later + interval),
            Some(FlushTrigger::Interval)
        );
    }

    #[test]
    fn test_remaining_capacity() {
        let mut acc = BatchAccumulator::new(3, Duration::from_secs(1));
        assert_eq!(acc.remaining_capacity(), 3);
        acc.extend([1, 2, 3, 4]);
        assert_eq!(acc.remaining_capacity(), 1);
    }

    #[test]
    fn test_zero_batch_size_clamped() {
        let mut acc = BatchAccumulator::new(0, Duration::from_secs(1));
        assert_eq!(acc.batch_size(), 1);
        acc.push(());
        assert_eq!(acc.should_flush(), Some(FlushTrigger::Size));
    }
}
