// src/bot/window.rs - Trailing time-window event counter

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Counts events inside a trailing time window.
///
/// Timestamps are kept sorted so counting is a binary search. Events older
/// than the largest window ever queried can never be counted again and are
/// dropped lazily on query. Timestamps in the future are counted as-is;
/// callers are expected to hand in sane clocks.
///
/// The counter itself is not synchronized. Detectors keep counters inside a
/// sharded map and mutate them under the entry lock.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindowCounter {
    events: VecDeque<DateTime<Utc>>,
    max_window: Option<Duration>,
}

impl SlidingWindowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event
    pub fn add(&mut self, timestamp: DateTime<Utc>) {
        match self.events.back() {
            Some(last) if *last > timestamp => {
                let index = self.events.partition_point(|e| *e <= timestamp);
                self.events.insert(index, timestamp);
            }
            _ => self.events.push_back(timestamp),
        }
    }

    /// Number of events with `now - timestamp <= window`
    pub fn count_within(&mut self, window: Duration, now: DateTime<Utc>) -> usize {
        if window <= Duration::zero() {
            return 0;
        }

        if self.max_window.map_or(true, |max| window > max) {
            self.max_window = Some(window);
        }
        self.prune(now);

        let cutoff = now - window;
        self.events.len() - self.events.partition_point(|e| *e < cutoff)
    }

    /// Whether nothing recorded could still fall inside any window queried so far
    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        match (self.events.back(), self.max_window) {
            (None, _) => true,
            (Some(last), Some(max)) => *last < now - max,
            (Some(_), None) => false,
        }
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let Some(max) = self.max_window else {
            return;
        };
        let cutoff = now - max;
        while self.events.front().is_some_and(|e| *e < cutoff) {
            self.events.pop_front();
        }
    }
}
