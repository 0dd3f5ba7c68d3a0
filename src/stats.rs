//! Windowed message statistics.
//!
//! An optional ring of atomic counters keyed by wall-clock window: every
//! routed message bumps the head counter, a background task rotates a fresh
//! head in every `duration` and trims the ring to its limit. Reads take the
//! ring lock; the counters themselves are atomic so the hot path only ever
//! takes a read lock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::StatisticsConfig;

pub(crate) struct MessageStatistics {
    windows: RwLock<Vec<Arc<AtomicI64>>>,
    duration: Duration,
    limit: usize,
}

impl MessageStatistics {
    pub(crate) fn new(config: &StatisticsConfig) -> Self {
        Self {
            windows: RwLock::new(vec![Arc::new(AtomicI64::new(0))]),
            duration: config.duration,
            limit: config.limit.max(1),
        }
    }

    pub(crate) fn duration(&self) -> Duration {
        self.duration
    }

    /// Counts one message against the current window.
    pub(crate) fn hit(&self) {
        if let Ok(windows) = self.windows.read() {
            if let Some(head) = windows.first() {
                head.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Starts a new window, trimming the ring to its limit.
    pub(crate) fn rotate(&self) {
        if let Ok(mut windows) = self.windows.write() {
            windows.insert(0, Arc::new(AtomicI64::new(0)));
            windows.truncate(self.limit);
        }
    }

    /// Message count in the window `offset` rotations ago; `0` is current.
    /// Returns `0` for offsets past the retained history.
    pub(crate) fn count_by_offset(&self, offset: usize) -> i64 {
        self.windows
            .read()
            .ok()
            .and_then(|windows| windows.get(offset).map(|w| w.load(Ordering::Relaxed)))
            .unwrap_or(0)
    }

    /// Counts for every retained window, current first.
    pub(crate) fn all_counts(&self) -> Vec<i64> {
        self.windows
            .read()
            .map(|windows| windows.iter().map(|w| w.load(Ordering::Relaxed)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(limit: usize) -> MessageStatistics {
        MessageStatistics::new(&StatisticsConfig {
            duration: Duration::from_millis(10),
            limit,
        })
    }

    #[test]
    fn hits_land_in_current_window() {
        let s = stats(4);
        s.hit();
        s.hit();
        assert_eq!(s.count_by_offset(0), 2);
        assert_eq!(s.count_by_offset(1), 0);
    }

    #[test]
    fn rotation_shifts_and_trims() {
        let s = stats(2);
        s.hit();
        s.rotate();
        assert_eq!(s.count_by_offset(0), 0);
        assert_eq!(s.count_by_offset(1), 1);

        s.rotate();
        // The original window fell off the end of the ring.
        assert_eq!(s.all_counts(), vec![0, 0]);
    }
}
