//! Deadline tracking for sleeping and timed waits.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

/// Maps an absolute deadline (microseconds of uptime) to the threads to wake
/// when it arrives. The map is sorted, so expiry collection stops at the
/// first pending deadline.
pub struct DeadlineTracker {
    deadlines: BTreeMap<u64, Vec<(u64, u32)>>,
}

impl DeadlineTracker {
    pub const fn new() -> Self {
        DeadlineTracker {
            deadlines: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, pid: u64, tid: u32, deadline_us: u64) {
        self.deadlines
            .entry(deadline_us)
            .or_insert_with(Vec::new)
            .push((pid, tid));
    }

    /// Collect every thread whose deadline is at or before `now_us`.
    pub fn collect_expired(&mut self, now_us: u64) -> Vec<(u64, u32)> {
        let mut expired = Vec::new();
        let mut done = Vec::new();
        for (&deadline, threads) in &self.deadlines {
            if deadline > now_us {
                break;
            }
            expired.extend(threads.iter().copied());
            done.push(deadline);
        }
        for deadline in done {
            self.deadlines.remove(&deadline);
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.deadlines.keys().next().copied()
    }

    pub fn remove_thread(&mut self, pid: u64, tid: u32) {
        self.deadlines.retain(|_, threads| {
            threads.retain(|&entry| entry != (pid, tid));
            !threads.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_ordered_and_consumed() {
        let mut tracker = DeadlineTracker::new();
        tracker.register(1, 0, 100);
        tracker.register(2, 0, 50);
        tracker.register(3, 0, 200);

        assert_eq!(tracker.next_deadline(), Some(50));
        let expired = tracker.collect_expired(150);
        assert_eq!(expired, alloc::vec![(2, 0), (1, 0)]);
        assert_eq!(tracker.next_deadline(), Some(200));
        assert!(tracker.collect_expired(150).is_empty());
    }
}
