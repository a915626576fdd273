//! Per-lane recency tracking.
//!
//! Every accepted trigger gets a sequence number; higher means more recently
//! triggered. The tracker remembers, per lane, the newest run that reached
//! `Proposed`, and hands out the lock that serializes the check-then-submit
//! step of one lane.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct LaneState {
    latest_proposed: Option<(u64, String)>,
    submit_lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Debug, Default)]
pub struct LaneTracker {
    last_sequence: Mutex<u64>,
    lanes: Mutex<HashMap<String, LaneState>>,
}

impl LaneTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Milliseconds since the epoch, bumped so values are strictly
    /// increasing within this process. The wall clock keeps them comparable
    /// with sequences issued by other processes.
    pub fn next_sequence(&self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut last = self.last_sequence.lock().unwrap_or_else(|e| e.into_inner());
        *last = now.max(*last + 1);
        *last
    }

    /// Revision of a newer run than `sequence` that already reached `Proposed`.
    pub fn newer_proposed(&self, lane: &str, sequence: u64) -> Option<String> {
        let lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes
            .get(lane)
            .and_then(|s| s.latest_proposed.as_ref())
            .filter(|(seq, _)| *seq > sequence)
            .map(|(_, revision)| revision.clone())
    }

    pub fn mark_proposed(&self, lane: &str, sequence: u64, revision: &str) {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let state = lanes.entry(lane.to_string()).or_default();
        if state.latest_proposed.as_ref().is_none_or(|(seq, _)| *seq < sequence) {
            state.latest_proposed = Some((sequence, revision.to_string()));
        }
    }

    pub fn submit_lock(&self, lane: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&lanes.entry(lane.to_string()).or_default().submit_lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequences_strictly_increase() {
        let tracker = LaneTracker::new();
        let mut prev = tracker.next_sequence();
        for _ in 0..1000 {
            let next = tracker.next_sequence();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_newer_proposed() {
        let tracker = LaneTracker::new();
        assert_eq!(tracker.newer_proposed("app", 1), None);
        tracker.mark_proposed("app", 2, "def5678");
        assert_eq!(tracker.newer_proposed("app", 1).as_deref(), Some("def5678"));
        assert_eq!(tracker.newer_proposed("app", 2), None);
        tracker.mark_proposed("app", 1, "abc1234");
        assert_eq!(tracker.newer_proposed("app", 1).as_deref(), Some("def5678"));
        assert_eq!(tracker.newer_proposed("worker", 1), None);
    }

    #[test]
    fn test_submit_lock_is_shared_per_lane() {
        let tracker = LaneTracker::new();
        let a = tracker.submit_lock("app");
        let b = tracker.submit_lock("app");
        let c = tracker.submit_lock("worker");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
