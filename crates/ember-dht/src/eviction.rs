//! Eviction challenge bookkeeping.
//!
//! When a bucket is full and a fresh peer wants in, the least-recently-seen
//! incumbent is challenged with a PING rather than replaced outright. This
//! tracker records outstanding challenges; the protocol handler resolves
//! them on PONG and the periodic sweep resolves them on timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ember_core::NodeId;

/// An outstanding challenge against a bucket incumbent.
#[derive(Debug, Clone)]
pub struct EvictionChallenge {
    /// The candidate waiting for the incumbent's slot.
    pub replacement: NodeId,
    /// When the challenge PING was sent.
    pub challenged_at: Instant,
}

/// Outstanding eviction challenges, keyed by the challenged incumbent.
#[derive(Debug, Default)]
pub struct EvictionTracker {
    challenges: HashMap<NodeId, EvictionChallenge>,
}

impl EvictionTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a challenge against `challenged`, keeping any existing one
    /// (at most one challenge per incumbent).
    ///
    /// Returns true if the tracker went from empty to non-empty, i.e. the
    /// timeout sweep must be started.
    pub fn challenge(&mut self, challenged: NodeId, replacement: NodeId, now: Instant) -> bool {
        let was_empty = self.challenges.is_empty();
        self.challenges
            .entry(challenged)
            .or_insert(EvictionChallenge {
                replacement,
                challenged_at: now,
            });
        was_empty && !self.challenges.is_empty()
    }

    /// Resolves a challenge answered by `challenged` within the window.
    ///
    /// Returns the replacement to discard if the incumbent survived. A
    /// challenge answered after the window is left for the sweep.
    pub fn resolve(
        &mut self,
        challenged: &NodeId,
        now: Instant,
        window: Duration,
    ) -> Option<NodeId> {
        let fresh = self
            .challenges
            .get(challenged)
            .is_some_and(|c| now.duration_since(c.challenged_at) <= window);
        if !fresh {
            return None;
        }
        self.challenges
            .remove(challenged)
            .map(|c| c.replacement)
    }

    /// Removes and returns every challenge older than the window, as
    /// `(challenged, replacement)` pairs.
    pub fn take_timed_out(&mut self, now: Instant, window: Duration) -> Vec<(NodeId, NodeId)> {
        let expired: Vec<NodeId> = self
            .challenges
            .iter()
            .filter(|(_, c)| now.duration_since(c.challenged_at) > window)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.challenges.remove(&id).map(|c| (id, c.replacement)))
            .collect()
    }

    /// Returns true if no challenges are outstanding.
    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }

    /// Number of outstanding challenges.
    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    /// Looks up the outstanding challenge for an incumbent.
    pub fn get(&self, challenged: &NodeId) -> Option<&EvictionChallenge> {
        self.challenges.get(challenged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(300);

    #[test]
    fn test_challenge_once_per_incumbent() {
        let mut tracker = EvictionTracker::new();
        let incumbent = NodeId::random();
        let first = NodeId::random();
        let second = NodeId::random();
        let now = Instant::now();

        assert!(tracker.challenge(incumbent, first, now));
        assert!(!tracker.challenge(incumbent, second, now));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.get(&incumbent).unwrap().replacement, first);
    }

    #[test]
    fn test_resolve_within_window() {
        let mut tracker = EvictionTracker::new();
        let incumbent = NodeId::random();
        let replacement = NodeId::random();
        let start = Instant::now();
        tracker.challenge(incumbent, replacement, start);

        assert_eq!(
            tracker.resolve(&incumbent, start + Duration::from_millis(100), WINDOW),
            Some(replacement)
        );
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_late_answer_left_for_sweep() {
        let mut tracker = EvictionTracker::new();
        let incumbent = NodeId::random();
        let start = Instant::now();
        tracker.challenge(incumbent, NodeId::random(), start);

        assert_eq!(
            tracker.resolve(&incumbent, start + Duration::from_millis(500), WINDOW),
            None
        );
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_resolve_unknown_incumbent() {
        let mut tracker = EvictionTracker::new();
        assert_eq!(tracker.resolve(&NodeId::random(), Instant::now(), WINDOW), None);
    }

    #[test]
    fn test_take_timed_out() {
        let mut tracker = EvictionTracker::new();
        let stale = NodeId::random();
        let stale_replacement = NodeId::random();
        let fresh = NodeId::random();
        let start = Instant::now();

        tracker.challenge(stale, stale_replacement, start);
        tracker.challenge(fresh, NodeId::random(), start + Duration::from_millis(400));

        let timed_out = tracker.take_timed_out(start + Duration::from_millis(500), WINDOW);
        assert_eq!(timed_out, vec![(stale, stale_replacement)]);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get(&fresh).is_some());
    }
}
