//! Readiness Tracker
//!
//! Records which peers hold the decoded resource for a readiness key and
//! wakes the barrier waiting on that key whenever its set changes.
//!
//! Sets only grow: a peer id is counted at most once per key and nothing
//! is ever removed.

use crate::lock_unpoisoned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use syncbox_common::{Locator, PeerId, RequestId};
use tokio::sync::Notify;
use tracing::debug;

/// What a readiness set is keyed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessScope {
    /// One set per locator for the life of the process
    ///
    /// Re-requesting a locator every peer already reported for releases
    /// the barrier immediately, before any fresh report arrives.
    Locator,

    /// One set per (locator, request id): every request needs fresh reports
    ///
    /// Entries are never evicted, so a long-running node keeps one entry
    /// per request it has seen and its memory grows with the request count.
    #[default]
    Request,
}

/// Key of one readiness set
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReadinessKey {
    locator: Locator,
    request_id: Option<RequestId>,
}

impl ReadinessKey {
    pub fn new(scope: ReadinessScope, locator: Locator, request_id: RequestId) -> Self {
        let request_id = match scope {
            ReadinessScope::Locator => None,
            ReadinessScope::Request => Some(request_id),
        };
        Self { locator, request_id }
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }
}

#[derive(Default)]
struct ReadinessEntry {
    ready: BTreeSet<PeerId>,
    /// (request, reporter, reason), in arrival order
    failures: Vec<(RequestId, PeerId, String)>,
    waiters: Arc<Notify>,
}

/// Thread-safe readiness sets with a wait-list per key
#[derive(Default)]
pub struct ReadinessTracker {
    entries: Mutex<HashMap<ReadinessKey, ReadinessEntry>>,
}

impl ReadinessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count `peer` as ready for `key`
    ///
    /// Returns true if the peer was newly inserted. Reporting the same peer
    /// twice leaves the count unchanged.
    pub fn mark_ready(&self, key: &ReadinessKey, peer: PeerId) -> bool {
        let mut entries = lock_unpoisoned(&self.entries);
        let entry = entries.entry(key.clone()).or_default();
        let inserted = entry.ready.insert(peer);
        if inserted {
            debug!("{} ready for {} ({} ready)", peer, key.locator, entry.ready.len());
            entry.waiters.notify_waiters();
        } else {
            debug!("Duplicate ready report from {} for {}", peer, key.locator);
        }
        inserted
    }

    /// Record a fetch/decode failure reported by `peer` for one request
    pub fn mark_failed(
        &self,
        key: &ReadinessKey,
        request_id: RequestId,
        peer: PeerId,
        reason: impl Into<String>,
    ) {
        let mut entries = lock_unpoisoned(&self.entries);
        let entry = entries.entry(key.clone()).or_default();
        entry.failures.push((request_id, peer, reason.into()));
        entry.waiters.notify_waiters();
    }

    /// Number of distinct peers ready for `key`
    pub fn count(&self, key: &ReadinessKey) -> usize {
        lock_unpoisoned(&self.entries)
            .get(key)
            .map(|entry| entry.ready.len())
            .unwrap_or(0)
    }

    /// Number of peers in `members` that are ready for `key`
    ///
    /// Reporters that have since left the session are not counted.
    pub fn count_among(&self, key: &ReadinessKey, members: &[PeerId]) -> usize {
        lock_unpoisoned(&self.entries)
            .get(key)
            .map(|entry| members.iter().filter(|peer| entry.ready.contains(peer)).count())
            .unwrap_or(0)
    }

    /// True once at least `total_peers` distinct peers reported
    pub fn is_complete(&self, key: &ReadinessKey, total_peers: usize) -> bool {
        self.count(key) >= total_peers
    }

    /// Ready peers for `key`, ascending
    pub fn ready_peers(&self, key: &ReadinessKey) -> Vec<PeerId> {
        lock_unpoisoned(&self.entries)
            .get(key)
            .map(|entry| entry.ready.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every failure recorded under `key` as (request, reporter, reason)
    pub fn failures(&self, key: &ReadinessKey) -> Vec<(RequestId, PeerId, String)> {
        lock_unpoisoned(&self.entries)
            .get(key)
            .map(|entry| entry.failures.clone())
            .unwrap_or_default()
    }

    /// First failure reported for `request_id` under `key`
    pub fn failure(&self, key: &ReadinessKey, request_id: RequestId) -> Option<(PeerId, String)> {
        lock_unpoisoned(&self.entries).get(key).and_then(|entry| {
            entry
                .failures
                .iter()
                .find(|(id, _, _)| *id == request_id)
                .map(|(_, peer, reason)| (*peer, reason.clone()))
        })
    }

    /// Wait-list for `key`, notified on every change to its set
    pub fn waiters(&self, key: &ReadinessKey) -> Arc<Notify> {
        let mut entries = lock_unpoisoned(&self.entries);
        Arc::clone(&entries.entry(key.clone()).or_default().waiters)
    }

    /// Wake every waiting barrier (membership changed)
    pub fn wake_all(&self) {
        for entry in lock_unpoisoned(&self.entries).values() {
            entry.waiters.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn key(scope: ReadinessScope, request_id: RequestId) -> ReadinessKey {
        ReadinessKey::new(scope, Locator::from("L1"), request_id)
    }

    #[test]
    fn test_duplicate_report_not_counted() {
        let tracker = ReadinessTracker::new();
        let key = key(ReadinessScope::Request, Uuid::new_v4());

        assert!(tracker.mark_ready(&key, PeerId(1)));
        assert!(!tracker.mark_ready(&key, PeerId(1)));
        assert!(tracker.mark_ready(&key, PeerId(2)));
        assert_eq!(tracker.count(&key), 2);
        assert_eq!(tracker.ready_peers(&key), vec![PeerId(1), PeerId(2)]);
    }

    #[test]
    fn test_count_among_ignores_departed_reporters() {
        let tracker = ReadinessTracker::new();
        let key = key(ReadinessScope::Request, Uuid::new_v4());
        tracker.mark_ready(&key, PeerId(1));
        tracker.mark_ready(&key, PeerId(3));

        assert_eq!(tracker.count(&key), 2);
        assert_eq!(tracker.count_among(&key, &[PeerId(1), PeerId(2)]), 1);
        assert_eq!(tracker.count_among(&key, &[PeerId(1), PeerId(2), PeerId(3)]), 2);
        assert_eq!(tracker.count_among(&key, &[]), 0);
    }

    #[test]
    fn test_is_complete_threshold() {
        let tracker = ReadinessTracker::new();
        let key = key(ReadinessScope::Request, Uuid::new_v4());

        assert!(!tracker.is_complete(&key, 2));
        tracker.mark_ready(&key, PeerId(1));
        assert!(!tracker.is_complete(&key, 2));
        tracker.mark_ready(&key, PeerId(2));
        assert!(tracker.is_complete(&key, 2));
        // Membership shrank below the count
        assert!(tracker.is_complete(&key, 1));
    }

    #[test]
    fn test_locator_scope_shares_sets_across_requests() {
        let tracker = ReadinessTracker::new();
        let first = key(ReadinessScope::Locator, Uuid::new_v4());
        let second = key(ReadinessScope::Locator, Uuid::new_v4());

        tracker.mark_ready(&first, PeerId(1));
        assert_eq!(first, second);
        assert_eq!(tracker.count(&second), 1);
    }

    #[test]
    fn test_request_scope_isolates_requests() {
        let tracker = ReadinessTracker::new();
        let first = key(ReadinessScope::Request, Uuid::new_v4());
        let second = key(ReadinessScope::Request, Uuid::new_v4());

        tracker.mark_ready(&first, PeerId(1));
        assert_eq!(tracker.count(&second), 0);
    }

    #[test]
    fn test_failure_scoped_to_request() {
        let tracker = ReadinessTracker::new();
        let failed = Uuid::new_v4();
        let other = Uuid::new_v4();
        let key = key(ReadinessScope::Locator, failed);

        tracker.mark_failed(&key, failed, PeerId(3), "unreachable");

        assert_eq!(
            tracker.failure(&key, failed),
            Some((PeerId(3), "unreachable".to_string()))
        );
        assert!(tracker.failure(&key, other).is_none());
        assert_eq!(tracker.failures(&key).len(), 1);
    }

    #[tokio::test]
    async fn test_waiters_woken_by_report() {
        let tracker = Arc::new(ReadinessTracker::new());
        let key = key(ReadinessScope::Request, Uuid::new_v4());
        let notify = tracker.waiters(&key);

        let notified = notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let reporter = Arc::clone(&tracker);
        let report_key = key.clone();
        tokio::spawn(async move {
            reporter.mark_ready(&report_key, PeerId(1));
        });

        tokio::time::timeout(Duration::from_secs(1), notified)
            .await
            .expect("report should wake the waiter");
        assert_eq!(tracker.count(&key), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reports() {
        let tracker = Arc::new(ReadinessTracker::new());
        let key = key(ReadinessScope::Request, Uuid::new_v4());

        let mut handles = Vec::new();
        for peer in 0..32u32 {
            for _ in 0..4 {
                let tracker = Arc::clone(&tracker);
                let key = key.clone();
                handles.push(tokio::spawn(async move {
                    tracker.mark_ready(&key, PeerId(peer));
                }));
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(tracker.count(&key), 32);
    }
}
