//! Playback Coordinator
//!
//! Drives one playback request through its phases:
//!
//! ```text
//! Idle -> Fetching -> AwaitingBarrier -> Dispatching -> Idle
//! ```
//!
//! Every node fetches (cache hit skips `Fetching`) and broadcasts
//! `ReportReady`. Only the requester's node then waits on the readiness
//! barrier and broadcasts `SyncPlayback`, exactly once per request. The
//! other nodes return to `Idle` as soon as they have reported.
//!
//! The barrier target is the live member count read at check time, so a
//! peer leaving mid-wait lowers it.

use crate::error::{Error, Result};
use crate::pipeline::FetchPipeline;
use crate::readiness::{ReadinessKey, ReadinessScope, ReadinessTracker};
use crate::session::SessionLayer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use syncbox_common::events::{BarrierRelease, EventBus, SyncboxEvent};
use syncbox_common::{Locator, PeerId, PeerMessage, RequestId};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What the barrier does when its timeout elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Give up; no playback
    #[default]
    Abort,
    /// Dispatch anyway; peers without the buffer log a dispatch error
    ProceedWithReady,
}

/// Barrier wait parameters
#[derive(Debug, Clone, PartialEq)]
pub struct BarrierPolicy {
    /// None waits forever
    pub timeout: Option<Duration>,
    pub on_timeout: TimeoutAction,
    /// Re-check interval so membership changes are observed
    pub poll_interval: Duration,
}

impl Default for BarrierPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            on_timeout: TimeoutAction::Abort,
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    pub scope: ReadinessScope,
    pub barrier: BarrierPolicy,
    /// Broadcast ReportFailed when the local fetch/decode fails
    pub broadcast_failures: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            scope: ReadinessScope::default(),
            barrier: BarrierPolicy::default(),
            broadcast_failures: true,
        }
    }
}

/// How a barrier wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BarrierOutcome {
    /// Every live member reported ready
    Complete { ready: usize },
    /// Timeout elapsed first
    TimedOut { ready: usize, expected: usize },
    /// A member reported a failure for this request
    Aborted { reporter: PeerId, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Fetching,
    AwaitingBarrier,
    Dispatching,
}

/// One request in flight on this node
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackSession {
    pub request_id: RequestId,
    pub locator: Locator,
    pub requester: PeerId,
    pub phase: SessionPhase,
    pub started_at: DateTime<Utc>,
}

pub struct PlaybackCoordinator {
    session: Arc<dyn SessionLayer>,
    pipeline: Arc<FetchPipeline>,
    tracker: Arc<ReadinessTracker>,
    events: EventBus,
    settings: CoordinatorSettings,
    sessions: RwLock<HashMap<RequestId, PlaybackSession>>,
}

impl PlaybackCoordinator {
    pub fn new(
        session: Arc<dyn SessionLayer>,
        pipeline: Arc<FetchPipeline>,
        tracker: Arc<ReadinessTracker>,
        events: EventBus,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            session,
            pipeline,
            tracker,
            events,
            settings,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn pipeline(&self) -> &Arc<FetchPipeline> {
        &self.pipeline
    }

    pub fn readiness_key(&self, locator: &Locator, request_id: RequestId) -> ReadinessKey {
        ReadinessKey::new(self.settings.scope, locator.clone(), request_id)
    }

    /// Run one RequestPlayback to completion on this node
    ///
    /// Returns the barrier outcome on the requester's node and `None`
    /// elsewhere. Fetch, decode and broadcast failures end the session
    /// with an error.
    pub async fn handle_request(
        &self,
        locator: Locator,
        requester: PeerId,
        request_id: RequestId,
    ) -> Result<Option<BarrierOutcome>> {
        let local = self.session.local_peer_id();
        let is_requester = requester == local;

        info!(
            "Playback of {} requested by {} (request {})",
            locator, requester, request_id
        );
        self.events.emit_lossy(SyncboxEvent::PlaybackRequested {
            locator: locator.clone(),
            requester,
            request_id,
            timestamp: Utc::now(),
        });

        let result = self
            .drive(&locator, requester, request_id, local, is_requester)
            .await;
        self.sessions.write().await.remove(&request_id);
        result
    }

    async fn drive(
        &self,
        locator: &Locator,
        requester: PeerId,
        request_id: RequestId,
        local: PeerId,
        is_requester: bool,
    ) -> Result<Option<BarrierOutcome>> {
        if !self.pipeline.cache().contains(locator).await {
            self.enter_phase(locator, requester, request_id, SessionPhase::Fetching)
                .await;
        }

        if let Err(e) = self.pipeline.fetch_and_decode(locator).await {
            error!("Fetch of {} failed: {}", locator, e);
            self.report_local_failure(locator, request_id, &e);
            return Err(e);
        }

        debug!("{} ready for {}, reporting", local, locator);
        self.session.broadcast(PeerMessage::ReportReady {
            reporter: local,
            locator: locator.clone(),
            request_id,
        })?;

        if !is_requester {
            return Ok(None);
        }

        self.enter_phase(locator, requester, request_id, SessionPhase::AwaitingBarrier)
            .await;
        let key = self.readiness_key(locator, request_id);
        let outcome = self.wait_for_barrier(&key, request_id).await;

        let expected = self.session.peer_count();
        let (release, ready, dispatch) = match &outcome {
            BarrierOutcome::Complete { ready } => (BarrierRelease::Complete, *ready, true),
            BarrierOutcome::TimedOut { ready, .. } => match self.settings.barrier.on_timeout {
                TimeoutAction::ProceedWithReady => {
                    warn!(
                        "Barrier for {} timed out with {}/{} ready, proceeding",
                        locator, ready, expected
                    );
                    (BarrierRelease::ProceededWithReady, *ready, true)
                }
                TimeoutAction::Abort => {
                    error!(
                        "Barrier for {} timed out with {}/{} ready, aborting",
                        locator, ready, expected
                    );
                    (BarrierRelease::TimedOut, *ready, false)
                }
            },
            BarrierOutcome::Aborted { reporter, reason } => {
                error!(
                    "Playback of {} aborted: {} failed ({})",
                    locator, reporter, reason
                );
                (BarrierRelease::Aborted, self.live_ready(&key).0, false)
            }
        };

        self.events.emit_lossy(SyncboxEvent::BarrierReleased {
            locator: locator.clone(),
            request_id,
            release,
            ready,
            expected,
            timestamp: Utc::now(),
        });

        if dispatch {
            self.enter_phase(locator, requester, request_id, SessionPhase::Dispatching)
                .await;
            info!("All peers ready for {}, starting playback", locator);
            self.session.broadcast(PeerMessage::SyncPlayback {
                locator: locator.clone(),
                requester,
                request_id,
            })?;
        }

        Ok(Some(outcome))
    }

    /// Emit FetchFailed for `request_id` and, when enabled, tell the other
    /// peers with a ReportFailed
    pub fn report_local_failure(&self, locator: &Locator, request_id: RequestId, error: &Error) {
        self.events.emit_lossy(SyncboxEvent::FetchFailed {
            locator: locator.clone(),
            request_id,
            error: error.to_string(),
            timestamp: Utc::now(),
        });

        if self.settings.broadcast_failures {
            let notice = PeerMessage::ReportFailed {
                reporter: self.session.local_peer_id(),
                locator: locator.clone(),
                request_id,
                reason: error.to_string(),
            };
            if let Err(send_err) = self.session.broadcast(notice) {
                warn!("Failed to broadcast failure notice: {}", send_err);
            }
        }
    }

    /// Ready peers for `key` that are still session members
    fn live_ready(&self, key: &ReadinessKey) -> (usize, usize) {
        let members = self.session.members();
        (self.tracker.count_among(key, &members), members.len())
    }

    /// Wait until the barrier for `key` releases
    ///
    /// Never busy-waits: sleeps on the key's wait-list, waking on every
    /// readiness change, every poll tick and the deadline.
    pub async fn wait_for_barrier(&self, key: &ReadinessKey, request_id: RequestId) -> BarrierOutcome {
        let notify = self.tracker.waiters(key);
        let policy = &self.settings.barrier;
        let deadline = policy.timeout.map(|timeout| Instant::now() + timeout);

        loop {
            // Registered before the checks so a report landing in between
            // still wakes us
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some((reporter, reason)) = self.tracker.failure(key, request_id) {
                return BarrierOutcome::Aborted { reporter, reason };
            }

            let (ready, expected) = self.live_ready(key);
            if ready >= expected {
                return BarrierOutcome::Complete { ready };
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return BarrierOutcome::TimedOut { ready, expected };
                }
            }

            debug!("Barrier for {}: {}/{} ready", key.locator(), ready, expected);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(policy.poll_interval) => {}
                _ = sleep_until(deadline) => {}
            }
        }
    }

    /// Count a ReportReady; returns true if it was new
    pub fn record_ready(&self, reporter: PeerId, locator: &Locator, request_id: RequestId) -> bool {
        let key = self.readiness_key(locator, request_id);
        let inserted = self.tracker.mark_ready(&key, reporter);
        if inserted {
            self.events.emit_lossy(SyncboxEvent::PeerReady {
                locator: locator.clone(),
                request_id,
                reporter,
                ready: self.tracker.count(&key),
                timestamp: Utc::now(),
            });
        }
        inserted
    }

    /// Record a ReportFailed
    pub fn record_failed(
        &self,
        reporter: PeerId,
        locator: &Locator,
        request_id: RequestId,
        reason: &str,
    ) {
        warn!("{} failed to fetch {}: {}", reporter, locator, reason);
        let key = self.readiness_key(locator, request_id);
        self.tracker.mark_failed(&key, request_id, reporter, reason);
        self.events.emit_lossy(SyncboxEvent::PeerFailed {
            locator: locator.clone(),
            request_id,
            reporter,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Requests currently in flight on this node, oldest first
    pub async fn active_sessions(&self) -> Vec<PlaybackSession> {
        let mut sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|session| session.started_at);
        sessions
    }

    async fn enter_phase(
        &self,
        locator: &Locator,
        requester: PeerId,
        request_id: RequestId,
        phase: SessionPhase,
    ) {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(request_id)
            .and_modify(|session| session.phase = phase)
            .or_insert_with(|| PlaybackSession {
                request_id,
                locator: locator.clone(),
                requester,
                phase,
                started_at: Utc::now(),
            });
        debug!("Request {} entered {:?}", request_id, phase);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResourceCache;
    use crate::pipeline::{AudioDecoder, DecodedAudio, FetchedResource, ResourceFetcher};
    use crate::session::LoopbackHub;
    use async_trait::async_trait;
    use std::path::Path;
    use uuid::Uuid;

    struct StaticFetcher;

    #[async_trait]
    impl ResourceFetcher for StaticFetcher {
        async fn fetch(&self, locator: &Locator) -> Result<FetchedResource> {
            Ok(FetchedResource {
                path: locator.as_str().into(),
                label: locator.to_string(),
                scratch: None,
            })
        }
    }

    struct SilentDecoder;

    impl AudioDecoder for SilentDecoder {
        fn decode(&self, _path: &Path) -> Result<DecodedAudio> {
            Ok(DecodedAudio::new(vec![0.0; 16], 44100, 2))
        }
    }

    fn coordinator(
        hub: &LoopbackHub,
        settings: CoordinatorSettings,
    ) -> (PlaybackCoordinator, Arc<ReadinessTracker>) {
        let (session, _inbox) = hub.join();
        let events = EventBus::new(64);
        let pipeline = Arc::new(FetchPipeline::new(
            Arc::new(StaticFetcher),
            Arc::new(SilentDecoder),
            Arc::new(ResourceCache::new()),
            events.clone(),
        ));
        let tracker = Arc::new(ReadinessTracker::new());
        let coordinator =
            PlaybackCoordinator::new(session, pipeline, Arc::clone(&tracker), events, settings);
        (coordinator, tracker)
    }

    #[tokio::test]
    async fn test_barrier_completes_on_reports() {
        let hub = LoopbackHub::new();
        let (coordinator, _tracker) = coordinator(&hub, CoordinatorSettings::default());
        let _second = hub.join();

        let request_id = Uuid::new_v4();
        let locator = Locator::from("L1");
        let key = coordinator.readiness_key(&locator, request_id);

        assert!(coordinator.record_ready(PeerId(1), &locator, request_id));
        assert!(!coordinator.record_ready(PeerId(1), &locator, request_id));

        let waiter = coordinator.wait_for_barrier(&key, request_id);
        tokio::pin!(waiter);
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut waiter)
            .await
            .is_err());

        coordinator.record_ready(PeerId(2), &locator, request_id);
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap();
        assert_eq!(outcome, BarrierOutcome::Complete { ready: 2 });
    }

    #[tokio::test]
    async fn test_barrier_follows_membership() {
        let hub = LoopbackHub::new();
        let (coordinator, _tracker) = coordinator(&hub, CoordinatorSettings::default());
        let (second, _inbox) = hub.join();

        let request_id = Uuid::new_v4();
        let locator = Locator::from("L1");
        coordinator.record_ready(PeerId(1), &locator, request_id);
        let key = coordinator.readiness_key(&locator, request_id);

        hub.leave(second.local_peer_id());
        // Picked up by the poll interval
        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            coordinator.wait_for_barrier(&key, request_id),
        )
        .await
        .unwrap();
        assert_eq!(outcome, BarrierOutcome::Complete { ready: 1 });
    }

    #[tokio::test]
    async fn test_departed_reporter_not_counted() {
        let hub = LoopbackHub::new();
        let settings = CoordinatorSettings {
            barrier: BarrierPolicy {
                timeout: Some(Duration::from_millis(100)),
                ..BarrierPolicy::default()
            },
            ..CoordinatorSettings::default()
        };
        let (coordinator, _tracker) = coordinator(&hub, settings);
        let _second = hub.join();
        let (third, _third_inbox) = hub.join();

        let request_id = Uuid::new_v4();
        let locator = Locator::from("L1");
        coordinator.record_ready(PeerId(1), &locator, request_id);
        coordinator.record_ready(PeerId(3), &locator, request_id);
        hub.leave(third.local_peer_id());

        // Two reports against two members, but peer 2 has not reported
        let key = coordinator.readiness_key(&locator, request_id);
        let outcome = coordinator.wait_for_barrier(&key, request_id).await;
        assert_eq!(outcome, BarrierOutcome::TimedOut { ready: 1, expected: 2 });
    }

    #[tokio::test]
    async fn test_barrier_timeout() {
        let hub = LoopbackHub::new();
        let settings = CoordinatorSettings {
            barrier: BarrierPolicy {
                timeout: Some(Duration::from_millis(50)),
                ..BarrierPolicy::default()
            },
            ..CoordinatorSettings::default()
        };
        let (coordinator, _tracker) = coordinator(&hub, settings);
        let _second = hub.join();

        let request_id = Uuid::new_v4();
        let key = coordinator.readiness_key(&Locator::from("L1"), request_id);
        let outcome = coordinator.wait_for_barrier(&key, request_id).await;
        assert_eq!(outcome, BarrierOutcome::TimedOut { ready: 0, expected: 2 });
    }

    #[tokio::test]
    async fn test_barrier_aborts_on_failure() {
        let hub = LoopbackHub::new();
        let (coordinator, _tracker) = coordinator(&hub, CoordinatorSettings::default());
        let _second = hub.join();

        let request_id = Uuid::new_v4();
        let locator = Locator::from("L1");
        coordinator.record_failed(PeerId(2), &locator, request_id, "404");

        let key = coordinator.readiness_key(&locator, request_id);
        let outcome = coordinator.wait_for_barrier(&key, request_id).await;
        assert_eq!(
            outcome,
            BarrierOutcome::Aborted {
                reporter: PeerId(2),
                reason: "404".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_non_requester_returns_after_report() {
        let hub = LoopbackHub::new();
        let (coordinator, _tracker) = coordinator(&hub, CoordinatorSettings::default());
        let _second = hub.join();

        let outcome = coordinator
            .handle_request(Locator::from("L1"), PeerId(2), Uuid::new_v4())
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert!(coordinator.active_sessions().await.is_empty());
    }
}
