//! Event types for the Syncbox event system
//!
//! Provides the node-local event definitions and the EventBus. Events are
//! never sent to other peers; they feed logs, the SSE stream and tests.

use crate::types::{Locator, PeerId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// How a readiness barrier was released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierRelease {
    /// Every live peer reported ready
    Complete,
    /// Timeout elapsed; playback dispatched with the peers that were ready
    ProceededWithReady,
    /// Timeout elapsed; playback abandoned
    TimedOut,
    /// A peer reported a fetch/decode failure
    Aborted,
}

/// Syncbox event types
///
/// Emitted by the peer node as a request moves through its lifecycle.
/// Serialized with a `type` tag for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncboxEvent {
    /// A RequestPlayback message was received
    PlaybackRequested {
        locator: Locator,
        requester: PeerId,
        request_id: RequestId,
        timestamp: DateTime<Utc>,
    },

    /// Cache miss; the fetch backend was invoked
    FetchStarted {
        locator: Locator,
        timestamp: DateTime<Utc>,
    },

    /// Resource fetched, decoded and cached
    FetchCompleted {
        locator: Locator,
        /// Human readable label shown in the cached list
        label: String,
        /// Decoded duration in milliseconds
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Fetch or decode failed; this peer will not report ready
    FetchFailed {
        locator: Locator,
        request_id: RequestId,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// A ReportReady was counted
    PeerReady {
        locator: Locator,
        request_id: RequestId,
        reporter: PeerId,
        /// Distinct peers ready for this key after the report
        ready: usize,
        timestamp: DateTime<Utc>,
    },

    /// A ReportFailed was received
    PeerFailed {
        locator: Locator,
        request_id: RequestId,
        reporter: PeerId,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The coordinator stopped waiting on a barrier
    BarrierReleased {
        locator: Locator,
        request_id: RequestId,
        release: BarrierRelease,
        ready: usize,
        expected: usize,
        timestamp: DateTime<Utc>,
    },

    /// A local endpoint started playing
    PlaybackStarted {
        locator: Locator,
        requester: PeerId,
        timestamp: DateTime<Utc>,
    },

    /// A local endpoint stopped
    PlaybackStopped {
        requester: PeerId,
        timestamp: DateTime<Utc>,
    },

    /// A play or stop dispatch was dropped
    DispatchFailed {
        requester: PeerId,
        locator: Option<Locator>,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A peer joined the session
    PeerJoined {
        peer: PeerId,
        timestamp: DateTime<Utc>,
    },

    /// A peer left the session
    PeerLeft {
        peer: PeerId,
        timestamp: DateTime<Utc>,
    },

    /// Local volume changed (never broadcast to other peers)
    VolumeChanged {
        volume: f32,
        timestamp: DateTime<Utc>,
    },
}

impl SyncboxEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncboxEvent::PlaybackRequested { .. } => "PlaybackRequested",
            SyncboxEvent::FetchStarted { .. } => "FetchStarted",
            SyncboxEvent::FetchCompleted { .. } => "FetchCompleted",
            SyncboxEvent::FetchFailed { .. } => "FetchFailed",
            SyncboxEvent::PeerReady { .. } => "PeerReady",
            SyncboxEvent::PeerFailed { .. } => "PeerFailed",
            SyncboxEvent::BarrierReleased { .. } => "BarrierReleased",
            SyncboxEvent::PlaybackStarted { .. } => "PlaybackStarted",
            SyncboxEvent::PlaybackStopped { .. } => "PlaybackStopped",
            SyncboxEvent::DispatchFailed { .. } => "DispatchFailed",
            SyncboxEvent::PeerJoined { .. } => "PeerJoined",
            SyncboxEvent::PeerLeft { .. } => "PeerLeft",
            SyncboxEvent::VolumeChanged { .. } => "VolumeChanged",
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus for node-wide events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use syncbox_common::events::{EventBus, SyncboxEvent};
/// use syncbox_common::PeerId;
///
/// let event_bus = EventBus::new(100);
/// let mut rx = event_bus.subscribe();
///
/// event_bus.emit_lossy(SyncboxEvent::PeerJoined {
///     peer: PeerId(2),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(matches!(rx.try_recv(), Ok(SyncboxEvent::PeerJoined { .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncboxEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// * `capacity` - Number of events to buffer before lagging receivers
    ///   start dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncboxEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: SyncboxEvent,
    ) -> Result<usize, broadcast::error::SendError<SyncboxEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: SyncboxEvent) {
        let _ = self.tx.send(event);
    }

    /// Current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
