//! Peer-to-peer protocol messages
//!
//! Every message is broadcast to all session members, the sender included.
//! No ordering is assumed between independent broadcasts: the readiness
//! barrier gates on a count of distinct reporters, never on arrival order.

use crate::types::{Locator, PeerId, RequestId};
use serde::{Deserialize, Serialize};

/// Messages exchanged between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    /// Start the download/readiness/playback cycle for `locator`
    ///
    /// Every receiving peer makes sure the resource is in its cache and
    /// then reports ready. The requester's node holds the barrier.
    RequestPlayback {
        locator: Locator,
        requester: PeerId,
        request_id: RequestId,
    },

    /// The reporter holds the decoded resource in memory
    ReportReady {
        reporter: PeerId,
        locator: Locator,
        request_id: RequestId,
    },

    /// The reporter failed to fetch or decode the resource
    ///
    /// Lets the requester release its barrier instead of stalling.
    ReportFailed {
        reporter: PeerId,
        locator: Locator,
        request_id: RequestId,
        reason: String,
    },

    /// Every peer reported ready: start the requester's endpoint
    SyncPlayback {
        locator: Locator,
        requester: PeerId,
        request_id: RequestId,
    },

    /// Stop the requester's endpoint (no barrier)
    StopPlayback { requester: PeerId },
}

impl PeerMessage {
    /// Message name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::RequestPlayback { .. } => "RequestPlayback",
            PeerMessage::ReportReady { .. } => "ReportReady",
            PeerMessage::ReportFailed { .. } => "ReportFailed",
            PeerMessage::SyncPlayback { .. } => "SyncPlayback",
            PeerMessage::StopPlayback { .. } => "StopPlayback",
        }
    }

    /// Locator the message refers to, if any
    pub fn locator(&self) -> Option<&Locator> {
        match self {
            PeerMessage::RequestPlayback { locator, .. }
            | PeerMessage::ReportReady { locator, .. }
            | PeerMessage::ReportFailed { locator, .. }
            | PeerMessage::SyncPlayback { locator, .. } => Some(locator),
            PeerMessage::StopPlayback { .. } => None,
        }
    }

    /// Request the message belongs to, if any
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            PeerMessage::RequestPlayback { request_id, .. }
            | PeerMessage::ReportReady { request_id, .. }
            | PeerMessage::ReportFailed { request_id, .. }
            | PeerMessage::SyncPlayback { request_id, .. } => Some(*request_id),
            PeerMessage::StopPlayback { .. } => None,
        }
    }
}
