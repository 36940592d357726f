//! Session layer
//!
//! Peer membership plus best-effort broadcast. Every broadcast reaches
//! every current member, the sender included. Inbound traffic (membership
//! changes and messages) arrives on a [`SessionInbox`].

pub mod loopback;
pub mod relay;

pub use loopback::{LoopbackHub, LoopbackSession};
pub use relay::{RelayFrame, RelayServer, RelaySession};

use crate::error::Result;
use syncbox_common::{PeerId, PeerMessage};
use tokio::sync::mpsc;

/// Inbound session traffic
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    Message { from: PeerId, message: PeerMessage },
}

/// Receiving half handed out when joining a session
pub type SessionInbox = mpsc::UnboundedReceiver<SessionEvent>;

/// Membership and broadcast
pub trait SessionLayer: Send + Sync {
    /// Id the session assigned to this process
    fn local_peer_id(&self) -> PeerId;

    /// Current member count, this peer included
    fn peer_count(&self) -> usize;

    /// Current members, ascending
    fn members(&self) -> Vec<PeerId>;

    /// Send `message` to every member, this peer included
    fn broadcast(&self, message: PeerMessage) -> Result<()>;
}
