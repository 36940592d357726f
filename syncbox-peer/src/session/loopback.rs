//! In-process session hub
//!
//! Every node joined to the same hub sees the others as session members.
//! Used by tests and single-process demos.

use crate::error::{Error, Result};
use crate::lock_unpoisoned;
use crate::session::{SessionEvent, SessionInbox, SessionLayer};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use syncbox_common::{PeerId, PeerMessage};
use tokio::sync::mpsc;
use tracing::debug;

struct HubInner {
    next_id: u32,
    members: BTreeMap<PeerId, mpsc::UnboundedSender<SessionEvent>>,
}

impl HubInner {
    fn announce(&self, event: SessionEvent, except: PeerId) {
        for (peer, tx) in &self.members {
            if *peer != except {
                let _ = tx.send(event.clone());
            }
        }
    }
}

/// Shared in-memory session
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HubInner {
                next_id: 1,
                members: BTreeMap::new(),
            })),
        }
    }

    /// Join as a new member; ids are assigned from 1 upward
    pub fn join(&self) -> (Arc<LoopbackSession>, SessionInbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = lock_unpoisoned(&self.inner);

        let peer = PeerId(inner.next_id);
        inner.next_id += 1;
        inner.announce(SessionEvent::PeerJoined(peer), peer);
        inner.members.insert(peer, tx);
        debug!("{} joined loopback hub ({} members)", peer, inner.members.len());

        let session = Arc::new(LoopbackSession {
            hub: self.clone(),
            peer,
        });
        (session, rx)
    }

    /// Remove `peer`; remaining members see `PeerLeft`
    pub fn leave(&self, peer: PeerId) {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.members.remove(&peer).is_some() {
            inner.announce(SessionEvent::PeerLeft(peer), peer);
            debug!("{} left loopback hub", peer);
        }
    }

    pub fn member_count(&self) -> usize {
        lock_unpoisoned(&self.inner).members.len()
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's view of a [`LoopbackHub`]
pub struct LoopbackSession {
    hub: LoopbackHub,
    peer: PeerId,
}

impl LoopbackSession {
    pub fn hub(&self) -> &LoopbackHub {
        &self.hub
    }
}

impl SessionLayer for LoopbackSession {
    fn local_peer_id(&self) -> PeerId {
        self.peer
    }

    fn peer_count(&self) -> usize {
        self.hub.member_count()
    }

    fn members(&self) -> Vec<PeerId> {
        lock_unpoisoned(&self.hub.inner).members.keys().copied().collect()
    }

    fn broadcast(&self, message: PeerMessage) -> Result<()> {
        let inner = lock_unpoisoned(&self.hub.inner);
        if !inner.members.contains_key(&self.peer) {
            return Err(Error::Session(format!("{} is not a session member", self.peer)));
        }
        for tx in inner.members.values() {
            let _ = tx.send(SessionEvent::Message {
                from: self.peer,
                message: message.clone(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_join_assigns_ids_and_announces() {
        let hub = LoopbackHub::new();
        let (first, mut first_rx) = hub.join();
        let (second, _second_rx) = hub.join();

        assert_eq!(first.local_peer_id(), PeerId(1));
        assert_eq!(second.local_peer_id(), PeerId(2));
        assert_eq!(first.peer_count(), 2);
        assert_eq!(first.members(), vec![PeerId(1), PeerId(2)]);
        assert_eq!(first_rx.recv().await, Some(SessionEvent::PeerJoined(PeerId(2))));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_sender() {
        let hub = LoopbackHub::new();
        let (first, mut first_rx) = hub.join();
        let (_second, mut second_rx) = hub.join();
        // Drain the join notice
        first_rx.recv().await;

        let message = PeerMessage::StopPlayback {
            requester: PeerId(1),
        };
        first.broadcast(message.clone()).unwrap();

        let expected = SessionEvent::Message {
            from: PeerId(1),
            message,
        };
        assert_eq!(first_rx.recv().await, Some(expected.clone()));
        assert_eq!(second_rx.recv().await, Some(expected));
    }

    #[tokio::test]
    async fn test_leave() {
        let hub = LoopbackHub::new();
        let (first, mut first_rx) = hub.join();
        let (second, _second_rx) = hub.join();
        first_rx.recv().await;

        hub.leave(second.local_peer_id());
        assert_eq!(first.peer_count(), 1);
        assert_eq!(first_rx.recv().await, Some(SessionEvent::PeerLeft(PeerId(2))));

        let result = second.broadcast(PeerMessage::StopPlayback {
            requester: PeerId(2),
        });
        assert!(matches!(result, Err(Error::Session(_))));
    }
}
