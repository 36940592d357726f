//! Endpoint Registry
//!
//! Explicit peer id → endpoint map, driven by session membership: an
//! endpoint is registered when a peer joins and dropped when it leaves.

use crate::endpoint::PeerEndpoint;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use syncbox_common::PeerId;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<PeerId, Arc<PeerEndpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint, replacing (and stopping) any previous one for
    /// the same peer
    pub async fn register(&self, endpoint: PeerEndpoint) -> Arc<PeerEndpoint> {
        let peer = endpoint.peer();
        let endpoint = Arc::new(endpoint);
        let previous = self
            .endpoints
            .write()
            .await
            .insert(peer, Arc::clone(&endpoint));
        if let Some(previous) = previous {
            previous.stop();
            debug!("Replaced endpoint for {}", peer);
        } else {
            info!("Registered endpoint for {}", peer);
        }
        endpoint
    }

    /// Register `endpoint` unless its peer already has one
    ///
    /// Hands the endpoint back when it was not registered, so the caller
    /// decides where its device gets torn down.
    pub async fn register_if_absent(&self, endpoint: PeerEndpoint) -> Option<PeerEndpoint> {
        let peer = endpoint.peer();
        let mut endpoints = self.endpoints.write().await;
        if endpoints.contains_key(&peer) {
            return Some(endpoint);
        }
        endpoints.insert(peer, Arc::new(endpoint));
        info!("Registered endpoint for {}", peer);
        None
    }

    pub async fn contains(&self, peer: PeerId) -> bool {
        self.endpoints.read().await.contains_key(&peer)
    }

    /// Remove the endpoint for `peer`, stopping its playback
    pub async fn unregister(&self, peer: PeerId) -> Option<Arc<PeerEndpoint>> {
        let removed = self.endpoints.write().await.remove(&peer);
        if let Some(endpoint) = &removed {
            endpoint.stop();
            info!("Unregistered endpoint for {}", peer);
        }
        removed
    }

    /// The endpoint owned by `peer`
    pub async fn resolve(&self, peer: PeerId) -> Result<Arc<PeerEndpoint>> {
        self.endpoints
            .read()
            .await
            .get(&peer)
            .cloned()
            .ok_or(Error::EndpointNotFound(peer))
    }

    /// All endpoints, ordered by peer id
    pub async fn all(&self) -> Vec<Arc<PeerEndpoint>> {
        let mut endpoints: Vec<_> = self.endpoints.read().await.values().cloned().collect();
        endpoints.sort_by_key(|endpoint| endpoint.peer());
        endpoints
    }

    pub async fn len(&self) -> usize {
        self.endpoints.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.endpoints.read().await.is_empty()
    }
}
