//! Peer Node
//!
//! Owns every protocol component of one process and pumps inbound
//! session traffic into them. Each RequestPlayback runs in its own task
//! so the inbox keeps draining while fetches and barriers are pending.
//!
//! The node is also the control surface handle: request, stop, list and
//! volume operations used by the HTTP API and the binary.

use crate::cache::ResourceCache;
use crate::control::LocatorValidator;
use crate::coordinator::{CoordinatorSettings, PlaybackCoordinator, PlaybackSession};
use crate::endpoint::{clamp_volume, DeviceFactory, EndpointRegistry, EndpointStatus, PeerEndpoint};
use crate::error::{Error, Result};
use crate::lock_unpoisoned;
use crate::pipeline::{AudioDecoder, FetchPipeline, ResourceFetcher};
use crate::readiness::ReadinessTracker;
use crate::session::{SessionEvent, SessionInbox, SessionLayer};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use syncbox_common::events::{EventBus, SyncboxEvent};
use syncbox_common::{Locator, PeerId, PeerMessage, RequestId};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pluggable backends of a node
#[derive(Clone)]
pub struct NodeServices {
    pub fetcher: Arc<dyn ResourceFetcher>,
    pub decoder: Arc<dyn AudioDecoder>,
    pub devices: DeviceFactory,
}

/// Tunables of a node
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub coordinator: CoordinatorSettings,
    /// Initial volume of this peer's own endpoint
    pub local_volume: f32,
    /// Initial volume of other peers' endpoints
    pub remote_volume: f32,
    pub validator: LocatorValidator,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            coordinator: CoordinatorSettings::default(),
            local_volume: 0.1,
            remote_volume: 0.2,
            validator: LocatorValidator::default(),
        }
    }
}

pub struct PeerNode {
    session: Arc<dyn SessionLayer>,
    cache: Arc<ResourceCache>,
    tracker: Arc<ReadinessTracker>,
    coordinator: Arc<PlaybackCoordinator>,
    registry: Arc<EndpointRegistry>,
    devices: DeviceFactory,
    events: EventBus,
    settings: NodeSettings,
    /// Volume set through the control surface; overrides the defaults
    volume_override: Mutex<Option<f32>>,
}

impl PeerNode {
    /// Build a node and register endpoints for the current members
    pub async fn new(
        session: Arc<dyn SessionLayer>,
        services: NodeServices,
        settings: NodeSettings,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        let cache = Arc::new(ResourceCache::new());
        let tracker = Arc::new(ReadinessTracker::new());
        let pipeline = Arc::new(FetchPipeline::new(
            services.fetcher,
            services.decoder,
            Arc::clone(&cache),
            events.clone(),
        ));
        let coordinator = Arc::new(PlaybackCoordinator::new(
            Arc::clone(&session),
            pipeline,
            Arc::clone(&tracker),
            events.clone(),
            settings.coordinator.clone(),
        ));

        let node = Arc::new(Self {
            session,
            cache,
            tracker,
            coordinator,
            registry: Arc::new(EndpointRegistry::new()),
            devices: services.devices,
            events,
            settings,
            volume_override: Mutex::new(None),
        });

        for peer in node.session.members() {
            node.ensure_endpoint(peer).await?;
        }

        info!(
            "Peer node {} ready ({} members)",
            node.local_peer_id(),
            node.session.peer_count()
        );
        Ok(node)
    }

    /// Pump `inbox` on a background task until the session closes
    pub fn spawn(self: &Arc<Self>, inbox: SessionInbox) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move { node.run(inbox).await })
    }

    pub async fn run(self: Arc<Self>, mut inbox: SessionInbox) {
        while let Some(event) = inbox.recv().await {
            self.handle_event(event).await;
        }
        warn!("Session inbox closed, peer node {} stopping", self.local_peer_id());
    }

    pub async fn handle_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::PeerJoined(peer) => {
                info!("{} joined the session", peer);
                if let Err(e) = self.ensure_endpoint(peer).await {
                    error!("Failed to create endpoint for {}: {}", peer, e);
                }
                self.events.emit_lossy(SyncboxEvent::PeerJoined {
                    peer,
                    timestamp: Utc::now(),
                });
                self.tracker.wake_all();
            }
            SessionEvent::PeerLeft(peer) => {
                info!("{} left the session", peer);
                if let Some(endpoint) = self.registry.unregister(peer).await {
                    drop_blocking(endpoint);
                }
                self.events.emit_lossy(SyncboxEvent::PeerLeft {
                    peer,
                    timestamp: Utc::now(),
                });
                self.tracker.wake_all();
            }
            SessionEvent::Message { from, message } => self.handle_message(from, message).await,
        }
    }

    async fn handle_message(self: &Arc<Self>, from: PeerId, message: PeerMessage) {
        debug!("{} from {}", message.kind(), from);

        match message {
            PeerMessage::RequestPlayback {
                locator,
                requester,
                request_id,
            } => {
                // Peers may send anything; apply the same checks as a local request
                if let Err(e) = self.settings.validator.validate(locator.as_str()) {
                    warn!(
                        "Rejected request {} from {} for {}: {}",
                        request_id, from, locator, e
                    );
                    self.coordinator
                        .report_local_failure(&locator, request_id, &e);
                    return;
                }

                let coordinator = Arc::clone(&self.coordinator);
                tokio::spawn(async move {
                    if let Err(e) = coordinator
                        .handle_request(locator.clone(), requester, request_id)
                        .await
                    {
                        error!("Request {} for {} ended: {}", request_id, locator, e);
                    }
                });
            }
            PeerMessage::ReportReady {
                reporter,
                locator,
                request_id,
            } => {
                self.coordinator.record_ready(reporter, &locator, request_id);
            }
            PeerMessage::ReportFailed {
                reporter,
                locator,
                request_id,
                reason,
            } => {
                self.coordinator
                    .record_failed(reporter, &locator, request_id, &reason);
            }
            PeerMessage::SyncPlayback {
                locator, requester, ..
            } => {
                if let Err(e) = self.dispatch_play(requester, &locator).await {
                    error!("Dropped play of {} for {}: {}", locator, requester, e);
                }
            }
            PeerMessage::StopPlayback { requester } => {
                if let Err(e) = self.dispatch_stop(requester).await {
                    warn!("Dropped stop for {}: {}", requester, e);
                }
            }
        }
    }

    /// Start the requester's endpoint from the local cache
    pub async fn dispatch_play(&self, requester: PeerId, locator: &Locator) -> Result<()> {
        let result = async {
            let endpoint = self.registry.resolve(requester).await?;
            let resource = self
                .cache
                .get(locator)
                .await
                .ok_or_else(|| Error::NotCached(locator.to_string()))?;
            endpoint.play(&resource)
        }
        .await;

        match &result {
            Ok(()) => self.events.emit_lossy(SyncboxEvent::PlaybackStarted {
                locator: locator.clone(),
                requester,
                timestamp: Utc::now(),
            }),
            Err(e) => self.events.emit_lossy(SyncboxEvent::DispatchFailed {
                requester,
                locator: Some(locator.clone()),
                reason: e.to_string(),
                timestamp: Utc::now(),
            }),
        }
        result
    }

    /// Stop the requester's endpoint; Ok(false) if it was idle
    pub async fn dispatch_stop(&self, requester: PeerId) -> Result<bool> {
        let endpoint = match self.registry.resolve(requester).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.events.emit_lossy(SyncboxEvent::DispatchFailed {
                    requester,
                    locator: None,
                    reason: e.to_string(),
                    timestamp: Utc::now(),
                });
                return Err(e);
            }
        };

        let stopped = endpoint.stop();
        if stopped {
            info!("Stopped playback for {}", requester);
            self.events.emit_lossy(SyncboxEvent::PlaybackStopped {
                requester,
                timestamp: Utc::now(),
            });
        } else {
            debug!("Stop for {} ignored, nothing playing", requester);
        }
        Ok(stopped)
    }

    /// Ask every peer to fetch `locator` and play it on this peer's endpoint
    pub fn request_playback(&self, locator: &str) -> Result<RequestId> {
        let locator = self.settings.validator.validate(locator)?;
        let request_id = Uuid::new_v4();
        info!("Requesting playback of {} (request {})", locator, request_id);
        self.session.broadcast(PeerMessage::RequestPlayback {
            locator,
            requester: self.local_peer_id(),
            request_id,
        })?;
        Ok(request_id)
    }

    /// Stop this peer's endpoint on every node
    pub fn stop_playback(&self) -> Result<()> {
        self.session.broadcast(PeerMessage::StopPlayback {
            requester: self.local_peer_id(),
        })
    }

    /// Cached resources as (label, locator), oldest first
    pub async fn list_cached(&self) -> Vec<(String, Locator)> {
        self.cache.list().await
    }

    /// Set the volume of every endpoint on this node; returns the clamped value
    ///
    /// Local only: never broadcast.
    pub async fn set_volume(&self, volume: f32) -> f32 {
        let volume = clamp_volume(volume);
        *lock_unpoisoned(&self.volume_override) = Some(volume);
        for endpoint in self.registry.all().await {
            endpoint.set_volume(volume);
        }
        info!("Volume set to {:.2}", volume);
        self.events.emit_lossy(SyncboxEvent::VolumeChanged {
            volume,
            timestamp: Utc::now(),
        });
        volume
    }

    /// Volume of this peer's own endpoint
    pub async fn volume(&self) -> f32 {
        match self.registry.resolve(self.local_peer_id()).await {
            Ok(endpoint) => endpoint.volume(),
            Err(_) => self.initial_volume(self.local_peer_id()),
        }
    }

    pub async fn active_sessions(&self) -> Vec<PlaybackSession> {
        self.coordinator.active_sessions().await
    }

    pub async fn endpoints(&self) -> Vec<EndpointStatus> {
        self.registry
            .all()
            .await
            .iter()
            .map(|endpoint| endpoint.status())
            .collect()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.session.local_peer_id()
    }

    pub fn peer_count(&self) -> usize {
        self.session.peer_count()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    pub fn tracker(&self) -> &Arc<ReadinessTracker> {
        &self.tracker
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<PlaybackCoordinator> {
        &self.coordinator
    }

    fn initial_volume(&self, peer: PeerId) -> f32 {
        if let Some(volume) = *lock_unpoisoned(&self.volume_override) {
            return volume;
        }
        if peer == self.local_peer_id() {
            self.settings.local_volume
        } else {
            self.settings.remote_volume
        }
    }

    async fn ensure_endpoint(&self, peer: PeerId) -> Result<bool> {
        if self.registry.contains(peer).await {
            return Ok(false);
        }

        // Opening an output device blocks until the stream is up
        let volume = self.initial_volume(peer);
        let devices = Arc::clone(&self.devices);
        let endpoint = tokio::task::spawn_blocking(move || {
            devices(peer).map(|device| PeerEndpoint::new(peer, device, volume))
        })
        .await
        .map_err(|e| Error::AudioOutput(format!("Device task for {} failed: {}", peer, e)))??;

        match self.registry.register_if_absent(endpoint).await {
            None => Ok(true),
            Some(duplicate) => {
                drop_blocking(duplicate);
                Ok(false)
            }
        }
    }
}

/// Drop `value` on the blocking pool; device teardown joins threads
fn drop_blocking<T: Send + 'static>(value: T) {
    tokio::task::spawn_blocking(move || drop(value));
}
