//! Peer Endpoint
//!
//! Every peer in the session has an endpoint on every node. An endpoint
//! owns the playback device that renders that peer's requests locally.

pub mod device;
pub mod output;
pub mod registry;

pub use device::{clamp_volume, DeviceFactory, NullDevice, PlaybackDevice};
pub use output::CpalDevice;
pub use registry::EndpointRegistry;

use crate::cache::CachedResource;
use crate::error::Result;
use crate::lock_unpoisoned;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use syncbox_common::{Locator, PeerId};
use tracing::{debug, info};

/// Snapshot of an endpoint for the HTTP API
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub peer: PeerId,
    pub playing: bool,
    pub now_playing: Option<Locator>,
    pub volume: f32,
}

/// One peer's playback endpoint
pub struct PeerEndpoint {
    peer: PeerId,
    device: Box<dyn PlaybackDevice>,
    now_playing: Mutex<Option<Locator>>,
}

impl PeerEndpoint {
    pub fn new(peer: PeerId, device: Box<dyn PlaybackDevice>, volume: f32) -> Self {
        device.set_volume(volume);
        Self {
            peer,
            device,
            now_playing: Mutex::new(None),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn owns_peer(&self, peer: PeerId) -> bool {
        self.peer == peer
    }

    /// Play `resource` from the start, replacing anything already playing
    pub fn play(&self, resource: &CachedResource) -> Result<()> {
        let mut now_playing = lock_unpoisoned(&self.now_playing);
        self.device.stop();
        self.device.start(Arc::clone(&resource.audio))?;
        *now_playing = Some(resource.locator.clone());
        info!("Endpoint {} playing '{}'", self.peer, resource.label);
        Ok(())
    }

    /// Stop playback
    ///
    /// Returns false (and does nothing) when the endpoint was idle.
    pub fn stop(&self) -> bool {
        let mut now_playing = lock_unpoisoned(&self.now_playing);
        let was_playing = self.device.is_playing();
        if was_playing {
            self.device.stop();
            debug!("Endpoint {} stopped", self.peer);
        }
        *now_playing = None;
        was_playing
    }

    pub fn set_volume(&self, volume: f32) {
        self.device.set_volume(clamp_volume(volume));
    }

    pub fn volume(&self) -> f32 {
        self.device.volume()
    }

    pub fn is_playing(&self) -> bool {
        self.device.is_playing()
    }

    /// Locator currently playing, if any
    pub fn now_playing(&self) -> Option<Locator> {
        let now_playing = lock_unpoisoned(&self.now_playing);
        if self.device.is_playing() {
            now_playing.clone()
        } else {
            None
        }
    }

    pub fn status(&self) -> EndpointStatus {
        EndpointStatus {
            peer: self.peer,
            playing: self.is_playing(),
            now_playing: self.now_playing(),
            volume: self.volume(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::DecodedAudio;

    fn resource(locator: &str) -> CachedResource {
        // One minute of silence at 1 kHz
        CachedResource::new(
            Locator::from(locator),
            locator,
            DecodedAudio::new(vec![0.0; 120_000], 1000, 2),
        )
    }

    fn endpoint(peer: u32) -> PeerEndpoint {
        PeerEndpoint::new(PeerId(peer), Box::new(NullDevice::new()), 0.2)
    }

    #[test]
    fn test_owns_peer() {
        let endpoint = endpoint(4);
        assert!(endpoint.owns_peer(PeerId(4)));
        assert!(!endpoint.owns_peer(PeerId(5)));
    }

    #[test]
    fn test_play_then_stop() {
        let endpoint = endpoint(1);
        assert!(!endpoint.stop());

        endpoint.play(&resource("L1")).unwrap();
        assert!(endpoint.is_playing());
        assert_eq!(endpoint.now_playing(), Some(Locator::from("L1")));

        assert!(endpoint.stop());
        assert!(!endpoint.is_playing());
        assert_eq!(endpoint.now_playing(), None);
    }

    #[test]
    fn test_play_replaces_current() {
        let endpoint = endpoint(1);
        endpoint.play(&resource("L1")).unwrap();
        endpoint.play(&resource("L2")).unwrap();
        assert_eq!(endpoint.now_playing(), Some(Locator::from("L2")));
    }

    #[test]
    fn test_volume_clamped() {
        let endpoint = endpoint(1);
        assert!((endpoint.volume() - 0.2).abs() < f32::EPSILON);
        endpoint.set_volume(3.0);
        assert_eq!(endpoint.volume(), 1.0);
        assert_eq!(endpoint.status().volume, 1.0);
    }
}
