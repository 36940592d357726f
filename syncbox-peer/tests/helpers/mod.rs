//! Test helpers for syncbox-peer integration tests
//!
//! - FakeFetcher: counts fetches per locator, can fail or stall a locator,
//!   and remembers every scratch directory it handed out
//! - FakeDecoder: returns a fixed silent buffer (or fails)
//! - Cluster: N peer nodes joined to one loopback hub, each with its own
//!   FakeFetcher and counting device factory
//! - eventually / drain_events: polling and event collection

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use syncbox_common::events::{EventBus, SyncboxEvent};
use syncbox_common::{Locator, PeerId};
use syncbox_peer::endpoint::{DeviceFactory, NullDevice, PlaybackDevice};
use syncbox_peer::pipeline::{AudioDecoder, DecodedAudio, FetchedResource, ResourceFetcher};
use syncbox_peer::session::{LoopbackHub, SessionLayer};
use syncbox_peer::{Error, NodeServices, NodeSettings, PeerNode, Result};
use tokio::sync::broadcast;

/// Sample rate of the fake buffers: one minute of audio per resource
pub const FAKE_RATE: u32 = 1000;
pub const FAKE_FRAMES: usize = 60 * FAKE_RATE as usize;

pub fn fake_audio() -> DecodedAudio {
    DecodedAudio::new(vec![0.0; FAKE_FRAMES * 2], FAKE_RATE, 2)
}

#[derive(Default)]
pub struct FakeFetcher {
    calls: Mutex<HashMap<Locator, usize>>,
    failing: Mutex<HashSet<Locator>>,
    delays: Mutex<HashMap<Locator, Duration>>,
    scratch_paths: Mutex<Vec<PathBuf>>,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every fetch of `locator` fail
    pub fn fail(&self, locator: &str) {
        self.failing.lock().unwrap().insert(Locator::from(locator));
    }

    /// Make every fetch of `locator` take `delay`
    pub fn delay(&self, locator: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(Locator::from(locator), delay);
    }

    pub fn calls(&self, locator: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&Locator::from(locator))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn scratch_paths(&self) -> Vec<PathBuf> {
        self.scratch_paths.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceFetcher for FakeFetcher {
    async fn fetch(&self, locator: &Locator) -> Result<FetchedResource> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(locator.clone())
            .or_default() += 1;

        let delay = self.delays.lock().unwrap().get(locator).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().unwrap().contains(locator) {
            return Err(Error::Fetch(format!("{} unreachable", locator)));
        }

        let scratch = tempfile::tempdir()?;
        let path = scratch.path().join("resource.bin");
        std::fs::write(&path, locator.as_str())?;
        self.scratch_paths
            .lock()
            .unwrap()
            .push(scratch.path().to_path_buf());

        Ok(FetchedResource {
            path,
            label: format!("label of {}", locator),
            scratch: Some(scratch),
        })
    }
}

pub struct FakeDecoder {
    fail: bool,
    calls: AtomicUsize,
}

impl FakeDecoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AudioDecoder for FakeDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::Decode(format!("{} is not audio", path.display())));
        }
        Ok(fake_audio())
    }
}

/// NullDevice that counts how often it was started
pub struct CountingDevice {
    inner: NullDevice,
    starts: Arc<AtomicUsize>,
}

impl PlaybackDevice for CountingDevice {
    fn start(&self, audio: Arc<DecodedAudio>) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.inner.start(audio)
    }

    fn stop(&self) {
        self.inner.stop()
    }

    fn is_playing(&self) -> bool {
        self.inner.is_playing()
    }

    fn set_volume(&self, volume: f32) {
        self.inner.set_volume(volume)
    }

    fn volume(&self) -> f32 {
        self.inner.volume()
    }
}

/// Device factory whose devices share one start counter
pub fn counting_devices(starts: Arc<AtomicUsize>) -> DeviceFactory {
    Arc::new(move |_peer: PeerId| -> Result<Box<dyn PlaybackDevice>> {
        Ok(Box::new(CountingDevice {
            inner: NullDevice::new(),
            starts: Arc::clone(&starts),
        }))
    })
}

/// One node of a test cluster
pub struct TestNode {
    pub node: Arc<PeerNode>,
    pub fetcher: Arc<FakeFetcher>,
    pub starts: Arc<AtomicUsize>,
    pub events: broadcast::Receiver<SyncboxEvent>,
}

impl TestNode {
    pub fn id(&self) -> PeerId {
        self.node.local_peer_id()
    }

    /// Device starts across every endpoint on this node
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Events emitted on this node since the last drain
    pub fn drain_events(&mut self) -> Vec<SyncboxEvent> {
        drain_events(&mut self.events)
    }

    /// Receive events until one of `event_type` arrives (3 s limit)
    ///
    /// Returns everything received, the matching event last; the caller
    /// checks that it is there.
    pub async fn events_until(&mut self, event_type: &str) -> Vec<SyncboxEvent> {
        let mut events = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            let done = event.event_type() == event_type;
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    /// True if the endpoint for `owner` is playing `locator` on this node
    pub async fn is_playing(&self, owner: u32, locator: &str) -> bool {
        match self.node.registry().resolve(PeerId(owner)).await {
            Ok(endpoint) => endpoint.now_playing() == Some(Locator::from(locator)),
            Err(_) => false,
        }
    }
}

/// Peer nodes sharing one loopback hub
pub struct Cluster {
    pub hub: LoopbackHub,
    pub nodes: Vec<TestNode>,
}

impl Cluster {
    pub async fn new(size: usize) -> Self {
        Self::with_settings(size, NodeSettings::default()).await
    }

    pub async fn with_settings(size: usize, settings: NodeSettings) -> Self {
        let hub = LoopbackHub::new();

        // Everyone joins before any node starts, so each node registers
        // every endpoint up front
        let joined: Vec<_> = (0..size).map(|_| hub.join()).collect();

        let mut nodes = Vec::with_capacity(size);
        for (session, inbox) in joined {
            let fetcher = FakeFetcher::new();
            let starts = Arc::new(AtomicUsize::new(0));
            let services = NodeServices {
                fetcher: fetcher.clone(),
                decoder: FakeDecoder::new(),
                devices: counting_devices(Arc::clone(&starts)),
            };
            let events = EventBus::new(1000);
            let rx = events.subscribe();
            let session: Arc<dyn SessionLayer> = session;

            let node = PeerNode::new(session, services, settings.clone(), events)
                .await
                .expect("node should start");
            node.spawn(inbox);

            nodes.push(TestNode {
                node,
                fetcher,
                starts,
                events: rx,
            });
        }

        Self { hub, nodes }
    }

    /// Node with peer id `peer` (ids start at 1)
    pub fn node(&self, peer: u32) -> &TestNode {
        &self.nodes[peer as usize - 1]
    }

    pub fn node_mut(&mut self, peer: u32) -> &mut TestNode {
        &mut self.nodes[peer as usize - 1]
    }

    /// True once every node plays `locator` on `owner`'s endpoint
    pub async fn all_playing(&self, owner: u32, locator: &str) -> bool {
        for node in &self.nodes {
            if !node.is_playing(owner, locator).await {
                return false;
            }
        }
        true
    }
}

/// Poll `check` every 10 ms for up to 3 seconds
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn drain_events(rx: &mut broadcast::Receiver<SyncboxEvent>) -> Vec<SyncboxEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn count_events(events: &[SyncboxEvent], event_type: &str) -> usize {
    events
        .iter()
        .filter(|event| event.event_type() == event_type)
        .count()
}
