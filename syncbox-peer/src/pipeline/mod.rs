//! Fetch-and-Decode Pipeline
//!
//! Materializes a locator into the Resource Cache: fetch remote bytes,
//! decode them on the blocking pool, insert the buffer. Runs for the same
//! locator are single-flight; a caller that arrives while a fetch is in
//! progress waits for it and then reads the cache.

pub mod decode;
pub mod fetch;

pub use decode::{AudioDecoder, DecodedAudio, SymphoniaDecoder};
pub use fetch::{CommandFetcher, FetchedResource, HttpFetcher, ResourceFetcher};

use crate::cache::{CachedResource, ResourceCache};
use crate::error::{Error, Result};
use crate::lock_unpoisoned;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use syncbox_common::events::{EventBus, SyncboxEvent};
use syncbox_common::Locator;
use tracing::{debug, info};

/// Fetch, decode and cache resources
pub struct FetchPipeline {
    fetcher: Arc<dyn ResourceFetcher>,
    decoder: Arc<dyn AudioDecoder>,
    cache: Arc<ResourceCache>,
    events: EventBus,
    /// One gate per locator currently being fetched
    inflight: Mutex<HashMap<Locator, Arc<tokio::sync::Mutex<()>>>>,
}

impl FetchPipeline {
    pub fn new(
        fetcher: Arc<dyn ResourceFetcher>,
        decoder: Arc<dyn AudioDecoder>,
        cache: Arc<ResourceCache>,
        events: EventBus,
    ) -> Self {
        Self {
            fetcher,
            decoder,
            cache,
            events,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Return the cached resource for `locator`, fetching it if needed
    ///
    /// The buffer is in the cache before this returns `Ok`.
    pub async fn fetch_and_decode(&self, locator: &Locator) -> Result<Arc<CachedResource>> {
        if let Some(resource) = self.cache.get(locator).await {
            return Ok(resource);
        }

        let gate = {
            let mut inflight = lock_unpoisoned(&self.inflight);
            Arc::clone(inflight.entry(locator.clone()).or_default())
        };

        let result = {
            let _guard = gate.lock().await;

            // Another run may have finished while we waited on the gate
            match self.cache.get(locator).await {
                Some(resource) => {
                    debug!("Single-flight hit for {}", locator);
                    Ok(resource)
                }
                None => self.run(locator).await,
            }
        };

        // Last one out removes the gate
        {
            let mut inflight = lock_unpoisoned(&self.inflight);
            if Arc::strong_count(&gate) == 2 {
                inflight.remove(locator);
            }
        }

        result
    }

    async fn run(&self, locator: &Locator) -> Result<Arc<CachedResource>> {
        info!("Fetching {}", locator);
        self.events.emit_lossy(SyncboxEvent::FetchStarted {
            locator: locator.clone(),
            timestamp: Utc::now(),
        });

        let FetchedResource {
            path,
            label,
            scratch,
        } = self.fetcher.fetch(locator).await?;

        let decoder = Arc::clone(&self.decoder);
        let decoded = tokio::task::spawn_blocking(move || {
            let result = decoder.decode(&path);
            // Scratch storage goes away whether or not decoding worked
            drop(scratch);
            result
        })
        .await
        .map_err(|e| Error::Decode(format!("Decode task failed: {}", e)))??;

        let resource = Arc::new(CachedResource::new(locator.clone(), label, decoded));
        self.cache.put(Arc::clone(&resource)).await;

        info!(
            "Cached {} as '{}' ({} ms)",
            locator,
            resource.label,
            resource.audio.duration_ms()
        );
        self.events.emit_lossy(SyncboxEvent::FetchCompleted {
            locator: locator.clone(),
            label: resource.label.clone(),
            duration_ms: resource.audio.duration_ms(),
            timestamp: Utc::now(),
        });

        Ok(resource)
    }
}
