//! Resource Cache
//!
//! Process-wide, memory-only map from locator to decoded audio. Entries
//! are never evicted and never replaced with different content: a locator
//! is fetched at most once per process and lives until exit.

use crate::pipeline::DecodedAudio;
use std::collections::HashMap;
use std::sync::Arc;
use syncbox_common::Locator;
use tokio::sync::RwLock;
use tracing::debug;

/// A decoded resource held in memory
#[derive(Debug)]
pub struct CachedResource {
    pub locator: Locator,
    /// Human readable label for the cached list
    pub label: String,
    pub audio: Arc<DecodedAudio>,
}

impl CachedResource {
    pub fn new(locator: Locator, label: impl Into<String>, audio: DecodedAudio) -> Self {
        Self {
            locator,
            label: label.into(),
            audio: Arc::new(audio),
        }
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<Locator, Arc<CachedResource>>,
    /// Insertion order for listing
    order: Vec<Locator>,
}

/// Append-only locator → decoded audio map
#[derive(Default)]
pub struct ResourceCache {
    inner: RwLock<CacheInner>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a locator
    pub async fn get(&self, locator: &Locator) -> Option<Arc<CachedResource>> {
        self.inner.read().await.entries.get(locator).cloned()
    }

    pub async fn contains(&self, locator: &Locator) -> bool {
        self.inner.read().await.entries.contains_key(locator)
    }

    /// Insert a resource
    ///
    /// Idempotent: a raced second write replaces the buffer (content for
    /// a locator is assumed deterministic) without duplicating the
    /// listing entry.
    pub async fn put(&self, resource: Arc<CachedResource>) {
        let mut inner = self.inner.write().await;
        let locator = resource.locator.clone();
        if inner.entries.insert(locator.clone(), resource).is_none() {
            debug!("Cached {} ({} entries)", locator, inner.order.len() + 1);
            inner.order.push(locator);
        } else {
            debug!("Replaced cached entry for {}", locator);
        }
    }

    /// Cached entries as (label, locator) pairs in insertion order
    pub async fn list(&self) -> Vec<(String, Locator)> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|locator| inner.entries.get(locator))
            .map(|entry| (entry.label.clone(), entry.locator.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }
}
