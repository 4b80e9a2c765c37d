//! Descriptor cache: TTL-bounded, with single-flight resolution per target.

use crate::capability::TargetDescriptor;
use crate::error::Result;
use crate::resolve::{Resolver, TargetKey};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

type Slot = Arc<OnceCell<Arc<TargetDescriptor>>>;

#[derive(Clone)]
pub struct DescriptorCache {
    resolver: Resolver,
    ttl: Duration,
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    resolutions: Arc<AtomicU64>,
}

impl DescriptorCache {
    #[must_use]
    pub fn new(resolver: Resolver, ttl: Duration) -> Self {
        Self {
            resolver,
            ttl,
            slots: Arc::new(Mutex::new(HashMap::new())),
            resolutions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cached descriptor for `key`, resolving at most once per TTL window.
    ///
    /// Concurrent first callers share one in-flight resolution. A failed resolution leaves
    /// the slot empty so the next caller retries.
    ///
    /// # Errors
    ///
    /// Propagates the resolution error.
    pub async fn get(&self, key: &TargetKey) -> Result<Arc<TargetDescriptor>> {
        let cache_key = key.cache_key();
        let slot = self.slot(&cache_key, false);
        self.fill(&cache_key, slot, key).await
    }

    /// Re-resolve `key`, replacing any cached descriptor.
    ///
    /// # Errors
    ///
    /// Propagates the resolution error.
    pub async fn refresh(&self, key: &TargetKey) -> Result<Arc<TargetDescriptor>> {
        let cache_key = key.cache_key();
        let slot = self.slot(&cache_key, true);
        self.fill(&cache_key, slot, key).await
    }

    /// Number of upstream resolutions started since creation.
    #[must_use]
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    /// Drop descriptors older than the TTL at `now` and slots left empty by failed
    /// resolutions. Returns the number of slots removed.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, cell| match cell.get() {
            Some(d) => now.saturating_duration_since(d.resolved_at) < self.ttl,
            // Someone besides the map still holds an empty slot: resolution in flight.
            None => Arc::strong_count(cell) > 1,
        });
        let evicted = before - slots.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = slots.len(), "descriptor cache swept");
        }
        evicted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, cache_key: &str, force_new: bool) -> Slot {
        let mut slots = self.slots.lock();
        let expired = slots.get(cache_key).is_some_and(|cell| {
            cell.get()
                .is_some_and(|d| d.resolved_at.elapsed() >= self.ttl)
        });
        if force_new || expired {
            slots.remove(cache_key);
        }
        Arc::clone(
            slots
                .entry(cache_key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        )
    }

    async fn fill(&self, cache_key: &str, slot: Slot, key: &TargetKey) -> Result<Arc<TargetDescriptor>> {
        let filled = slot
            .get_or_try_init(|| async {
                self.resolutions.fetch_add(1, Ordering::Relaxed);
                self.resolver.resolve(key).await.map(Arc::new)
            })
            .await;
        match filled {
            Ok(descriptor) => Ok(Arc::clone(descriptor)),
            Err(e) => {
                let mut slots = self.slots.lock();
                // Only the map and this caller hold it: nobody is waiting to retry on it.
                let abandoned = slots.get(cache_key).is_some_and(|cell| {
                    Arc::ptr_eq(cell, &slot) && cell.get().is_none() && Arc::strong_count(cell) == 2
                });
                if abandoned {
                    slots.remove(cache_key);
                }
                Err(e)
            }
        }
    }
}
