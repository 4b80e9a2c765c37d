//! Per-target sessions: descriptor, policy, poll registration and a private store.
//!
//! Sessions are keyed by the request binding's fingerprint, created lazily with single-flight
//! semantics and evicted after an idle TTL.

use crate::binding::RequestBinding;
use crate::error::Result;
use crate::ingest::store::QueryableStore;
use crate::policy::SafetyPolicy;
use crate::poll::{PollRegistration, PollSettings};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use unrelated_api_descriptor::cache::DescriptorCache;
use unrelated_api_descriptor::capability::TargetDescriptor;
use unrelated_http_tools::call::Endpoint;

pub struct SessionContext {
    pub fingerprint: String,
    pub binding: RequestBinding,
    pub descriptor: Arc<TargetDescriptor>,
    pub policy: SafetyPolicy,
    pub poll: Option<PollRegistration>,
    pub store: QueryableStore,
    last_access: Mutex<Instant>,
    failed: AtomicBool,
}

impl SessionContext {
    /// Where calls for this session go: the descriptor's base URL with the forwarded headers.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            base_url: self.descriptor.base_url.clone(),
            headers: self.binding.target_headers.clone(),
        }
    }

    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    #[must_use]
    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    /// Mark the session unusable; the next lookup replaces it.
    pub fn mark_failed(&self) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            tracing::warn!(session = %short(&self.fingerprint), "session marked failed");
        }
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

type Slot = Arc<OnceCell<Arc<SessionContext>>>;

pub struct SessionManager {
    descriptors: DescriptorCache,
    poll_settings: PollSettings,
    idle_ttl: Duration,
    sessions: Mutex<HashMap<String, Slot>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(descriptors: DescriptorCache, poll_settings: PollSettings, idle_ttl: Duration) -> Self {
        Self {
            descriptors,
            poll_settings,
            idle_ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn descriptors(&self) -> &DescriptorCache {
        &self.descriptors
    }

    /// Session for `binding`, created at most once per fingerprint.
    ///
    /// # Errors
    ///
    /// Propagates resolution and store errors; a failed creation leaves no entry behind.
    pub async fn get_or_create(&self, binding: &RequestBinding) -> Result<Arc<SessionContext>> {
        let fingerprint = binding.fingerprint();
        let slot = {
            let mut sessions = self.sessions.lock();
            let failed = sessions
                .get(&fingerprint)
                .and_then(|s| s.get())
                .is_some_and(|s| s.is_failed());
            if failed {
                sessions.remove(&fingerprint);
            }
            Arc::clone(
                sessions
                    .entry(fingerprint.clone())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };

        let created = slot
            .get_or_try_init(|| self.create(fingerprint.clone(), binding))
            .await;
        match created {
            Ok(session) => {
                session.touch();
                Ok(Arc::clone(session))
            }
            Err(e) => {
                let mut sessions = self.sessions.lock();
                if sessions
                    .get(&fingerprint)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && !s.initialized())
                {
                    sessions.remove(&fingerprint);
                }
                Err(e)
            }
        }
    }

    async fn create(&self, fingerprint: String, binding: &RequestBinding) -> Result<Arc<SessionContext>> {
        let descriptor = self.descriptors.get(&binding.target_key()).await?;
        let store = QueryableStore::open().await?;
        tracing::info!(
            session = %short(&fingerprint),
            kind = %binding.api_kind,
            target_url = %binding.target_url,
            "session created"
        );
        Ok(Arc::new(SessionContext {
            policy: SafetyPolicy::new(
                binding.allow_unsafe_paths.clone(),
                binding.poll_paths.clone(),
            ),
            poll: PollRegistration::new(binding.poll_paths.clone(), self.poll_settings.clone()),
            fingerprint,
            binding: binding.clone(),
            descriptor,
            store,
            last_access: Mutex::new(Instant::now()),
            failed: AtomicBool::new(false),
        }))
    }

    /// Re-resolve the target and drop the session so the next request starts fresh.
    ///
    /// # Errors
    ///
    /// Propagates the resolution error.
    pub async fn refresh(&self, binding: &RequestBinding) -> Result<Arc<TargetDescriptor>> {
        let descriptor = self.descriptors.refresh(&binding.target_key()).await?;
        self.sessions.lock().remove(&binding.fingerprint());
        Ok(descriptor)
    }

    /// Drop sessions idle since before `now - idle_ttl`, and descriptors past their TTL.
    /// Returns the number of sessions evicted.
    pub fn evict_idle(&self, now: Instant) -> usize {
        self.descriptors.evict_expired(now);
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, slot| match slot.get() {
            Some(s) => now.saturating_duration_since(s.last_access()) < self.idle_ttl,
            // In-flight creation.
            None => true,
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = sessions.len(), "idle sessions evicted");
        }
        evicted
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`Self::evict_idle`] every `every` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        this.evict_idle(Instant::now());
                    }
                }
            }
            tracing::debug!("session sweeper stopped");
        })
    }
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}
