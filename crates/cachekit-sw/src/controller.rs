//! The cache-first controller: lifecycle handlers and fetch policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cachekit_net::{Fetcher, Request};
use futures::future::try_join_all;
use http::{Method, StatusCode};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use url::{Origin, Url};

use crate::cache::{CacheEntry, CacheStorage};
use crate::config::WorkerConfig;
use crate::{
    ControlMessage, FetchEvent, FetchResponse, ResponseSource, ServiceWorkerError,
    ServiceWorkerEvent, ServiceWorkerId, ServiceWorkerState,
};

/// One generation of the cache-first worker.
///
/// Event handlers are explicit methods (`on_install`, `on_activate`,
/// `on_fetch`, `on_message`) so a host decides when they run.
pub struct CacheController {
    id: ServiceWorkerId,
    config: WorkerConfig,
    cache_name: String,
    origin: Origin,
    manifest: Vec<Url>,
    offline_url: Url,
    state: RwLock<ServiceWorkerState>,
    skip_waiting: AtomicBool,
    caches: Arc<RwLock<CacheStorage>>,
    fetcher: Arc<dyn Fetcher>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl CacheController {
    /// Create a controller with its own event channel.
    pub fn new(
        config: WorkerConfig,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>), ServiceWorkerError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let controller = Self::with_events(config, caches, fetcher, event_tx)?;
        Ok((controller, event_rx))
    }

    /// Create a controller reporting to an existing event channel.
    pub fn with_events(
        config: WorkerConfig,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetcher>,
        event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;

        Ok(Self {
            id: ServiceWorkerId::new(),
            cache_name: config.cache_name(),
            origin: config.origin_url()?.origin(),
            manifest: config.manifest_urls()?,
            offline_url: config.offline_url()?,
            config,
            state: RwLock::new(ServiceWorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            caches,
            fetcher,
            event_tx,
        })
    }

    /// Rebuild an already-active controller over a persisted registry.
    ///
    /// Fails if the current generation's cache is not in the registry.
    pub async fn resume(
        config: WorkerConfig,
        caches: Arc<RwLock<CacheStorage>>,
        fetcher: Arc<dyn Fetcher>,
        event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
    ) -> Result<Self, ServiceWorkerError> {
        let controller = Self::with_events(config, caches, fetcher, event_tx)?;
        if !controller.caches.read().await.has(&controller.cache_name) {
            return Err(ServiceWorkerError::NotFound(controller.cache_name.clone()));
        }
        *controller.state.write().await = ServiceWorkerState::Activated;
        info!(cache = %controller.cache_name, "Resumed active controller");
        Ok(controller)
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Name of this generation's cache.
    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub async fn state(&self) -> ServiceWorkerState {
        *self.state.read().await
    }

    /// Whether a skip-waiting request is pending.
    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    async fn set_state(&self, new_state: ServiceWorkerState) {
        *self.state.write().await = new_state;
        debug!(worker = self.id.raw(), state = ?new_state, "Worker state changed");
        let _ = self.event_tx.send(ServiceWorkerEvent::StateChange {
            worker_id: self.id,
            new_state,
        });
    }

    pub(crate) async fn mark_redundant(&self) {
        self.set_state(ServiceWorkerState::Redundant).await;
    }

    // ==================== Lifecycle ====================

    /// Install: precache every manifest entry, or nothing.
    ///
    /// All manifest fetches must resolve with a 2xx status before any entry
    /// is written. On failure the worker becomes redundant and the registry
    /// is left exactly as it was.
    pub async fn on_install(&self) -> Result<(), ServiceWorkerError> {
        let state = self.state().await;
        if state != ServiceWorkerState::Parsed {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot install from {:?}",
                state
            )));
        }

        self.set_state(ServiceWorkerState::Installing).await;
        info!(cache = %self.cache_name, assets = self.manifest.len(), "Installing");

        let fetches = self.manifest.iter().map(|url| self.precache_one(url));
        let entries = match try_join_all(fetches).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(cache = %self.cache_name, error = %e, "Install aborted");
                self.set_state(ServiceWorkerState::Redundant).await;
                return Err(e);
            }
        };

        self.caches
            .write()
            .await
            .open(&self.cache_name)
            .put_all(entries);

        if self.config.skip_waiting_on_install {
            self.skip_waiting.store(true, Ordering::SeqCst);
        }

        self.set_state(ServiceWorkerState::Installed).await;
        info!(cache = %self.cache_name, "Installed");
        Ok(())
    }

    async fn precache_one(&self, url: &Url) -> Result<CacheEntry, ServiceWorkerError> {
        let request = Request::get(url.clone());
        match self.fetcher.fetch(&request).await {
            Ok(response) if response.ok() => Ok(CacheEntry::from_response(&request, &response)),
            Ok(response) => Err(ServiceWorkerError::InstallFailed {
                url: url.to_string(),
                reason: format!("status {}", response.status),
            }),
            Err(e) => Err(ServiceWorkerError::InstallFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Activate: delete every cache but this generation's.
    pub async fn on_activate(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let state = self.state().await;
        if state != ServiceWorkerState::Installed {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot activate from {:?}",
                state
            )));
        }

        self.set_state(ServiceWorkerState::Activating).await;
        info!(cache = %self.cache_name, "Activating");

        let deleted = self.caches.write().await.retain_only(&self.cache_name);
        for name in &deleted {
            info!(cache = %name, "Deleting old cache");
            let _ = self
                .event_tx
                .send(ServiceWorkerEvent::CacheDeleted { name: name.clone() });
        }

        self.set_state(ServiceWorkerState::Activated).await;
        Ok(deleted)
    }

    /// Control channel. Returns true if the message asked to skip waiting.
    pub fn on_message(&self, message: &ControlMessage) -> bool {
        match message {
            ControlMessage::SkipWaiting => {
                info!(worker = self.id.raw(), "Skip waiting requested");
                self.skip_waiting.store(true, Ordering::SeqCst);
                true
            }
            ControlMessage::Unknown => {
                trace!(worker = self.id.raw(), "Ignoring control message");
                false
            }
        }
    }

    // ==================== Fetch ====================

    /// Fetch event. `None` leaves the request to the network untouched.
    pub async fn on_fetch(&self, event: &FetchEvent) -> Option<FetchResponse> {
        if self.state().await != ServiceWorkerState::Activated {
            return None;
        }
        self.handle(&event.request).await
    }

    /// Cache-first policy for same-origin GET requests.
    ///
    /// Any other request returns `None` without touching the cache.
    pub async fn handle(&self, request: &Request) -> Option<FetchResponse> {
        if request.method != Method::GET {
            trace!(url = %request.url, method = %request.method, "Not intercepting non-GET");
            return None;
        }
        if request.url.origin() != self.origin {
            trace!(url = %request.url, "Not intercepting cross-origin");
            return None;
        }

        let cached = {
            let caches = self.caches.read().await;
            caches
                .get(&self.cache_name)
                .and_then(|cache| cache.match_request(request))
                .cloned()
        };

        if let Some(entry) = cached {
            debug!(url = %request.url, "Cache hit");
            self.spawn_revalidation(request.duplicate());
            return Some(FetchResponse::from_cache(&entry));
        }

        debug!(url = %request.url, "Cache miss");
        match self.fetcher.fetch(request).await {
            Ok(response) if response.status == StatusCode::OK => {
                let entry = CacheEntry::from_response(request, &response);
                if let Some(cache) = self.caches.write().await.get_mut(&self.cache_name) {
                    cache.put_entry(entry);
                }
                Some(FetchResponse::from_network(response))
            }
            Ok(response) => {
                debug!(url = %request.url, status = %response.status, "Passing through uncached");
                Some(FetchResponse::from_network(response))
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Network failed, using fallback");
                Some(self.offline_fallback(request).await)
            }
        }
    }

    async fn offline_fallback(&self, request: &Request) -> FetchResponse {
        if !request.is_navigation() {
            return FetchResponse::synthesized(StatusCode::SERVICE_UNAVAILABLE, "Network error");
        }

        let caches = self.caches.read().await;
        match caches
            .get(&self.cache_name)
            .and_then(|cache| cache.match_url(&Method::GET, &self.offline_url))
        {
            Some(entry) => FetchResponse {
                source: ResponseSource::Fallback,
                ..FetchResponse::from_cache(entry)
            },
            None => FetchResponse::synthesized(StatusCode::OK, "Offline"),
        }
    }

    /// Refresh a cached entry without holding up the caller.
    ///
    /// The task is detached. Its outcome only shows up on the event channel
    /// and at debug level. Any response that arrives replaces the entry,
    /// whatever its status; a rejected fetch leaves the entry alone. A
    /// generation deleted meanwhile is not recreated.
    fn spawn_revalidation(&self, request: Request) {
        let caches = Arc::clone(&self.caches);
        let fetcher = Arc::clone(&self.fetcher);
        let cache_name = self.cache_name.clone();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let url = request.url.to_string();
            let event = match fetcher.fetch(&request).await {
                Ok(response) => {
                    let entry = CacheEntry::from_response(&request, &response);
                    match caches.write().await.get_mut(&cache_name) {
                        Some(cache) => {
                            cache.put_entry(entry);
                            debug!(url = %url, status = %response.status, "Revalidated");
                            ServiceWorkerEvent::Revalidated { url }
                        }
                        None => {
                            debug!(url = %url, cache = %cache_name, "Cache gone, dropping revalidation");
                            ServiceWorkerEvent::RevalidationFailed {
                                url,
                                reason: format!("cache {} deleted", cache_name),
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(url = %url, error = %e, "Revalidation failed");
                    ServiceWorkerEvent::RevalidationFailed {
                        url,
                        reason: e.to_string(),
                    }
                }
            };
            let _ = event_tx.send(event);
        });
    }
}

impl std::fmt::Debug for CacheController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheController")
            .field("id", &self.id)
            .field("cache_name", &self.cache_name)
            .finish_non_exhaustive()
    }
}
