//! Registration slots (installing, waiting, active) and controlled clients.

use std::sync::Arc;

use hashbrown::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};
use url::Url;

use crate::controller::CacheController;
use crate::{ControlMessage, FetchEvent, FetchResponse, ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerId};

// ==================== Client ====================

/// A client (open page) of the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Worker currently controlling this client.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    pub fn new(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            url,
            controller: None,
        }
    }
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Number of clients controlled by `worker`.
    pub fn controlled_by(&self, worker: ServiceWorkerId) -> usize {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .count()
    }

    /// Put every client under `worker`. Returns the IDs whose controller changed.
    pub fn claim(&mut self, worker: ServiceWorkerId) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        changed.sort_unstable();
        changed
    }
}

// ==================== Registration ====================

/// The worker slots for one scope.
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    installing: Option<Arc<CacheController>>,
    waiting: Option<Arc<CacheController>>,
    active: Option<Arc<CacheController>>,
    clients: Clients,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerRegistration {
    /// Create an empty registration.
    pub fn new(scope: Url, event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            clients: Clients::new(),
            event_tx,
        }
    }

    pub fn installing(&self) -> Option<&Arc<CacheController>> {
        self.installing.as_ref()
    }

    pub fn waiting(&self) -> Option<&Arc<CacheController>> {
        self.waiting.as_ref()
    }

    pub fn active(&self) -> Option<&Arc<CacheController>> {
        self.active.as_ref()
    }

    pub fn clients(&self) -> &Clients {
        &self.clients
    }

    /// Install a new generation and activate it if nothing holds it back.
    ///
    /// On failure the current active worker keeps control.
    pub async fn install(
        &mut self,
        controller: Arc<CacheController>,
    ) -> Result<(), ServiceWorkerError> {
        self.installing = Some(Arc::clone(&controller));
        let result = controller.on_install().await;
        self.installing = None;
        result?;

        if let Some(previous) = self.waiting.replace(controller) {
            previous.mark_redundant().await;
        }
        self.try_activate().await?;
        Ok(())
    }

    /// Activate the waiting worker if it asked to skip waiting or the
    /// active worker no longer controls any client.
    pub async fn try_activate(&mut self) -> Result<bool, ServiceWorkerError> {
        let Some(waiting) = self.waiting.as_ref() else {
            return Ok(false);
        };

        let ready = waiting.skip_waiting_requested()
            || match self.active.as_ref() {
                Some(active) => self.clients.controlled_by(active.id()) == 0,
                None => true,
            };
        if !ready {
            debug!(worker = waiting.id().raw(), "Waiting for old clients to close");
            return Ok(false);
        }

        let Some(next) = self.waiting.take() else {
            return Ok(false);
        };
        next.on_activate().await?;

        if let Some(previous) = self.active.replace(Arc::clone(&next)) {
            previous.mark_redundant().await;
        }

        for client_id in self.clients.claim(next.id()) {
            let _ = self.event_tx.send(ServiceWorkerEvent::ControllerChange {
                client_id,
                worker_id: next.id(),
            });
        }
        info!(worker = next.id().raw(), cache = %next.cache_name(), "Activated and claimed clients");
        Ok(true)
    }

    /// Post a control message to the waiting worker, or the active one.
    ///
    /// Returns true if the message activated the waiting worker.
    pub async fn post_message(
        &mut self,
        message: &ControlMessage,
    ) -> Result<bool, ServiceWorkerError> {
        if let Some(waiting) = self.waiting.as_ref() {
            if waiting.on_message(message) {
                return self.try_activate().await;
            }
            return Ok(false);
        }
        if let Some(active) = self.active.as_ref() {
            active.on_message(message);
        }
        Ok(false)
    }

    /// A page opened. It is controlled by the active worker, if any.
    pub fn open_client(&mut self, mut client: Client) {
        client.controller = self.active.as_ref().map(|a| a.id());
        self.clients.add(client);
    }

    /// A page closed. This may release a waiting worker.
    pub async fn close_client(&mut self, id: &str) -> Result<Option<Client>, ServiceWorkerError> {
        let removed = self.clients.remove(id);
        if removed.is_some() {
            self.try_activate().await?;
        }
        Ok(removed)
    }

    /// Route a fetch to the active worker. `None` means default network behaviour.
    pub async fn dispatch_fetch(&self, event: &FetchEvent) -> Option<FetchResponse> {
        let active = self.active.as_ref()?;
        active.on_fetch(event).await
    }
}
