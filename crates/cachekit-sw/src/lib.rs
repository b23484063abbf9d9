//! # CacheKit Service Worker
//!
//! Cache-first request controller with background revalidation and an
//! offline fallback, modelled on a service worker attached to one origin.
//!
//! ## Features
//!
//! - **Lifecycle**: install (precache the asset manifest), activate (sweep old
//!   cache generations, claim clients), skip-waiting control message
//! - **Cache API**: versioned named caches keyed by method + URL
//! - **Fetch interception**: cache hit served immediately and refreshed in the
//!   background, cache miss fetched and stored, offline fallback on failure
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerRegistration
//!     ├── installing (CacheController)
//!     ├── waiting (CacheController)
//!     ├── active (CacheController)
//!     └── Clients
//!
//! CacheStorage (shared by every controller of the origin)
//!     └── Cache "<prefix>-cache-<version>"
//!             └── Request → CacheEntry
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use cachekit_common::CacheKitError;
use cachekit_net::{Request, Response};
use http::{header, HeaderMap, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod cache;
pub mod config;
pub mod controller;
pub mod registration;

pub use cache::{Cache, CacheEntry, CacheStorage};
pub use config::WorkerConfig;
pub use controller::CacheController;
pub use registration::{Client, Clients, ServiceWorkerRegistration};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed: {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("State error: {0}")]
    StateError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<ServiceWorkerError> for CacheKitError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::InstallFailed { .. } => {
                CacheKitError::lifecycle_with_source("install aborted", err)
            }
            ServiceWorkerError::StateError(_) => {
                CacheKitError::lifecycle_with_source("invalid transition", err)
            }
            ServiceWorkerError::ConfigError(msg) => CacheKitError::config(msg),
            ServiceWorkerError::NotFound(what) => CacheKitError::NotFound(what),
            ServiceWorkerError::Io(e) => CacheKitError::Io(e),
            ServiceWorkerError::Serialization(e) => {
                CacheKitError::cache_with_source("snapshot is not valid JSON", e)
            }
        }
    }
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, nothing run yet.
    #[default]
    Parsed,
    /// Installing (precaching the manifest).
    Installing,
    /// Installed and waiting for activation.
    Installed,
    /// Activating (sweeping old caches).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed, or replaced by a newer worker.
    Redundant,
}

/// Messages accepted on the control channel.
///
/// Wire form is `{"type": "SKIP_WAITING"}`; `"force-activate"` is accepted
/// as an alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "SKIP_WAITING", alias = "force-activate")]
    SkipWaiting,
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Parse a posted message. Anything unrecognised is `Unknown`.
    pub fn from_json(data: &str) -> Self {
        serde_json::from_str(data).unwrap_or(Self::Unknown)
    }
}

/// Service worker events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// An old cache generation was deleted during activation.
    CacheDeleted { name: String },
    /// A client is now controlled by a different worker.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
    /// Background revalidation stored a fresh response.
    Revalidated { url: String },
    /// Background revalidation got no response; the cached entry is unchanged.
    RevalidationFailed { url: String, reason: String },
}

// ==================== Fetch Event ====================

/// A fetch event.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    /// The intercepted request.
    pub request: Request,

    /// Client that issued the request.
    pub client_id: Option<String>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            client_id: None,
        }
    }

    pub fn from_client(request: Request, client_id: impl Into<String>) -> Self {
        Self {
            request,
            client_id: Some(client_id.into()),
        }
    }
}

/// Where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Served from the current cache.
    Cache,
    /// Fetched from the network.
    Network,
    /// Offline page or synthesized error.
    Fallback,
}

/// Fetch event response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// Status code.
    pub status: u16,

    /// Status text.
    pub status_text: String,

    /// Response headers.
    pub headers: HeaderMap,

    /// Response body.
    pub body: Bytes,

    /// Where the response came from.
    pub source: ResponseSource,
}

impl FetchResponse {
    /// Create a response from a cache entry.
    pub fn from_cache(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            status_text: status_text(entry.status),
            headers: entry.header_map(),
            body: Bytes::from(entry.body.clone()),
            source: ResponseSource::Cache,
        }
    }

    /// Create a response from a network response, passing it through verbatim.
    pub fn from_network(response: Response) -> Self {
        Self {
            status: response.status.as_u16(),
            status_text: status_text(response.status.as_u16()),
            headers: response.headers,
            body: response.body,
            source: ResponseSource::Network,
        }
    }

    /// Create a plain-text response that never touched cache or network.
    pub fn synthesized(status: StatusCode, text: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain;charset=UTF-8"),
        );
        Self {
            status: status.as_u16(),
            status_text: status_text(status.as_u16()),
            headers,
            body: Bytes::copy_from_slice(text.as_bytes()),
            source: ResponseSource::Fallback,
        }
    }

    /// Check if successful (2xx).
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn status_text(status: u16) -> String {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
        .to_string()
}
