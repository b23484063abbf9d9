//! Named caches and the per-origin cache registry.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use cachekit_net::{Request, Response};
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::ServiceWorkerError;

/// Cache key for a request: method plus URL without fragment.
///
/// Headers never participate, so `Vary` negotiation is ignored.
pub fn cache_key(method: &Method, url: &Url) -> String {
    format!("{} {}", method.as_str(), normalized_url(url))
}

fn normalized_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

/// One `(name, raw value)` pair per header line, in response order.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, Vec<u8>)> {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect()
}

// ==================== Cache ====================

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (fragment stripped).
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, one pair per header line.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response for the given request.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        Self {
            url: normalized_url(&request.url),
            method: request.method.as_str().to_string(),
            status: response.status.as_u16(),
            headers: header_pairs(&response.headers),
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// First value stored for a header name.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    /// Rebuild the stored headers, repeated lines included.
    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    /// Key this entry is stored under.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A cache instance.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries by key.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.match_url(&request.method, &request.url)
    }

    /// Match by method and URL.
    pub fn match_url(&self, method: &Method, url: &Url) -> Option<&CacheEntry> {
        self.entries.get(&cache_key(method, url))
    }

    /// Store a response for a request, replacing any previous entry.
    pub fn put(&mut self, request: &Request, response: &Response) {
        self.put_entry(CacheEntry::from_response(request, response));
    }

    /// Store a prepared entry, replacing any previous entry with the same key.
    pub fn put_entry(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key(), entry);
    }

    /// Store a batch of entries.
    ///
    /// Entries are only handed over once every one of them exists, so a
    /// failed batch never reaches the cache.
    pub fn put_all(&mut self, entries: Vec<CacheEntry>) {
        for entry in entries {
            self.put_entry(entry);
        }
    }

    /// Delete entry.
    pub fn delete(&mut self, method: &Method, url: &Url) -> bool {
        self.entries.remove(&cache_key(method, url)).is_some()
    }

    /// Get all keys.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// Every named cache created under one origin.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Get a cache mutably without creating it.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cache> {
        self.caches.get_mut(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all cache names, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.caches.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Delete every cache except `current`. Returns the deleted names, sorted.
    pub fn retain_only(&mut self, current: &str) -> Vec<String> {
        let mut deleted: Vec<String> = self
            .caches
            .keys()
            .filter(|name| name.as_str() != current)
            .cloned()
            .collect();
        deleted.sort_unstable();

        for name in &deleted {
            self.caches.remove(name);
            debug!(cache = %name, "Deleted cache");
        }
        deleted
    }

    /// Write a JSON snapshot of every cache.
    pub fn save(&self, path: &Path) -> Result<(), ServiceWorkerError> {
        let data = serde_json::to_vec(self)?;
        std::fs::write(path, data)?;
        info!(path = %path.display(), caches = self.caches.len(), "Saved cache snapshot");
        Ok(())
    }

    /// Load a JSON snapshot. A missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self, ServiceWorkerError> {
        match std::fs::read(path) {
            Ok(data) => {
                let storage: Self = serde_json::from_slice(&data)?;
                info!(path = %path.display(), caches = storage.caches.len(), "Loaded cache snapshot");
                Ok(storage)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No cache snapshot, starting empty");
                Ok(Self::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}
