//! Worker configuration: cache naming and the asset manifest.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::ServiceWorkerError;

/// Configuration for one deploy generation of the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Application prefix used in the cache name.
    pub app_prefix: String,

    /// Version stamp. Bumping it invalidates every older cache on activation.
    pub version: String,

    /// Origin the controller is attached to (scheme, host, port).
    pub origin: String,

    /// Page served to navigations that fail while offline.
    pub offline_path: String,

    /// Same-origin paths precached at install, in order.
    pub manifest: Vec<String>,

    /// Activate right after install instead of waiting for old clients.
    pub skip_waiting_on_install: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            app_prefix: "site".to_string(),
            version: "v1".to_string(),
            origin: "http://localhost:5173".to_string(),
            offline_path: "/offline.html".to_string(),
            manifest: [
                "/",
                "/index.html",
                "/projects.html",
                "/project-detail.html",
                "/offline.html",
                "/style.css",
                "/scripts/main.js",
                "/scripts/theme.js",
                "/scripts/i18n.js",
                "/scripts/projects.js",
                "/scripts/pwa.js",
                "/manifest.webmanifest",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            skip_waiting_on_install: true,
        }
    }
}

impl WorkerConfig {
    /// Config for `origin` with the default manifest.
    pub fn for_origin(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            ..Default::default()
        }
    }

    /// Parse and validate a JSON config.
    pub fn from_json_str(data: &str) -> Result<Self, ServiceWorkerError> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ServiceWorkerError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    /// `<app_prefix>-cache-<version>`.
    pub fn cache_name(&self) -> String {
        format!("{}-cache-{}", self.app_prefix, self.version)
    }

    /// Parsed origin URL.
    pub fn origin_url(&self) -> Result<Url, ServiceWorkerError> {
        let url = Url::parse(&self.origin)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("origin '{}': {}", self.origin, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ServiceWorkerError::ConfigError(format!(
                "origin scheme must be http or https, got '{}'",
                other
            ))),
        }
    }

    /// Resolve a same-origin path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        if !path.starts_with('/') {
            return Err(ServiceWorkerError::ConfigError(format!(
                "'{}' is not an absolute path",
                path
            )));
        }
        self.origin_url()?
            .join(path)
            .map_err(|e| ServiceWorkerError::ConfigError(format!("'{}': {}", path, e)))
    }

    /// Manifest entries as absolute URLs, in manifest order.
    pub fn manifest_urls(&self) -> Result<Vec<Url>, ServiceWorkerError> {
        self.manifest.iter().map(|p| self.resolve(p)).collect()
    }

    /// Offline page URL.
    pub fn offline_url(&self) -> Result<Url, ServiceWorkerError> {
        self.resolve(&self.offline_path)
    }

    /// Check the naming, manifest and offline-page contracts.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.app_prefix.trim().is_empty() {
            return Err(ServiceWorkerError::ConfigError("app_prefix is empty".into()));
        }
        if self.version.trim().is_empty() {
            return Err(ServiceWorkerError::ConfigError("version is empty".into()));
        }

        let origin = self.origin_url()?.origin();
        let mut seen = HashSet::new();
        for url in self.manifest_urls()? {
            if url.origin() != origin {
                return Err(ServiceWorkerError::ConfigError(format!(
                    "manifest entry {} is cross-origin",
                    url
                )));
            }
            if !seen.insert(url.to_string()) {
                return Err(ServiceWorkerError::ConfigError(format!(
                    "manifest entry {} is listed twice",
                    url
                )));
            }
        }

        if !seen.contains(self.offline_url()?.as_str()) {
            return Err(ServiceWorkerError::ConfigError(format!(
                "offline page {} is not in the manifest",
                self.offline_path
            )));
        }
        Ok(())
    }
}
