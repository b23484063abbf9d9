//! # CacheKit Common
//!
//! Shared error type and logging setup for the CacheKit offline cache controller.
//!
//! ## Features
//!
//! - Unified error type with per-category log fields
//! - Logging configuration and subscriber setup
//! - Option extension trait

use thiserror::Error;

pub mod logging;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat};

/// Unified error type for CacheKit hosts.
#[derive(Error, Debug)]
pub enum CacheKitError {
    /// Network-related errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cache storage errors.
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Worker lifecycle errors (install aborted, bad transition).
    #[error("Lifecycle error: {message}")]
    Lifecycle {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config { message: String },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl CacheKitError {
    /// Create a network error with source.
    pub fn network_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a cache error with source.
    pub fn cache_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a lifecycle error with source.
    pub fn lifecycle_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Lifecycle {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether a later attempt could succeed.
    ///
    /// Nothing in the controller retries on its own; hosts use this to decide
    /// whether re-running `warm` is worth it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheKitError::Network { .. } | CacheKitError::Io(_))
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            CacheKitError::Network { .. } => "network",
            CacheKitError::Cache { .. } => "cache",
            CacheKitError::Lifecycle { .. } => "lifecycle",
            CacheKitError::Config { .. } => "config",
            CacheKitError::Io(_) => "io",
            CacheKitError::NotFound(_) => "not_found",
        }
    }
}

/// Result type alias for CacheKit operations.
pub type Result<T> = std::result::Result<T, CacheKitError>;

/// Extension trait for Option.
pub trait OptionExt<T> {
    /// Convert None to a NotFound error.
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, resource: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| CacheKitError::NotFound(resource.into()))
    }
}
