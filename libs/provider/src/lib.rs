//! Provider adapter interface for warmpool.
//!
//! The adapter abstracts one cloud endpoint behind an async trait:
//! - Creating/deleting servers and checking boot status
//! - Creating/deleting image snapshots and polling build progress
//! - Listing live servers (used by cleanup for orphan detection)
//!
//! All pool logic depends only on this trait. One implementation variant
//! exists per supported cloud; the in-tree [`MockProvider`] backs the
//! `mock` driver and the test suites.
//!
//! Retry policy is deliberately the caller's concern: adapters report
//! failures as [`ProviderError::Transient`] or [`ProviderError::Permanent`]
//! and never retry internally.

use async_trait::async_trait;
use thiserror::Error;

mod mock;

pub use mock::MockProvider;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors returned by a provider adapter.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transient failure (network blip, rate limit). Safe to retry with backoff.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Permanent failure (quota exceeded, invalid spec). Retrying will not help.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    /// Returns true if the error is worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Provider-reported status of a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    /// Server exists but is still booting.
    Booting,
    /// Server is up and reachable.
    Active,
    /// Server entered a failed state on the provider side.
    Error,
    /// Provider has no record of this server.
    Missing,
}

/// Provider-reported status of an image snapshot build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageBuildStatus {
    /// Build is still in progress.
    Building,
    /// Build completed; the snapshot can be booted from.
    Ready {
        /// Provider-side snapshot identifier.
        snapshot_id: String,
    },
    /// Build failed on the provider side.
    Error {
        /// Provider-reported failure reason.
        reason: String,
    },
}

/// Adapter for one cloud provider.
///
/// Delete operations are idempotent: deleting a server or snapshot the
/// provider no longer knows about is reported as success.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider name for logging.
    fn name(&self) -> &str;

    /// Create a server booted from the given snapshot. Returns the
    /// provider-side server id.
    async fn create_server(&self, snapshot_id: &str, label: &str) -> ProviderResult<String>;

    /// Delete a server. "Already gone" is success.
    async fn delete_server(&self, server_id: &str) -> ProviderResult<()>;

    /// Report the current status of a server.
    async fn server_status(&self, server_id: &str) -> ProviderResult<ServerStatus>;

    /// Start building an image snapshot. Returns a build id to poll.
    async fn create_image(&self, image_name: &str) -> ProviderResult<String>;

    /// Report the status of an image build.
    async fn image_status(&self, build_id: &str) -> ProviderResult<ImageBuildStatus>;

    /// Delete an image snapshot. "Already gone" is success.
    async fn delete_image(&self, snapshot_id: &str) -> ProviderResult<()>;

    /// List ids of all live servers owned by this provider account.
    async fn list_servers(&self) -> ProviderResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ProviderError::Transient("rate limited".into()).is_transient());
        assert!(!ProviderError::Permanent("quota exceeded".into()).is_transient());
    }
}
