//! Mock provider for testing and development.
//!
//! Servers and image builds complete after a configurable number of
//! status polls, and failures can be injected per call site:
//! - `fail_next_creates(n)`: next n `create_server` calls fail transiently
//! - `set_permanent_failure(true)`: all creates fail permanently
//! - `fail_next_builds(n)`: next n image builds report a build error
//!
//! Test helpers (`live_servers`, `remove_server`, call counters) allow
//! asserting on and perturbing provider-side state directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{ImageBuildStatus, ProviderAdapter, ProviderError, ProviderResult, ServerStatus};

#[derive(Debug)]
struct MockServer {
    /// Status polls remaining before the server reports active.
    polls_until_active: u32,
    /// Forced into error state by a test.
    failed: bool,
}

#[derive(Debug)]
struct MockBuild {
    image_name: String,
    polls_until_ready: u32,
    /// Build will report error instead of completing.
    fail: bool,
}

#[derive(Debug, Default)]
struct MockState {
    servers: HashMap<String, MockServer>,
    builds: HashMap<String, MockBuild>,
    snapshots: HashMap<String, String>,
    transient_create_failures: u32,
    permanent_failure: bool,
    build_failures: u32,
}

/// Mock provider adapter.
pub struct MockProvider {
    name: String,
    state: Mutex<MockState>,
    id_counter: AtomicU64,
    create_calls: AtomicU64,
    delete_calls: AtomicU64,
    /// Polls before a new server reports active.
    boot_polls: u32,
    /// Polls before a new image build reports ready.
    build_polls: u32,
}

impl MockProvider {
    /// Create a new mock provider. Servers and builds complete on the
    /// first status poll by default.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MockState::default()),
            id_counter: AtomicU64::new(0),
            create_calls: AtomicU64::new(0),
            delete_calls: AtomicU64::new(0),
            boot_polls: 0,
            build_polls: 0,
        }
    }

    /// Require `n` status polls before servers report active.
    pub fn with_boot_polls(mut self, n: u32) -> Self {
        self.boot_polls = n;
        self
    }

    /// Require `n` status polls before image builds report ready.
    pub fn with_build_polls(mut self, n: u32) -> Self {
        self.build_polls = n;
        self
    }

    /// Fail the next `n` server creates with a transient error.
    pub fn fail_next_creates(&self, n: u32) {
        self.state.lock().unwrap().transient_create_failures = n;
    }

    /// Make all server creates fail permanently until cleared.
    pub fn set_permanent_failure(&self, on: bool) {
        self.state.lock().unwrap().permanent_failure = on;
    }

    /// Fail the next `n` image builds with a provider-side build error.
    pub fn fail_next_builds(&self, n: u32) {
        self.state.lock().unwrap().build_failures = n;
    }

    /// Force an existing server into error state.
    pub fn fail_server(&self, server_id: &str) {
        if let Some(server) = self.state.lock().unwrap().servers.get_mut(server_id) {
            server.failed = true;
        }
    }

    /// Remove a server behind the pool's back (simulates an externally
    /// deleted server for orphan detection tests).
    pub fn remove_server(&self, server_id: &str) {
        self.state.lock().unwrap().servers.remove(server_id);
    }

    /// Ids of all live servers.
    pub fn live_servers(&self) -> Vec<String> {
        self.state.lock().unwrap().servers.keys().cloned().collect()
    }

    /// Ids of all live snapshots.
    pub fn live_snapshots(&self) -> Vec<String> {
        self.state.lock().unwrap().snapshots.keys().cloned().collect()
    }

    /// Total `create_server` calls observed.
    pub fn create_call_count(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Total `delete_server` calls observed.
    pub fn delete_call_count(&self) -> u64 {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn next_id(&self, prefix: &str) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}_{}_{:08x}", prefix, self.name, counter)
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_server(&self, snapshot_id: &str, label: &str) -> ProviderResult<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        if state.permanent_failure {
            return Err(ProviderError::Permanent("quota exceeded".to_string()));
        }
        if state.transient_create_failures > 0 {
            state.transient_create_failures -= 1;
            return Err(ProviderError::Transient("rate limited".to_string()));
        }

        let server_id = self.next_id("srv");
        state.servers.insert(
            server_id.clone(),
            MockServer {
                polls_until_active: self.boot_polls,
                failed: false,
            },
        );

        info!(
            provider = %self.name,
            server_id = %server_id,
            snapshot_id = %snapshot_id,
            label = %label,
            "[MOCK] Created server"
        );
        Ok(server_id)
    }

    async fn delete_server(&self, server_id: &str) -> ProviderResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);

        let removed = self.state.lock().unwrap().servers.remove(server_id).is_some();
        debug!(
            provider = %self.name,
            server_id = %server_id,
            existed = removed,
            "[MOCK] Deleted server"
        );
        // NotFound is success: the resource is gone either way.
        Ok(())
    }

    async fn server_status(&self, server_id: &str) -> ProviderResult<ServerStatus> {
        let mut state = self.state.lock().unwrap();
        let Some(server) = state.servers.get_mut(server_id) else {
            return Ok(ServerStatus::Missing);
        };

        if server.failed {
            return Ok(ServerStatus::Error);
        }
        if server.polls_until_active > 0 {
            server.polls_until_active -= 1;
            return Ok(ServerStatus::Booting);
        }
        Ok(ServerStatus::Active)
    }

    async fn create_image(&self, image_name: &str) -> ProviderResult<String> {
        let mut state = self.state.lock().unwrap();

        let fail = if state.build_failures > 0 {
            state.build_failures -= 1;
            true
        } else {
            false
        };

        let build_id = self.next_id("bld");
        state.builds.insert(
            build_id.clone(),
            MockBuild {
                image_name: image_name.to_string(),
                polls_until_ready: self.build_polls,
                fail,
            },
        );

        info!(
            provider = %self.name,
            build_id = %build_id,
            image = %image_name,
            "[MOCK] Started image build"
        );
        Ok(build_id)
    }

    async fn image_status(&self, build_id: &str) -> ProviderResult<ImageBuildStatus> {
        let mut state = self.state.lock().unwrap();
        let Some(build) = state.builds.get_mut(build_id) else {
            return Err(ProviderError::Permanent(format!(
                "unknown build: {build_id}"
            )));
        };

        if build.polls_until_ready > 0 {
            build.polls_until_ready -= 1;
            return Ok(ImageBuildStatus::Building);
        }
        if build.fail {
            return Ok(ImageBuildStatus::Error {
                reason: "image build failed".to_string(),
            });
        }

        let snapshot_id = format!("snap_{build_id}");
        let image_name = build.image_name.clone();
        state.snapshots.insert(snapshot_id.clone(), image_name);
        Ok(ImageBuildStatus::Ready { snapshot_id })
    }

    async fn delete_image(&self, snapshot_id: &str) -> ProviderResult<()> {
        let removed = self.state.lock().unwrap().snapshots.remove(snapshot_id).is_some();
        debug!(
            provider = %self.name,
            snapshot_id = %snapshot_id,
            existed = removed,
            "[MOCK] Deleted snapshot"
        );
        Ok(())
    }

    async fn list_servers(&self) -> ProviderResult<Vec<String>> {
        Ok(self.live_servers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_boot() {
        let provider = MockProvider::new("cloud-a").with_boot_polls(2);

        let server_id = provider.create_server("snap_1", "small").await.unwrap();
        assert_eq!(
            provider.server_status(&server_id).await.unwrap(),
            ServerStatus::Booting
        );
        assert_eq!(
            provider.server_status(&server_id).await.unwrap(),
            ServerStatus::Booting
        );
        assert_eq!(
            provider.server_status(&server_id).await.unwrap(),
            ServerStatus::Active
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let provider = MockProvider::new("cloud-a");
        let server_id = provider.create_server("snap_1", "small").await.unwrap();

        provider.delete_server(&server_id).await.unwrap();
        provider.delete_server(&server_id).await.unwrap();
        assert_eq!(
            provider.server_status(&server_id).await.unwrap(),
            ServerStatus::Missing
        );
    }

    #[tokio::test]
    async fn test_transient_create_failures() {
        let provider = MockProvider::new("cloud-a");
        provider.fail_next_creates(1);

        let err = provider.create_server("snap_1", "small").await.unwrap_err();
        assert!(err.is_transient());

        provider.create_server("snap_1", "small").await.unwrap();
        assert_eq!(provider.create_call_count(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure() {
        let provider = MockProvider::new("cloud-a");
        provider.set_permanent_failure(true);

        let err = provider.create_server("snap_1", "small").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_image_build_lifecycle() {
        let provider = MockProvider::new("cloud-a").with_build_polls(1);

        let build_id = provider.create_image("ci-base").await.unwrap();
        assert_eq!(
            provider.image_status(&build_id).await.unwrap(),
            ImageBuildStatus::Building
        );

        let status = provider.image_status(&build_id).await.unwrap();
        let ImageBuildStatus::Ready { snapshot_id } = status else {
            panic!("expected ready build, got {status:?}");
        };

        assert_eq!(provider.live_snapshots(), vec![snapshot_id.clone()]);
        provider.delete_image(&snapshot_id).await.unwrap();
        assert!(provider.live_snapshots().is_empty());
    }

    #[tokio::test]
    async fn test_failed_build() {
        let provider = MockProvider::new("cloud-a");
        provider.fail_next_builds(1);

        let build_id = provider.create_image("ci-base").await.unwrap();
        let status = provider.image_status(&build_id).await.unwrap();
        assert!(matches!(status, ImageBuildStatus::Error { .. }));

        // Next build succeeds.
        let build_id = provider.create_image("ci-base").await.unwrap();
        let status = provider.image_status(&build_id).await.unwrap();
        assert!(matches!(status, ImageBuildStatus::Ready { .. }));
    }
}
