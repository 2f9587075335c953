//! Image build pipeline.
//!
//! Each tick walks the (provider, image) pairs the current config binds
//! through labels and decides, per pair, whether a new build is needed:
//! no usable ready build exists, or the newest ready build has aged past
//! the image's rebuild interval. At most one build per pair is in flight
//! at a time.
//!
//! A build is durable from the start: the record is inserted in
//! `building` before the provider is called, then driven to `ready` (with
//! its snapshot id) or `error` under the CAS contract. When a new build
//! becomes ready, older ready builds for the pair are flagged superseded;
//! nodes already pinned to them keep running, and cleanup retires the
//! builds once nothing references them.
//!
//! A failed build stays in `error` and is not retried in a tight loop;
//! the next scheduled tick simply starts a fresh build for the pair.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use warmpool_provider::{ImageBuildStatus, ProviderAdapter, ProviderError};

use crate::backoff::RetryPolicy;
use crate::config::ConfigSnapshot;
use crate::launcher::ProviderRegistry;
use crate::model::{ImageBuildRecord, ImageState};
use crate::state::{ImageFilter, StateStore, StateStoreError};

/// Builder tuning knobs.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Interval between builder ticks.
    pub tick_interval: Duration,

    /// Retry policy for transient provider failures on build start.
    pub retry: RetryPolicy,

    /// Interval between build status polls.
    pub poll_interval: Duration,

    /// Maximum time a build may run before it is marked failed.
    pub build_timeout: Duration,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(5),
            build_timeout: Duration::from_secs(1800),
        }
    }
}

/// Counters from one builder tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuilderStats {
    pub builds_started: u64,
    /// Stale `building` rows from a previous process, marked failed.
    pub builds_abandoned: u64,
}

/// The image build pipeline.
pub struct ImageBuilder {
    store: Arc<StateStore>,
    registry: Arc<ProviderRegistry>,
    config_rx: watch::Receiver<Arc<ConfigSnapshot>>,
    config: Arc<BuilderConfig>,
    /// (provider, image) pairs with a build task running in this process.
    in_flight: Arc<Mutex<HashSet<(String, String)>>>,
}

impl ImageBuilder {
    pub fn new(
        store: Arc<StateStore>,
        registry: Arc<ProviderRegistry>,
        config_rx: watch::Receiver<Arc<ConfigSnapshot>>,
        config: BuilderConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config_rx,
            config: Arc::new(config),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run the builder loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_interval_secs = self.config.tick_interval.as_secs(),
            "Starting image builder"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick(shutdown.clone()) {
                        Ok(stats) => {
                            if stats.builds_started > 0 {
                                info!(builds = stats.builds_started, "Image builds started");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Image builder tick failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Image builder shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one builder tick: start a build for every pair that needs one.
    pub fn tick(&self, shutdown: watch::Receiver<bool>) -> Result<BuilderStats, StateStoreError> {
        let snapshot = self.config_rx.borrow().clone();
        let mut stats = BuilderStats::default();

        for (provider, image) in snapshot.provider_image_pairs() {
            if self.is_in_flight(&provider, &image) {
                continue;
            }

            stats.builds_abandoned += self.abandon_stale_builds(&provider, &image)?;

            if !self.needs_build(&snapshot, &provider, &image)? {
                continue;
            }

            let Some(adapter) = self.registry.adapter(&provider) else {
                debug!(provider = %provider, "No adapter yet, deferring image build");
                continue;
            };

            // Durable before the provider is touched.
            let record = ImageBuildRecord::new(&image, &provider);
            self.store.insert_image_build(&record)?;

            self.mark_in_flight(&provider, &image);
            info!(
                provider = %provider,
                image = %image,
                build_id = %record.id,
                "Starting image build"
            );

            let task = BuildTask {
                store: Arc::clone(&self.store),
                adapter,
                config: Arc::clone(&self.config),
                in_flight: Arc::clone(&self.in_flight),
                provider: provider.clone(),
                image: image.clone(),
                record_id: record.id.clone(),
                shutdown: shutdown.clone(),
            };
            tokio::spawn(task.run());
            stats.builds_started += 1;
        }

        Ok(stats)
    }

    fn is_in_flight(&self, provider: &str, image: &str) -> bool {
        self.in_flight
            .lock()
            .expect("builder in-flight lock poisoned")
            .contains(&(provider.to_string(), image.to_string()))
    }

    fn mark_in_flight(&self, provider: &str, image: &str) {
        self.in_flight
            .lock()
            .expect("builder in-flight lock poisoned")
            .insert((provider.to_string(), image.to_string()));
    }

    /// A `building` row with no task in this process is a leftover from a
    /// previous run; the provider-side handle is gone, so fail it and let
    /// the normal path start a fresh build.
    fn abandon_stale_builds(
        &self,
        provider: &str,
        image: &str,
    ) -> Result<u64, StateStoreError> {
        let stale = self.store.query_image_builds(&ImageFilter {
            provider: Some(provider.to_string()),
            image_name: Some(image.to_string()),
            state: Some(ImageState::Building),
        })?;

        let mut abandoned = 0u64;
        for build in stale {
            let result = self.store.update_image_build_with(&build.id, |b| {
                if b.state != ImageState::Building {
                    return Ok(false);
                }
                b.state = ImageState::Error;
                b.last_error = Some("build abandoned by restart".to_string());
                Ok(true)
            });
            match result {
                Ok(_) => {
                    warn!(build_id = %build.id, "Abandoned stale image build");
                    abandoned += 1;
                }
                Err(e) => {
                    warn!(build_id = %build.id, error = %e, "Failed to abandon stale build");
                }
            }
        }
        Ok(abandoned)
    }

    /// Whether the pair needs a new build: no usable ready build, or the
    /// newest one has outlived its rebuild interval.
    fn needs_build(
        &self,
        snapshot: &ConfigSnapshot,
        provider: &str,
        image: &str,
    ) -> Result<bool, StateStoreError> {
        let Some(ready) = self.store.latest_ready_build(provider, image)? else {
            return Ok(true);
        };

        let Some(interval) = snapshot.rebuild_interval(image) else {
            return Ok(false);
        };
        let age = chrono::Utc::now().timestamp() - ready.created_at;
        if age >= 0 && (age as u64) >= interval.as_secs() {
            debug!(
                provider,
                image,
                build_id = %ready.id,
                age_secs = age,
                "Ready image build is due for refresh"
            );
            return Ok(true);
        }
        Ok(false)
    }
}

/// One spawned build: drives a single record to `ready` or `error`.
struct BuildTask {
    store: Arc<StateStore>,
    adapter: Arc<dyn ProviderAdapter>,
    config: Arc<BuilderConfig>,
    in_flight: Arc<Mutex<HashSet<(String, String)>>>,
    provider: String,
    image: String,
    record_id: String,
    shutdown: watch::Receiver<bool>,
}

impl BuildTask {
    async fn run(self) {
        self.drive().await;
        self.in_flight
            .lock()
            .expect("builder in-flight lock poisoned")
            .remove(&(self.provider.clone(), self.image.clone()));
    }

    async fn drive(&self) {
        let Some(provider_build_id) = self.start_build().await else {
            return;
        };

        match self.await_build(&provider_build_id).await {
            Some(snapshot_id) => self.finish_ready(&snapshot_id).await,
            None => {}
        }
    }

    /// Call `create_image`, retrying transient failures. Marks the record
    /// failed and returns `None` on permanent failure or exhaustion.
    async fn start_build(&self) -> Option<String> {
        let retry = &self.config.retry;

        for attempt in 0..retry.max_attempts {
            if *self.shutdown.borrow() {
                self.mark_failed("daemon shutdown during build start").await;
                return None;
            }

            match self.adapter.create_image(&self.image).await {
                Ok(provider_build_id) => return Some(provider_build_id),
                Err(ProviderError::Transient(reason)) => {
                    if attempt + 1 == retry.max_attempts {
                        self.mark_failed(&format!("build start retries exhausted: {reason}"))
                            .await;
                        return None;
                    }
                    warn!(
                        provider = %self.provider,
                        image = %self.image,
                        attempt,
                        reason = %reason,
                        "Transient image build start failure"
                    );
                    tokio::time::sleep(retry.backoff.delay(attempt)).await;
                }
                Err(ProviderError::Permanent(reason)) => {
                    self.mark_failed(&format!("build start failed: {reason}"))
                        .await;
                    return None;
                }
            }
        }
        None
    }

    /// Poll build status until ready, failed, or deadline. Returns the
    /// snapshot id on success.
    async fn await_build(&self, provider_build_id: &str) -> Option<String> {
        let deadline = Instant::now() + self.config.build_timeout;

        loop {
            if *self.shutdown.borrow() {
                self.mark_failed("daemon shutdown during build").await;
                return None;
            }
            if Instant::now() >= deadline {
                self.mark_failed("build timed out").await;
                return None;
            }

            match self.adapter.image_status(provider_build_id).await {
                Ok(ImageBuildStatus::Building) => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Ok(ImageBuildStatus::Ready { snapshot_id }) => return Some(snapshot_id),
                Ok(ImageBuildStatus::Error { reason }) => {
                    self.mark_failed(&format!("build failed: {reason}")).await;
                    return None;
                }
                Err(ProviderError::Transient(reason)) => {
                    debug!(
                        build_id = %self.record_id,
                        reason = %reason,
                        "Transient build status poll failure"
                    );
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(ProviderError::Permanent(reason)) => {
                    self.mark_failed(&format!("build status poll failed: {reason}"))
                        .await;
                    return None;
                }
            }
        }
    }

    /// CAS the record to `ready` and supersede older ready builds for the
    /// pair.
    async fn finish_ready(&self, snapshot_id: &str) {
        let result = self.store.update_image_build_with(&self.record_id, |b| {
            if b.state != ImageState::Building {
                return Ok(false);
            }
            b.state = ImageState::Ready;
            b.snapshot_id = Some(snapshot_id.to_string());
            b.last_error = None;
            Ok(true)
        });

        match result {
            Ok(build) if build.state == ImageState::Ready => {
                info!(
                    provider = %self.provider,
                    image = %self.image,
                    build_id = %self.record_id,
                    snapshot_id,
                    "Image build ready"
                );
            }
            Ok(build) => {
                debug!(
                    build_id = %self.record_id,
                    state = build.state.as_str(),
                    "Build moved on before completion"
                );
                return;
            }
            Err(e) => {
                error!(build_id = %self.record_id, error = %e, "Failed to persist ready build");
                return;
            }
        }

        self.supersede_older();
    }

    /// Flag strictly older non-superseded ready builds for the pair.
    /// A ready build newer than this one is left alone. Existing nodes
    /// keep their pinned build; cleanup retires it once nothing
    /// references it.
    fn supersede_older(&self) {
        let own = match self.store.get_image_build(&self.record_id) {
            Ok(Some(own)) => own,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Failed to read own build for supersede pass");
                return;
            }
        };
        let builds = match self.store.query_image_builds(&ImageFilter {
            provider: Some(self.provider.clone()),
            image_name: Some(self.image.clone()),
            state: Some(ImageState::Ready),
        }) {
            Ok(builds) => builds,
            Err(e) => {
                warn!(error = %e, "Failed to list ready builds for supersede pass");
                return;
            }
        };

        for build in builds {
            if build.id == self.record_id || build.superseded {
                continue;
            }
            if (build.created_at, build.id.as_str()) >= (own.created_at, own.id.as_str()) {
                continue;
            }
            let result = self.store.update_image_build_with(&build.id, |b| {
                if b.superseded {
                    return Ok(false);
                }
                b.superseded = true;
                Ok(true)
            });
            match result {
                Ok(_) => {
                    info!(
                        provider = %self.provider,
                        image = %self.image,
                        build_id = %build.id,
                        "Superseded image build"
                    );
                }
                Err(e) => {
                    warn!(build_id = %build.id, error = %e, "Failed to supersede build");
                }
            }
        }
    }

    /// CAS the record to `error` with a failure reason.
    async fn mark_failed(&self, reason: &str) {
        let result = self.store.update_image_build_with(&self.record_id, |b| {
            if b.state != ImageState::Building {
                return Ok(false);
            }
            b.state = ImageState::Error;
            b.last_error = Some(reason.to_string());
            Ok(true)
        });

        match result {
            Ok(_) => {
                warn!(
                    provider = %self.provider,
                    image = %self.image,
                    build_id = %self.record_id,
                    reason,
                    "Image build failed"
                );
            }
            Err(e) => {
                error!(build_id = %self.record_id, error = %e, "Failed to persist build error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_config_default() {
        let config = BuilderConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.build_timeout, Duration::from_secs(1800));
    }
}
