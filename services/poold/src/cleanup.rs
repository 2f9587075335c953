//! Cleanup and garbage collection.
//!
//! A periodic scan that finishes what the fast paths could not:
//! - `error` nodes are moved through `deleting` to `gone`, releasing
//!   their external server if one exists.
//! - `deleting` nodes whose launcher delete failed get their external
//!   delete retried here until it sticks.
//! - `gone` records older than the grace period are pruned from the
//!   store.
//! - Orphaned servers (live on the provider but unknown to the store)
//!   are deleted. A server must show up as an orphan in two consecutive
//!   scans before it is touched, so a create whose external id has not
//!   been persisted yet is never reaped.
//! - Active nodes whose server vanished from the provider are retired,
//!   after a direct status check confirms the listing.
//! - Superseded image builds with zero node references are retired:
//!   snapshot deleted on the provider, record driven to `gone`, then
//!   pruned. Failed builds are retired the same way after the grace
//!   period. A build still referenced by any non-`gone` node is never
//!   touched, and an unsuperseded ready build never qualifies, so the
//!   sole usable build of an active pair survives.
//!
//! Every action here is idempotent and isolated per entity; one failure
//! never aborts the rest of the scan.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use warmpool_provider::ServerStatus;

use crate::launcher::ProviderRegistry;
use crate::model::{ImageState, NodeState};
use crate::state::{ImageFilter, NodeFilter, StateStore, StateStoreError};

/// Cleanup tuning knobs.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Interval between cleanup scans.
    pub tick_interval: Duration,

    /// Minimum time a record must sit in a terminal state before it is
    /// pruned (or, for failed builds, retired). Measured from the last
    /// state change, not from creation.
    pub grace_period: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            grace_period: Duration::from_secs(300),
        }
    }
}

/// Counters from one cleanup scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    pub nodes_retired: u64,
    pub records_pruned: u64,
    pub orphans_deleted: u64,
    pub builds_retired: u64,
}

/// The cleanup scanner.
pub struct Cleanup {
    store: Arc<StateStore>,
    registry: Arc<ProviderRegistry>,
    config: CleanupConfig,
    /// Orphan candidates from the previous scan, per provider.
    suspected_orphans: Mutex<HashMap<String, HashSet<String>>>,
}

impl Cleanup {
    pub fn new(
        store: Arc<StateStore>,
        registry: Arc<ProviderRegistry>,
        config: CleanupConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            suspected_orphans: Mutex::new(HashMap::new()),
        }
    }

    /// Run the cleanup loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_interval_secs = self.config.tick_interval.as_secs(),
            grace_period_secs = self.config.grace_period.as_secs(),
            "Starting cleanup scanner"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(stats) => {
                            if stats != CleanupStats::default() {
                                info!(
                                    retired = stats.nodes_retired,
                                    pruned = stats.records_pruned,
                                    orphans = stats.orphans_deleted,
                                    builds = stats.builds_retired,
                                    "Cleanup scan complete"
                                );
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Cleanup scan failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Cleanup scanner shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run one cleanup scan.
    pub async fn tick(&self) -> Result<CleanupStats, StateStoreError> {
        let mut stats = CleanupStats::default();

        self.retire_failed_nodes(&mut stats).await?;
        self.finish_stuck_deletes(&mut stats).await?;
        self.prune_gone_records(&mut stats)?;
        self.reap_orphans(&mut stats).await?;
        self.retire_image_builds(&mut stats).await?;

        Ok(stats)
    }

    /// Move `error` nodes past the grace period through `deleting` to
    /// `gone`, releasing their external server.
    async fn retire_failed_nodes(&self, stats: &mut CleanupStats) -> Result<(), StateStoreError> {
        let cutoff = chrono::Utc::now().timestamp() - self.config.grace_period.as_secs() as i64;
        let failed = self.store.query_nodes(&NodeFilter {
            state: Some(NodeState::Error),
            ..Default::default()
        })?;

        for node in failed {
            // Grace runs from when the node entered error, not from birth.
            if node.updated_at > cutoff {
                continue;
            }
            let claimed = self.store.update_node_with(&node.id, |n| {
                if n.state != NodeState::Error {
                    return Ok(false);
                }
                n.state = NodeState::Deleting;
                Ok(true)
            });
            let node = match claimed {
                Ok(n) if n.state == NodeState::Deleting => n,
                Ok(_) => continue,
                Err(StateStoreError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Failed to claim error node");
                    continue;
                }
            };

            if self.delete_external_server(&node.provider, node.external_id.as_deref()).await {
                self.finish_gone(&node.id);
                stats.nodes_retired += 1;
                info!(
                    provider = %node.provider,
                    node_id = %node.id,
                    reason = node.last_error.as_deref().unwrap_or("unknown"),
                    "Retired failed node"
                );
            }
        }
        Ok(())
    }

    /// Retry the external delete for nodes stuck in `deleting`.
    async fn finish_stuck_deletes(&self, stats: &mut CleanupStats) -> Result<(), StateStoreError> {
        let stuck = self.store.query_nodes(&NodeFilter {
            state: Some(NodeState::Deleting),
            ..Default::default()
        })?;

        for node in stuck {
            if self.delete_external_server(&node.provider, node.external_id.as_deref()).await {
                self.finish_gone(&node.id);
                stats.nodes_retired += 1;
                debug!(node_id = %node.id, "Finished stuck delete");
            }
        }
        Ok(())
    }

    /// Best-effort external server delete. True when the server is
    /// confirmed gone (including "never existed").
    async fn delete_external_server(&self, provider: &str, server_id: Option<&str>) -> bool {
        let Some(server_id) = server_id else {
            return true;
        };
        let Some(adapter) = self.registry.adapter(provider) else {
            warn!(provider, server_id, "No adapter for provider, cannot delete server");
            return false;
        };

        match adapter.delete_server(server_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(provider, server_id, error = %e, "Server delete failed, will retry next scan");
                false
            }
        }
    }

    /// CAS a `deleting` node to `gone`.
    fn finish_gone(&self, node_id: &str) {
        let result = self.store.update_node_with(node_id, |n| {
            if n.state != NodeState::Deleting {
                return Ok(false);
            }
            n.state = NodeState::Gone;
            Ok(true)
        });
        if let Err(e) = result {
            warn!(node_id, error = %e, "Failed to persist gone state");
        }
    }

    /// Prune `gone` node records past the grace period.
    fn prune_gone_records(&self, stats: &mut CleanupStats) -> Result<(), StateStoreError> {
        let cutoff = chrono::Utc::now().timestamp() - self.config.grace_period.as_secs() as i64;

        let gone = self.store.query_nodes(&NodeFilter {
            state: Some(NodeState::Gone),
            ..Default::default()
        })?;

        for node in gone {
            if node.updated_at > cutoff {
                continue;
            }
            self.store.delete_node(&node.id)?;
            stats.records_pruned += 1;
            debug!(node_id = %node.id, "Pruned node record");
        }
        Ok(())
    }

    /// Reconcile each provider's server listing against the store, both
    /// directions: servers the store does not know are deleted (after
    /// two consecutive sightings, so a create whose external id has not
    /// been persisted yet is never reaped), and active nodes whose
    /// server vanished are forced through `deleting` to `gone`.
    async fn reap_orphans(&self, stats: &mut CleanupStats) -> Result<(), StateStoreError> {
        for (provider, adapter) in self.registry.adapters() {
            let listed: HashSet<String> = match adapter.list_servers().await {
                Ok(listed) => listed.into_iter().collect(),
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Failed to list servers");
                    continue;
                }
            };

            let nodes = self.store.query_nodes(&NodeFilter::provider(&provider))?;
            let known: HashSet<String> = nodes
                .iter()
                .filter(|n| n.state != NodeState::Gone)
                .filter_map(|n| n.external_id.clone())
                .collect();

            for node in &nodes {
                if !node.state.is_active() {
                    continue;
                }
                let Some(server_id) = &node.external_id else {
                    continue;
                };
                if listed.contains(server_id) {
                    continue;
                }
                // Confirm directly before declaring the server lost.
                match adapter.server_status(server_id).await {
                    Ok(ServerStatus::Missing) => {}
                    _ => continue,
                }

                let claimed = self.store.update_node_with(&node.id, |n| {
                    if !n.state.can_transition_to(NodeState::Deleting)
                        || n.state == NodeState::Deleting
                    {
                        return Ok(false);
                    }
                    n.state = NodeState::Deleting;
                    n.last_error = Some("server disappeared".to_string());
                    Ok(true)
                });
                match claimed {
                    Ok(n) if n.state == NodeState::Deleting => {
                        self.finish_gone(&node.id);
                        stats.nodes_retired += 1;
                        warn!(
                            provider = %provider,
                            node_id = %node.id,
                            server_id = %server_id,
                            "Server vanished, retired node"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(node_id = %node.id, error = %e, "Failed to retire vanished node");
                    }
                }
            }

            let candidates: HashSet<String> = listed
                .into_iter()
                .filter(|id| !known.contains(id))
                .collect();

            let confirmed: Vec<String> = {
                let mut suspected = self
                    .suspected_orphans
                    .lock()
                    .expect("cleanup orphan lock poisoned");
                let previous = suspected.insert(provider.clone(), candidates.clone());
                match previous {
                    Some(previous) => candidates
                        .iter()
                        .filter(|id| previous.contains(*id))
                        .cloned()
                        .collect(),
                    None => Vec::new(),
                }
            };

            for server_id in confirmed {
                match adapter.delete_server(&server_id).await {
                    Ok(()) => {
                        stats.orphans_deleted += 1;
                        warn!(
                            provider = %provider,
                            server_id = %server_id,
                            "Deleted orphaned server"
                        );
                    }
                    Err(e) => {
                        warn!(
                            provider = %provider,
                            server_id = %server_id,
                            error = %e,
                            "Failed to delete orphaned server"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Retire image builds nothing can use anymore: superseded builds
    /// with zero references, failed builds past the grace period, and
    /// half-deleted builds from earlier scans.
    async fn retire_image_builds(&self, stats: &mut CleanupStats) -> Result<(), StateStoreError> {
        let cutoff = chrono::Utc::now().timestamp() - self.config.grace_period.as_secs() as i64;
        let builds = self.store.query_image_builds(&ImageFilter::default())?;

        for build in builds {
            let retirable = match build.state {
                ImageState::Ready => build.superseded,
                ImageState::Error => build.superseded || build.updated_at <= cutoff,
                ImageState::Deleting => true,
                ImageState::Building | ImageState::Gone => false,
            };
            if !retirable {
                continue;
            }
            if self.store.count_build_refs(&build.id)? > 0 {
                debug!(build_id = %build.id, "Build still referenced, deferring retirement");
                continue;
            }

            if build.state != ImageState::Deleting {
                let claimed = self.store.update_image_build_with(&build.id, |b| {
                    if !b.state.can_transition_to(ImageState::Deleting)
                        || b.state == ImageState::Deleting
                    {
                        return Ok(false);
                    }
                    b.state = ImageState::Deleting;
                    Ok(true)
                });
                match claimed {
                    Ok(b) if b.state == ImageState::Deleting => {}
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(build_id = %build.id, error = %e, "Failed to claim build for retirement");
                        continue;
                    }
                }
            }

            if let Some(snapshot_id) = &build.snapshot_id {
                let Some(adapter) = self.registry.adapter(&build.provider) else {
                    warn!(
                        provider = %build.provider,
                        build_id = %build.id,
                        "No adapter for provider, cannot delete snapshot"
                    );
                    continue;
                };
                if let Err(e) = adapter.delete_image(snapshot_id).await {
                    warn!(
                        build_id = %build.id,
                        snapshot_id = %snapshot_id,
                        error = %e,
                        "Snapshot delete failed, will retry next scan"
                    );
                    continue;
                }
            }

            let finished = self.store.update_image_build_with(&build.id, |b| {
                if b.state != ImageState::Deleting {
                    return Ok(false);
                }
                b.state = ImageState::Gone;
                Ok(true)
            });
            match finished {
                Ok(_) => {
                    self.store.delete_image_build(&build.id)?;
                    stats.builds_retired += 1;
                    info!(
                        provider = %build.provider,
                        image = %build.image_name,
                        build_id = %build.id,
                        "Retired image build"
                    );
                }
                Err(e) => {
                    warn!(build_id = %build.id, error = %e, "Failed to finish build retirement");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_config_default() {
        let config = CleanupConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(60));
        assert_eq!(config.grace_period, Duration::from_secs(300));
    }
}
