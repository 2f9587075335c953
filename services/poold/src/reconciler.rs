//! Demand reconciliation loop.
//!
//! Each tick compares live inventory in the state store against the
//! current config snapshot and converges the pool:
//! - Per label: outstanding work across every provider serving the label
//!   is summed once, and a positive deficit against `min_ready` becomes
//!   new `requested` nodes, persisted before they are handed to the
//!   launcher so a crash mid-cycle never loses demand. The deficit is
//!   spread across serving providers in binding order, each capped by
//!   `max_servers` minus that provider's current load.
//! - A negative deficit retires the oldest `ready` nodes first; `in_use`
//!   nodes are never touched.
//! - Nodes and image builds belonging to providers or labels that left
//!   the config are converted into deletion targets.
//!
//! The tick never blocks on a provider call: it only reads the store and
//! snapshot and enqueues work. Re-running a tick against an unchanged
//! store issues nothing, because `requested`/`building`/`deleting` nodes
//! already account for outstanding work.
//!
//! Store unavailability is tick-fatal: no safe partial progress can be
//! made without durable state, so the tick aborts and the loop retries
//! after backoff. Failures on individual entities are isolated and never
//! abort the rest of the pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ConfigSnapshot;
use crate::launcher::{NodeAction, ProviderRegistry};
use crate::model::{NodeRecord, NodeState};
use crate::state::{NodeFilter, StateStore, StateStoreError};

/// States that count as outstanding work toward a label's target.
const OUTSTANDING: [NodeState; 3] = [NodeState::Requested, NodeState::Building, NodeState::Ready];

/// Reconciler tuning knobs.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Interval between reconciliation ticks.
    pub tick_interval: Duration,

    /// Extra delay after a tick-fatal store failure.
    pub error_backoff: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            error_backoff: Duration::from_secs(5),
        }
    }
}

/// Counters from one reconciliation tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    pub launches_requested: u64,
    pub deletes_requested: u64,
    /// Labels skipped because no ready image build exists.
    pub labels_waiting_on_image: u64,
    /// Nodes torn down because their provider or label left the config.
    pub nodes_torn_down: u64,
}

impl ReconcileStats {
    /// True if the tick issued no actions at all.
    pub fn is_noop(&self) -> bool {
        self.launches_requested == 0 && self.deletes_requested == 0 && self.nodes_torn_down == 0
    }
}

/// The demand reconciler.
pub struct DemandReconciler {
    store: Arc<StateStore>,
    registry: Arc<ProviderRegistry>,
    config_rx: watch::Receiver<Arc<ConfigSnapshot>>,
    config: ReconcilerConfig,
}

impl DemandReconciler {
    pub fn new(
        store: Arc<StateStore>,
        registry: Arc<ProviderRegistry>,
        config_rx: watch::Receiver<Arc<ConfigSnapshot>>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config_rx,
            config,
        }
    }

    /// Run the reconciliation loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_interval_secs = self.config.tick_interval.as_secs(),
            "Starting demand reconciler"
        );

        if let Err(e) = self.recover() {
            error!(error = %e, "Startup recovery failed");
        }

        let mut interval = tokio::time::interval(self.config.tick_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick() {
                        Ok(stats) => {
                            if !stats.is_noop() {
                                info!(
                                    launches = stats.launches_requested,
                                    deletes = stats.deletes_requested,
                                    torn_down = stats.nodes_torn_down,
                                    "Reconciliation tick complete"
                                );
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Reconciliation tick failed, backing off");
                            tokio::time::sleep(self.config.error_backoff).await;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Demand reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Re-enqueue work that was in flight when the process last stopped.
    /// Demand is durable: `requested` rows are launches that were never
    /// picked up, `building` rows resume their boot poll, `deleting`
    /// rows resume deletion.
    pub fn recover(&self) -> Result<(), StateStoreError> {
        let snapshot = self.config_rx.borrow().clone();
        self.registry.sync(&snapshot);

        let mut launches = 0u64;
        let mut deletes = 0u64;

        for state in [NodeState::Requested, NodeState::Building] {
            let nodes = self.store.query_nodes(&NodeFilter {
                state: Some(state),
                ..Default::default()
            })?;
            for node in nodes {
                if self.registry.enqueue(
                    &node.provider,
                    NodeAction::Launch {
                        node_id: node.id.clone(),
                    },
                ) {
                    launches += 1;
                }
            }
        }

        let deleting = self.store.query_nodes(&NodeFilter {
            state: Some(NodeState::Deleting),
            ..Default::default()
        })?;
        for node in deleting {
            if self.registry.enqueue(
                &node.provider,
                NodeAction::Delete {
                    node_id: node.id.clone(),
                },
            ) {
                deletes += 1;
            }
        }

        if launches > 0 || deletes > 0 {
            info!(launches, deletes, "Recovered in-flight work from state store");
        }
        Ok(())
    }

    /// Run one reconciliation tick.
    pub fn tick(&self) -> Result<ReconcileStats, StateStoreError> {
        let snapshot = self.config_rx.borrow().clone();
        self.registry.sync(&snapshot);

        let mut stats = ReconcileStats::default();

        self.teardown_removed(&snapshot, &mut stats)?;

        let mut loads: HashMap<String, i64> = HashMap::new();
        for provider in &snapshot.providers {
            loads.insert(provider.name.clone(), self.store.provider_load(&provider.name)?);
        }

        // Labels in first-binding order, so earlier bindings claim shared
        // capacity first.
        let mut seen = HashSet::new();
        let mut label_order: Vec<&str> = Vec::new();
        for provider in &snapshot.providers {
            for label_name in &provider.labels {
                if seen.insert(label_name.as_str()) {
                    label_order.push(label_name);
                }
            }
        }

        for label_name in label_order {
            let Some(label) = snapshot.label(label_name) else {
                // Validated at snapshot load; defends against skew.
                warn!(label = %label_name, "Label missing from snapshot, skipping");
                continue;
            };
            let serving: Vec<_> = snapshot
                .providers
                .iter()
                .filter(|p| p.labels.iter().any(|l| l == label_name))
                .collect();

            // min_ready is a label-wide target: outstanding work on every
            // serving provider counts toward it exactly once.
            let mut outstanding = 0i64;
            for provider in &serving {
                outstanding += self
                    .store
                    .count_nodes(&provider.name, label_name, &OUTSTANDING)?;
            }
            let mut deficit = i64::from(label.min_ready) - outstanding;

            if deficit > 0 {
                let mut waiting_on_image = false;
                for provider in &serving {
                    if deficit == 0 {
                        break;
                    }
                    let load = loads.entry(provider.name.clone()).or_insert(0);
                    let capacity = i64::from(provider.max_servers) - *load;
                    if capacity <= 0 {
                        continue;
                    }
                    match self.launch_deficit(
                        &provider.name,
                        label_name,
                        &label.image,
                        deficit,
                        capacity,
                        &mut stats,
                    )? {
                        Some(launched) => {
                            *load += launched;
                            deficit -= launched;
                        }
                        None => waiting_on_image = true,
                    }
                }
                if deficit > 0 && waiting_on_image {
                    stats.labels_waiting_on_image += 1;
                }
            } else if deficit < 0 {
                self.retire_surplus(label_name, -deficit, &mut stats)?;
            }
        }

        Ok(stats)
    }

    /// Create and enqueue up to `min(deficit, capacity)` launches on one
    /// provider, pinning each node to the current ready image build.
    /// `None` means the provider has no ready build for the image.
    fn launch_deficit(
        &self,
        provider: &str,
        label: &str,
        image: &str,
        deficit: i64,
        capacity: i64,
        stats: &mut ReconcileStats,
    ) -> Result<Option<i64>, StateStoreError> {
        let Some(build) = self.store.latest_ready_build(provider, image)? else {
            debug!(provider, label, image, "No ready image build, deferring launches");
            return Ok(None);
        };

        let to_launch = deficit.min(capacity);
        if to_launch < deficit {
            debug!(
                provider,
                label,
                deficit,
                capacity,
                "Provider capacity limits launches this tick"
            );
        }

        for _ in 0..to_launch {
            let node = NodeRecord::new(provider, label, image, &build.id);
            // Persist demand before handing it to the launcher.
            self.store.insert_node(&node)?;
            self.registry.enqueue(
                provider,
                NodeAction::Launch {
                    node_id: node.id.clone(),
                },
            );
            stats.launches_requested += 1;
            debug!(provider, label, node_id = %node.id, "Requested node launch");
        }
        Ok(Some(to_launch))
    }

    /// Retire up to `surplus` ready nodes for a label, oldest first,
    /// across every provider serving it. Never touches `in_use` nodes.
    /// The retired node's server is live until its delete completes, so
    /// the slot it held stays occupied for the rest of this tick.
    fn retire_surplus(
        &self,
        label: &str,
        surplus: i64,
        stats: &mut ReconcileStats,
    ) -> Result<(), StateStoreError> {
        let ready = self.store.query_nodes(&NodeFilter {
            label: Some(label.to_string()),
            state: Some(NodeState::Ready),
            ..Default::default()
        })?;

        // query_nodes orders ascending by created_at: oldest retire first.
        for node in ready.into_iter().take(surplus as usize) {
            match self.mark_deleting(&node.id) {
                Ok(true) => {
                    stats.deletes_requested += 1;
                    info!(provider = %node.provider, label, node_id = %node.id, "Retiring surplus node");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Failed to retire node, skipping this cycle");
                }
            }
        }
        Ok(())
    }

    /// Convert every node and image build belonging to a removed provider
    /// or label into a deletion target. Nothing is silently abandoned.
    fn teardown_removed(
        &self,
        snapshot: &ConfigSnapshot,
        stats: &mut ReconcileStats,
    ) -> Result<(), StateStoreError> {
        let nodes = self.store.query_nodes(&NodeFilter::default())?;
        for node in nodes {
            if snapshot.serves(&node.provider, &node.label) {
                continue;
            }
            if matches!(node.state, NodeState::Deleting | NodeState::Gone) {
                continue;
            }

            match self.mark_deleting(&node.id) {
                Ok(true) => {
                    stats.nodes_torn_down += 1;
                    info!(
                        provider = %node.provider,
                        label = %node.label,
                        node_id = %node.id,
                        "Tearing down node for removed config entity"
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Failed to tear down node, skipping this cycle");
                }
            }
        }

        let pairs = snapshot.provider_image_pairs();
        let builds = self.store.query_image_builds(&Default::default())?;
        for build in builds {
            let pair = (build.provider.clone(), build.image_name.clone());
            if pairs.contains(&pair) || build.superseded {
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
                    debug!(
                        provider = %build.provider,
                        image = %build.image_name,
                        build_id = %build.id,
                        "Superseding image build for removed config entity"
                    );
                }
                Err(e) => {
                    warn!(build_id = %build.id, error = %e, "Failed to supersede image build");
                }
            }
        }

        Ok(())
    }

    /// CAS a node into `deleting` and enqueue the delete. Returns true if
    /// this call performed the transition.
    fn mark_deleting(&self, node_id: &str) -> Result<bool, StateStoreError> {
        let node = self.store.update_node_with(node_id, |n| {
            if n.state == NodeState::Deleting || !n.state.can_transition_to(NodeState::Deleting) {
                return Ok(false);
            }
            n.state = NodeState::Deleting;
            Ok(true)
        })?;

        if node.state != NodeState::Deleting {
            return Ok(false);
        }
        self.registry.enqueue(
            &node.provider,
            NodeAction::Delete {
                node_id: node_id.to_string(),
            },
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciler_config_default() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_stats_noop() {
        let stats = ReconcileStats::default();
        assert!(stats.is_noop());

        let stats = ReconcileStats {
            launches_requested: 1,
            ..Default::default()
        };
        assert!(!stats.is_noop());
    }
}
