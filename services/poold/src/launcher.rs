//! Per-provider node launcher.
//!
//! Each configured provider gets one launcher task owning an action queue
//! and a semaphore of `max_servers` permits. Launch and delete actions run
//! as independent spawned tasks, each holding one permit, so a slow or
//! failing node never blocks the rest of the pool and the provider never
//! sees more concurrent work than its cap.
//!
//! A launch drives one node through `requested -> building -> ready`:
//! create the server (transient failures retried under the backoff
//! policy), persist the external id, poll for boot under a deadline, then
//! flip to ready, re-checking first that the pinned image build is still
//! ready. Every state write goes through the store's CAS contract; a
//! racing writer forces a re-read and the loser backs off.
//!
//! Cancellation (provider removed from config, or daemon shutdown) is
//! checked before every blocking provider call.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use warmpool_provider::{ProviderAdapter, ProviderError, ServerStatus};

use crate::backoff::RetryPolicy;
use crate::model::{ImageState, NodeState};
use crate::state::{StateStore, StateStoreError};

/// Work item for a provider's launcher queue.
#[derive(Debug, Clone)]
pub enum NodeAction {
    /// Drive a `requested` (or resumed `building`) node to `ready`.
    Launch { node_id: String },
    /// Drive a `deleting` node to `gone`.
    Delete { node_id: String },
}

/// Launcher tuning knobs.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Retry policy for transient provider failures.
    pub retry: RetryPolicy,

    /// Interval between server status polls.
    pub poll_interval: Duration,

    /// Maximum time a node may sit in `building` before it is treated as
    /// a timeout and moved to `error`.
    pub boot_timeout: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(2),
            boot_timeout: Duration::from_secs(600),
        }
    }
}

/// Handle to one provider's launcher: the action queue plus the
/// cancellation signal raised when the provider leaves the config.
pub struct ProviderHandle {
    pub provider: String,
    actions: mpsc::Sender<NodeAction>,
    cancel_tx: watch::Sender<bool>,
}

impl ProviderHandle {
    /// Enqueue an action. Returns false if the launcher has stopped.
    pub fn enqueue(&self, action: NodeAction) -> bool {
        match self.actions.try_send(action) {
            Ok(()) => true,
            Err(e) => {
                warn!(provider = %self.provider, error = %e, "Failed to enqueue node action");
                false
            }
        }
    }

    /// Signal cancellation: in-flight tasks stop at their next checkpoint.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// Launcher for one provider.
pub struct NodeLauncher {
    worker: LaunchWorker,
}

/// Shared context cloned into each spawned launch/delete task.
#[derive(Clone)]
struct LaunchWorker {
    provider: String,
    adapter: Arc<dyn ProviderAdapter>,
    store: Arc<StateStore>,
    config: Arc<LauncherConfig>,
    cancel: watch::Receiver<bool>,
}

impl NodeLauncher {
    /// Spawn the launcher task for a provider and return its handle.
    pub fn spawn(
        provider: &str,
        max_servers: u32,
        adapter: Arc<dyn ProviderAdapter>,
        store: Arc<StateStore>,
        config: LauncherConfig,
        shutdown: watch::Receiver<bool>,
    ) -> ProviderHandle {
        let (action_tx, action_rx) = mpsc::channel(256);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let launcher = NodeLauncher {
            worker: LaunchWorker {
                provider: provider.to_string(),
                adapter,
                store,
                config: Arc::new(config),
                cancel: cancel_rx,
            },
        };

        let semaphore = Arc::new(Semaphore::new(max_servers as usize));
        let name = provider.to_string();
        tokio::spawn(async move {
            launcher.run(action_rx, semaphore, shutdown).await;
        });

        info!(provider = %name, max_servers, "Started node launcher");

        ProviderHandle {
            provider: name,
            actions: action_tx,
            cancel_tx,
        }
    }

    /// Dispatch loop: pull actions off the queue, run each as its own
    /// task bounded by the provider's permit pool.
    async fn run(
        self,
        mut actions: mpsc::Receiver<NodeAction>,
        semaphore: Arc<Semaphore>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                action = actions.recv() => {
                    let Some(action) = action else {
                        debug!(provider = %self.worker.provider, "Action queue closed");
                        break;
                    };

                    let permit = match Arc::clone(&semaphore).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let worker = self.worker.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        match action {
                            NodeAction::Launch { node_id } => worker.launch(&node_id).await,
                            NodeAction::Delete { node_id } => worker.delete(&node_id).await,
                        }
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(provider = %self.worker.provider, "Node launcher shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl LaunchWorker {
    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Drive one node to `ready`. Side effects are scoped to this node's
    /// record; any failure marks the node `error` and returns.
    async fn launch(&self, node_id: &str) {
        let node = match self.store.get_node(node_id) {
            Ok(Some(node)) => node,
            Ok(None) => {
                debug!(node_id, "Launch target no longer exists");
                return;
            }
            Err(e) => {
                error!(node_id, error = %e, "Failed to read node for launch");
                return;
            }
        };

        match node.state {
            NodeState::Requested => {}
            // Crash recovery: a building node with an external id resumes
            // at the boot poll.
            NodeState::Building if node.external_id.is_some() => {
                let server_id = node.external_id.clone().unwrap_or_default();
                self.await_boot(node_id, &server_id).await;
                return;
            }
            other => {
                debug!(node_id, state = other.as_str(), "Skipping launch for non-requested node");
                return;
            }
        }

        if self.is_cancelled() {
            debug!(node_id, "Launch cancelled before server create");
            return;
        }

        // Image gating: the pinned build must be ready before boot.
        let snapshot_id = match self.ready_snapshot(&node.build_id) {
            Some(snapshot_id) => snapshot_id,
            None => {
                self.mark_error(node_id, "pinned image build is not ready").await;
                return;
            }
        };

        let Some(server_id) = self.create_with_retries(node_id, &snapshot_id, &node.label).await
        else {
            return;
        };

        // Persist building + external id. If the node was marked deleting
        // while we were creating, release the server again.
        let updated = self.store.update_node_with(node_id, |n| {
            if n.state != NodeState::Requested {
                return Ok(false);
            }
            n.state = NodeState::Building;
            n.external_id = Some(server_id.clone());
            Ok(true)
        });

        match updated {
            Ok(node) if node.state == NodeState::Building => {}
            Ok(node) => {
                info!(
                    node_id,
                    state = node.state.as_str(),
                    "Node no longer wants launching, releasing server"
                );
                let _ = self.adapter.delete_server(&server_id).await;
                return;
            }
            Err(e) => {
                warn!(node_id, error = %e, "Failed to persist building state");
                let _ = self.adapter.delete_server(&server_id).await;
                return;
            }
        }

        self.await_boot(node_id, &server_id).await;
    }

    /// Call `create_server`, retrying transient failures under the
    /// configured policy. Marks the node `error` and returns `None` on
    /// permanent failure or exhaustion.
    async fn create_with_retries(
        &self,
        node_id: &str,
        snapshot_id: &str,
        label: &str,
    ) -> Option<String> {
        let retry = &self.config.retry;

        for attempt in 0..retry.max_attempts {
            if self.is_cancelled() {
                debug!(node_id, "Launch cancelled during create retries");
                return None;
            }

            match self.adapter.create_server(snapshot_id, label).await {
                Ok(server_id) => {
                    info!(
                        provider = %self.provider,
                        node_id,
                        server_id = %server_id,
                        "Created server"
                    );
                    return Some(server_id);
                }
                Err(ProviderError::Transient(reason)) => {
                    let last = attempt + 1 == retry.max_attempts;
                    warn!(
                        node_id,
                        attempt,
                        reason = %reason,
                        "Transient create failure"
                    );
                    if last {
                        self.mark_error(
                            node_id,
                            &format!("create retries exhausted: {reason}"),
                        )
                        .await;
                        return None;
                    }
                    tokio::time::sleep(retry.backoff.delay(attempt)).await;
                }
                Err(ProviderError::Permanent(reason)) => {
                    warn!(node_id, reason = %reason, "Permanent create failure");
                    self.mark_error(node_id, &format!("create failed: {reason}"))
                        .await;
                    return None;
                }
            }
        }
        None
    }

    /// Poll server status until active, error, or boot deadline.
    async fn await_boot(&self, node_id: &str, server_id: &str) {
        let deadline = Instant::now() + self.config.boot_timeout;

        loop {
            if self.is_cancelled() {
                debug!(node_id, "Boot wait cancelled");
                return;
            }
            if Instant::now() >= deadline {
                // The server may still come up; cleanup verifies the leak.
                self.mark_error(node_id, "timed out waiting for boot").await;
                return;
            }

            match self.adapter.server_status(server_id).await {
                Ok(ServerStatus::Active) => break,
                Ok(ServerStatus::Booting) => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Ok(ServerStatus::Error) => {
                    let _ = self.adapter.delete_server(server_id).await;
                    self.mark_error(node_id, "server entered error state").await;
                    return;
                }
                Ok(ServerStatus::Missing) => {
                    self.mark_error(node_id, "server disappeared during boot").await;
                    return;
                }
                Err(ProviderError::Transient(reason)) => {
                    debug!(node_id, reason = %reason, "Transient status poll failure");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(ProviderError::Permanent(reason)) => {
                    self.mark_error(node_id, &format!("status poll failed: {reason}"))
                        .await;
                    return;
                }
            }
        }

        // The pinned build must still be ready at the moment the node
        // becomes ready. Builds are only retired once unreferenced, and
        // this node references its build, so the check cannot race with
        // image cleanup.
        if self.ready_snapshot_state(node_id).is_none() {
            self.mark_error(node_id, "pinned image build lost readiness").await;
            return;
        }

        let result = self.store.update_node_with(node_id, |n| {
            if n.state != NodeState::Building {
                return Ok(false);
            }
            n.state = NodeState::Ready;
            n.last_error = None;
            Ok(true)
        });

        match result {
            Ok(node) if node.state == NodeState::Ready => {
                info!(
                    provider = %self.provider,
                    node_id,
                    server_id,
                    "Node ready"
                );
            }
            Ok(node) => {
                debug!(node_id, state = node.state.as_str(), "Node moved on during boot");
            }
            Err(e) => {
                warn!(node_id, error = %e, "Failed to persist ready state");
            }
        }
    }

    /// Drive one `deleting` node to `gone`.
    async fn delete(&self, node_id: &str) {
        let node = match self.store.update_node_with(node_id, |n| {
            if n.state == NodeState::Deleting {
                return Ok(false);
            }
            if !n.state.can_transition_to(NodeState::Deleting) {
                return Ok(false);
            }
            n.state = NodeState::Deleting;
            Ok(true)
        }) {
            Ok(node) => node,
            Err(StateStoreError::NotFound(_)) => return,
            Err(e) => {
                error!(node_id, error = %e, "Failed to read node for delete");
                return;
            }
        };

        if node.state == NodeState::Gone {
            return;
        }
        if node.state != NodeState::Deleting {
            debug!(node_id, state = node.state.as_str(), "Skipping delete");
            return;
        }

        if let Some(server_id) = &node.external_id {
            let retry = &self.config.retry;
            for attempt in 0..retry.max_attempts {
                match self.adapter.delete_server(server_id).await {
                    // "Already gone" is success per the adapter contract.
                    Ok(()) => break,
                    Err(ProviderError::Transient(reason)) => {
                        if attempt + 1 == retry.max_attempts {
                            // Leave the node in deleting; cleanup retires
                            // stale deleting nodes after the grace period.
                            warn!(
                                node_id,
                                reason = %reason,
                                "Delete retries exhausted, leaving for cleanup"
                            );
                            return;
                        }
                        tokio::time::sleep(retry.backoff.delay(attempt)).await;
                    }
                    Err(ProviderError::Permanent(reason)) => {
                        warn!(node_id, reason = %reason, "Permanent delete failure");
                        return;
                    }
                }
            }
        }

        let result = self.store.update_node_with(node_id, |n| {
            if n.state != NodeState::Deleting {
                return Ok(false);
            }
            n.state = NodeState::Gone;
            Ok(true)
        });

        match result {
            Ok(_) => {
                info!(provider = %self.provider, node_id, "Node deleted");
            }
            Err(e) => {
                warn!(node_id, error = %e, "Failed to persist gone state");
            }
        }
    }

    /// Snapshot id of the node's pinned build, if that build is ready.
    fn ready_snapshot(&self, build_id: &str) -> Option<String> {
        match self.store.get_image_build(build_id) {
            Ok(Some(build)) if build.state == ImageState::Ready => build.snapshot_id,
            Ok(_) => None,
            Err(e) => {
                warn!(build_id, error = %e, "Failed to read image build");
                None
            }
        }
    }

    /// Like [`Self::ready_snapshot`] but starting from the node id.
    fn ready_snapshot_state(&self, node_id: &str) -> Option<String> {
        let build_id = match self.store.get_node(node_id) {
            Ok(Some(node)) => node.build_id,
            _ => return None,
        };
        self.ready_snapshot(&build_id)
    }

    /// CAS the node into `error` with a failure reason, if its current
    /// state allows it.
    async fn mark_error(&self, node_id: &str, reason: &str) {
        let result = self.store.update_node_with(node_id, |n| {
            if !n.state.can_transition_to(NodeState::Error) || n.state == NodeState::Error {
                return Ok(false);
            }
            n.state = NodeState::Error;
            n.last_error = Some(reason.to_string());
            Ok(true)
        });

        match result {
            Ok(_) => {
                warn!(provider = %self.provider, node_id, reason, "Node failed");
            }
            Err(StateStoreError::NotFound(_)) => {}
            Err(e) => {
                error!(node_id, error = %e, "Failed to persist error state");
            }
        }
    }
}

// =============================================================================
// Provider registry
// =============================================================================

/// Builds an adapter for a configured provider, keyed off its `driver`.
pub type AdapterFactory =
    Box<dyn Fn(&crate::config::Provider) -> anyhow::Result<Arc<dyn ProviderAdapter>> + Send + Sync>;

struct RegistryInner {
    handles: std::collections::HashMap<String, ProviderHandle>,
    adapters: std::collections::HashMap<String, Arc<dyn ProviderAdapter>>,
    /// Providers cancelled because they left the config. Their adapters
    /// are retained so cleanup can still delete external resources.
    cancelled: std::collections::HashSet<String>,
}

/// Registry of per-provider launchers and adapters.
///
/// `sync` is called at the start of each reconciliation tick: launchers
/// are spawned for providers new to the snapshot and cancelled for
/// providers that left it. A cancelled provider's launcher keeps
/// draining delete actions (only launches observe the cancel signal), so
/// teardown work is never silently abandoned.
pub struct ProviderRegistry {
    store: Arc<StateStore>,
    launcher_config: LauncherConfig,
    shutdown: watch::Receiver<bool>,
    factory: AdapterFactory,
    inner: std::sync::Mutex<RegistryInner>,
}

impl ProviderRegistry {
    pub fn new(
        store: Arc<StateStore>,
        launcher_config: LauncherConfig,
        factory: AdapterFactory,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            launcher_config,
            shutdown,
            factory,
            inner: std::sync::Mutex::new(RegistryInner {
                handles: std::collections::HashMap::new(),
                adapters: std::collections::HashMap::new(),
                cancelled: std::collections::HashSet::new(),
            }),
        }
    }

    /// Bring the launcher set in line with a config snapshot.
    pub fn sync(&self, snapshot: &crate::config::ConfigSnapshot) {
        let mut inner = self.inner.lock().expect("provider registry lock poisoned");

        for provider in &snapshot.providers {
            let known = inner.adapters.contains_key(&provider.name);
            let was_cancelled = inner.cancelled.contains(&provider.name);
            if known && !was_cancelled {
                continue;
            }

            let adapter = if known {
                Arc::clone(&inner.adapters[&provider.name])
            } else {
                match (self.factory)(provider) {
                    Ok(adapter) => adapter,
                    Err(e) => {
                        warn!(provider = %provider.name, error = %e, "Failed to build provider adapter");
                        continue;
                    }
                }
            };

            let handle = NodeLauncher::spawn(
                &provider.name,
                provider.max_servers,
                Arc::clone(&adapter),
                Arc::clone(&self.store),
                self.launcher_config.clone(),
                self.shutdown.clone(),
            );
            inner.adapters.insert(provider.name.clone(), adapter);
            inner.handles.insert(provider.name.clone(), handle);
            inner.cancelled.remove(&provider.name);
        }

        let removed: Vec<String> = inner
            .handles
            .keys()
            .filter(|name| snapshot.provider(name).is_none() && !inner.cancelled.contains(*name))
            .cloned()
            .collect();
        for name in removed {
            info!(provider = %name, "Provider removed from config, cancelling in-flight launches");
            if let Some(handle) = inner.handles.get(&name) {
                handle.cancel();
            }
            inner.cancelled.insert(name);
        }
    }

    /// Enqueue an action onto a provider's launcher queue.
    pub fn enqueue(&self, provider: &str, action: NodeAction) -> bool {
        let inner = self.inner.lock().expect("provider registry lock poisoned");
        match inner.handles.get(provider) {
            Some(handle) => handle.enqueue(action),
            None => {
                debug!(provider, "No launcher for provider, dropping action");
                false
            }
        }
    }

    /// Adapter for a provider, including providers removed from config
    /// (cleanup still needs them to delete external resources).
    pub fn adapter(&self, provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
        let inner = self.inner.lock().expect("provider registry lock poisoned");
        inner.adapters.get(provider).map(Arc::clone)
    }

    /// All known (provider, adapter) pairs.
    pub fn adapters(&self) -> Vec<(String, Arc<dyn ProviderAdapter>)> {
        let inner = self.inner.lock().expect("provider registry lock poisoned");
        inner
            .adapters
            .iter()
            .map(|(name, adapter)| (name.clone(), Arc::clone(adapter)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launcher_config_default() {
        let config = LauncherConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.boot_timeout, Duration::from_secs(600));
        assert_eq!(config.retry.max_attempts, 5);
    }
}
