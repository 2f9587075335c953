//! Integration tests for the image build pipeline.
//!
//! These drive the builder tick-by-tick against mock providers and
//! verify build gating, refresh, supersede, and retirement behavior.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use poold::backoff::{BackoffPolicy, RetryPolicy};
use poold::builder::{BuilderConfig, ImageBuilder};
use poold::cleanup::{Cleanup, CleanupConfig};
use poold::config::ConfigSnapshot;
use poold::launcher::{LauncherConfig, ProviderRegistry};
use poold::model::{ImageBuildRecord, ImageState, NodeRecord, NodeState};
use poold::reconciler::{DemandReconciler, ReconcilerConfig};
use poold::state::{ImageFilter, StateStore};
use warmpool_provider::MockProvider;

const POOL: &str = r#"
    [[providers]]
    name = "cloud-a"
    driver = "mock"
    max_servers = 10
    labels = ["small"]

    [[labels]]
    name = "small"
    min_ready = 1
    image = "ci-base"

    [[images]]
    name = "ci-base"
    rebuild_interval_secs = 86400
"#;

struct Harness {
    store: Arc<StateStore>,
    registry: Arc<ProviderRegistry>,
    provider: Arc<MockProvider>,
    builder: ImageBuilder,
    shutdown_rx: watch::Receiver<bool>,
    _shutdown_tx: watch::Sender<bool>,
    snapshot_rx: watch::Receiver<Arc<ConfigSnapshot>>,
    _snapshot_tx: watch::Sender<Arc<ConfigSnapshot>>,
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        backoff: BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            jitter: 0.0,
        },
    }
}

fn harness_with(pool_toml: &str, provider: Arc<MockProvider>) -> Harness {
    let store = Arc::new(StateStore::open_in_memory().unwrap());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let factory_provider = Arc::clone(&provider);
    let registry = Arc::new(ProviderRegistry::new(
        Arc::clone(&store),
        LauncherConfig {
            retry: fast_retry(),
            poll_interval: Duration::from_millis(5),
            boot_timeout: Duration::from_secs(5),
        },
        Box::new(move |_| Ok(Arc::clone(&factory_provider) as _)),
        shutdown_rx.clone(),
    ));

    let snapshot = Arc::new(ConfigSnapshot::from_toml(pool_toml, 1).unwrap());
    let (snapshot_tx, snapshot_rx) = watch::channel(snapshot.clone());
    registry.sync(&snapshot);

    let builder = ImageBuilder::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        snapshot_rx.clone(),
        BuilderConfig {
            tick_interval: Duration::from_millis(10),
            retry: fast_retry(),
            poll_interval: Duration::from_millis(5),
            build_timeout: Duration::from_secs(5),
        },
    );

    Harness {
        store,
        registry,
        provider,
        builder,
        shutdown_rx,
        _shutdown_tx: shutdown_tx,
        snapshot_rx,
        _snapshot_tx: snapshot_tx,
    }
}

fn harness(pool_toml: &str) -> Harness {
    harness_with(pool_toml, Arc::new(MockProvider::new("cloud-a")))
}

impl Harness {
    fn tick(&self) -> poold::builder::BuilderStats {
        self.builder.tick(self.shutdown_rx.clone()).unwrap()
    }

    fn builds(&self) -> Vec<ImageBuildRecord> {
        self.store.query_image_builds(&ImageFilter::default()).unwrap()
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_builds_image_then_launches_flow() {
    let h = harness(POOL);

    // Reconciler defers while no build is ready.
    let reconciler = DemandReconciler::new(
        Arc::clone(&h.store),
        Arc::clone(&h.registry),
        h.snapshot_rx.clone(),
        ReconcilerConfig {
            tick_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
        },
    );
    let stats = reconciler.tick().unwrap();
    assert_eq!(stats.labels_waiting_on_image, 1);
    assert_eq!(stats.launches_requested, 0);

    let stats = h.tick();
    assert_eq!(stats.builds_started, 1);

    wait_for("ready build", || {
        h.store
            .latest_ready_build("cloud-a", "ci-base")
            .unwrap()
            .is_some()
    })
    .await;
    let build = h.store.latest_ready_build("cloud-a", "ci-base").unwrap().unwrap();
    assert!(build.snapshot_id.as_deref().unwrap().starts_with("snap_"));

    // The next reconcile launches against the fresh build.
    let stats = reconciler.tick().unwrap();
    assert_eq!(stats.launches_requested, 1);
    wait_for("node ready", || {
        h.store
            .count_nodes("cloud-a", "small", &[NodeState::Ready])
            .unwrap()
            == 1
    })
    .await;
    let node = &h
        .store
        .query_nodes(&poold::state::NodeFilter::default())
        .unwrap()[0];
    assert_eq!(node.build_id, build.id);
}

#[tokio::test]
async fn test_single_build_in_flight_per_pair() {
    let provider = Arc::new(MockProvider::new("cloud-a").with_build_polls(1000));
    let h = harness_with(POOL, provider);

    let first = h.tick();
    let second = h.tick();
    assert_eq!(first.builds_started, 1);
    assert_eq!(second.builds_started, 0);
    assert_eq!(h.builds().len(), 1);
}

#[tokio::test]
async fn test_refresh_supersedes_old_build() {
    let toml = POOL.replace("rebuild_interval_secs = 86400", "rebuild_interval_secs = 60");
    let h = harness(&toml);

    // An old ready build past its rebuild interval.
    let mut old = ImageBuildRecord::new("ci-base", "cloud-a");
    old.created_at = chrono::Utc::now().timestamp() - 3600;
    h.store.insert_image_build(&old).unwrap();
    h.store
        .update_image_build_with(&old.id, |b| {
            b.state = ImageState::Ready;
            b.snapshot_id = Some("snap_old".to_string());
            Ok(true)
        })
        .unwrap();

    let stats = h.tick();
    assert_eq!(stats.builds_started, 1);

    wait_for("new ready build", || {
        h.store
            .latest_ready_build("cloud-a", "ci-base")
            .map(|b| b.map(|b| b.id != old.id).unwrap_or(false))
            .unwrap()
    })
    .await;

    let old_build = h.store.get_image_build(&old.id).unwrap().unwrap();
    assert!(old_build.superseded);
    assert_eq!(old_build.state, ImageState::Ready);

    // A fresh build is not rebuilt again.
    let stats = h.tick();
    assert_eq!(stats.builds_started, 0);
}

#[tokio::test]
async fn test_supersede_skips_newer_ready_build() {
    let toml = POOL.replace("rebuild_interval_secs = 86400", "rebuild_interval_secs = 60");
    let provider = Arc::new(MockProvider::new("cloud-a").with_build_polls(40));
    let h = harness_with(&toml, provider);

    // A stale ready build triggers a refresh.
    let mut stale = ImageBuildRecord::new("ci-base", "cloud-a");
    stale.created_at = chrono::Utc::now().timestamp() - 3600;
    h.store.insert_image_build(&stale).unwrap();
    h.store
        .update_image_build_with(&stale.id, |b| {
            b.state = ImageState::Ready;
            b.snapshot_id = Some("snap_stale".to_string());
            Ok(true)
        })
        .unwrap();

    let stats = h.tick();
    assert_eq!(stats.builds_started, 1);
    let in_flight = h
        .builds()
        .into_iter()
        .find(|b| b.state == ImageState::Building)
        .unwrap();

    // While the refresh is in flight, an even newer ready build lands,
    // as another daemon sharing the store would write it.
    let mut newer = ImageBuildRecord::new("ci-base", "cloud-a");
    newer.created_at = chrono::Utc::now().timestamp() + 1000;
    h.store.insert_image_build(&newer).unwrap();
    h.store
        .update_image_build_with(&newer.id, |b| {
            b.state = ImageState::Ready;
            b.snapshot_id = Some("snap_newer".to_string());
            Ok(true)
        })
        .unwrap();

    wait_for("refresh ready", || {
        h.store
            .get_image_build(&in_flight.id)
            .unwrap()
            .unwrap()
            .state
            == ImageState::Ready
    })
    .await;

    // Only the strictly older build is flagged.
    assert!(h.store.get_image_build(&stale.id).unwrap().unwrap().superseded);
    assert!(!h.store.get_image_build(&newer.id).unwrap().unwrap().superseded);
    assert!(
        !h.store
            .get_image_build(&in_flight.id)
            .unwrap()
            .unwrap()
            .superseded
    );
}

#[tokio::test]
async fn test_repeated_build_failures_then_recovery() {
    let h = harness(POOL);
    h.provider.fail_next_builds(3);

    // Three consecutive scheduled attempts fail; each leaves an error
    // record and no ready build, so launches stay gated.
    for round in 1..=3u64 {
        let stats = h.tick();
        assert_eq!(stats.builds_started, 1);
        wait_for("failed build", || {
            h.builds()
                .iter()
                .filter(|b| b.state == ImageState::Error)
                .count()
                == round as usize
        })
        .await;
        assert!(h
            .store
            .latest_ready_build("cloud-a", "ci-base")
            .unwrap()
            .is_none());
    }
    let failed = h
        .builds()
        .into_iter()
        .find(|b| b.state == ImageState::Error)
        .unwrap();
    assert!(failed.last_error.as_deref().unwrap().contains("build failed"));

    // The next scheduled tick starts a fresh build that succeeds.
    let stats = h.tick();
    assert_eq!(stats.builds_started, 1);
    wait_for("ready build", || {
        h.store
            .latest_ready_build("cloud-a", "ci-base")
            .unwrap()
            .is_some()
    })
    .await;
}

#[tokio::test]
async fn test_stale_building_record_abandoned() {
    let h = harness(POOL);

    // Leftover from a previous process: building, but no task driving it.
    let stale = ImageBuildRecord::new("ci-base", "cloud-a");
    h.store.insert_image_build(&stale).unwrap();

    let stats = h.tick();
    assert_eq!(stats.builds_abandoned, 1);
    assert_eq!(stats.builds_started, 1);

    let record = h.store.get_image_build(&stale.id).unwrap().unwrap();
    assert_eq!(record.state, ImageState::Error);
    assert!(record.last_error.as_deref().unwrap().contains("abandoned"));
}

#[tokio::test]
async fn test_superseded_build_retired_once_unreferenced() {
    let h = harness(POOL);
    let cleanup = Cleanup::new(
        Arc::clone(&h.store),
        Arc::clone(&h.registry),
        CleanupConfig {
            tick_interval: Duration::from_millis(10),
            grace_period: Duration::from_secs(0),
        },
    );

    // A superseded ready build still pinned by one node.
    let old = ImageBuildRecord::new("ci-base", "cloud-a");
    h.store.insert_image_build(&old).unwrap();
    h.store
        .update_image_build_with(&old.id, |b| {
            b.state = ImageState::Ready;
            b.snapshot_id = Some("snap_old".to_string());
            b.superseded = true;
            Ok(true)
        })
        .unwrap();
    let node = NodeRecord::new("cloud-a", "small", "ci-base", &old.id);
    h.store.insert_node(&node).unwrap();

    cleanup.tick().await.unwrap();
    assert_eq!(
        h.store.get_image_build(&old.id).unwrap().unwrap().state,
        ImageState::Ready
    );

    // Release the reference; the next scan retires the build.
    h.store
        .update_node_with(&node.id, |n| {
            n.state = NodeState::Deleting;
            Ok(true)
        })
        .unwrap();
    h.store
        .update_node_with(&node.id, |n| {
            n.state = NodeState::Gone;
            Ok(true)
        })
        .unwrap();

    let stats = cleanup.tick().await.unwrap();
    assert_eq!(stats.builds_retired, 1);
    assert!(h.store.get_image_build(&old.id).unwrap().is_none());
}

#[tokio::test]
async fn test_sole_usable_build_never_retired() {
    let h = harness(POOL);
    let cleanup = Cleanup::new(
        Arc::clone(&h.store),
        Arc::clone(&h.registry),
        CleanupConfig {
            tick_interval: Duration::from_millis(10),
            grace_period: Duration::from_secs(0),
        },
    );

    h.tick();
    wait_for("ready build", || {
        h.store
            .latest_ready_build("cloud-a", "ci-base")
            .unwrap()
            .is_some()
    })
    .await;

    // Unreferenced but not superseded: stays.
    let stats = cleanup.tick().await.unwrap();
    assert_eq!(stats.builds_retired, 0);
    assert!(h
        .store
        .latest_ready_build("cloud-a", "ci-base")
        .unwrap()
        .is_some());
}
