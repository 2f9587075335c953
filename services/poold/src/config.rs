//! Configuration: process settings and the versioned pool snapshot.
//!
//! Process-level settings (paths, intervals) come from `WARMPOOL_*`
//! environment variables. The pool itself (providers, labels, images,
//! target counts) lives in a TOML file:
//!
//! ```toml
//! [[providers]]
//! name = "cloud-a"
//! driver = "mock"
//! max_servers = 10
//! credentials_ref = "secret://cloud-a"
//! labels = ["small", "large"]
//!
//! [[labels]]
//! name = "small"
//! min_ready = 2
//! image = "ci-base"
//!
//! [[images]]
//! name = "ci-base"
//! rebuild_interval_secs = 86400
//! ```
//!
//! The file is loaded into an immutable [`ConfigSnapshot`] with a
//! monotonically increasing version and distributed through a
//! `tokio::sync::watch` channel. Workers always read one consistent
//! snapshot per cycle; a reload either installs a complete new snapshot
//! or keeps the previous one, so a partially-updated config is never
//! observable.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

/// Errors from loading or validating the pool file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse pool config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid pool config: {0}")]
    Invalid(String),
}

/// Process-level daemon settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the TOML pool file.
    pub pool_config_path: PathBuf,

    /// Path to the SQLite state store.
    pub state_path: PathBuf,

    /// Interval between demand reconciliation ticks.
    pub reconcile_interval: Duration,

    /// Interval between image builder ticks.
    pub builder_interval: Duration,

    /// Interval between cleanup scans.
    pub cleanup_interval: Duration,

    /// Interval between pool config reload checks.
    pub reload_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let pool_config_path = std::env::var("WARMPOOL_POOL_CONFIG")
            .unwrap_or_else(|_| "/etc/warmpool/pool.toml".to_string())
            .into();

        let state_path = std::env::var("WARMPOOL_STATE_PATH")
            .unwrap_or_else(|_| "/var/lib/warmpool/state.db".to_string())
            .into();

        let reconcile_interval = env_secs("WARMPOOL_RECONCILE_INTERVAL", 10);
        let builder_interval = env_secs("WARMPOOL_BUILDER_INTERVAL", 60);
        let cleanup_interval = env_secs("WARMPOOL_CLEANUP_INTERVAL", 60);
        let reload_interval = env_secs("WARMPOOL_RELOAD_INTERVAL", 30);

        let log_level = std::env::var("WARMPOOL_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            pool_config_path,
            state_path,
            reconcile_interval,
            builder_interval,
            cleanup_interval,
            reload_interval,
            log_level,
        })
    }
}

fn env_secs(var: &str, default: u64) -> Duration {
    let secs = std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

// =============================================================================
// Pool file
// =============================================================================

/// One cloud provider entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Provider {
    pub name: String,

    /// Adapter driver selecting the provider implementation.
    pub driver: String,

    /// Concurrency cap: nodes in requested/building/ready/in_use on this
    /// provider never exceed this.
    pub max_servers: u32,

    /// Opaque credentials reference, resolved outside the pool core.
    #[serde(default)]
    pub credentials_ref: Option<String>,

    /// Labels this provider serves.
    pub labels: Vec<String>,
}

/// One logical node type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Label {
    pub name: String,

    /// Target count of ready nodes kept warm.
    pub min_ready: u32,

    /// Image the label boots from.
    pub image: String,
}

/// One image definition.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Image {
    pub name: String,

    /// Seconds between scheduled rebuilds of a ready image.
    pub rebuild_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct PoolFile {
    #[serde(default)]
    providers: Vec<Provider>,
    #[serde(default)]
    labels: Vec<Label>,
    #[serde(default)]
    images: Vec<Image>,
}

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable, versioned view of the pool configuration for one cycle.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Monotonically increasing snapshot version.
    pub version: u64,

    pub providers: Vec<Provider>,
    labels: BTreeMap<String, Label>,
    images: BTreeMap<String, Image>,
}

impl ConfigSnapshot {
    /// Build an empty snapshot (before the first successful load).
    pub fn empty() -> Self {
        Self {
            version: 0,
            providers: Vec::new(),
            labels: BTreeMap::new(),
            images: BTreeMap::new(),
        }
    }

    /// Parse and validate a pool file.
    pub fn from_toml(contents: &str, version: u64) -> Result<Self, ConfigError> {
        let file: PoolFile = toml::from_str(contents)?;
        Self::from_file(file, version)
    }

    /// Load, parse, and validate the pool file at `path`.
    pub fn load(path: &Path, version: u64) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents, version)
    }

    fn from_file(file: PoolFile, version: u64) -> Result<Self, ConfigError> {
        let mut labels = BTreeMap::new();
        for label in file.labels {
            if labels.insert(label.name.clone(), label.clone()).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate label: {}",
                    label.name
                )));
            }
        }

        let mut images = BTreeMap::new();
        for image in file.images {
            if images.insert(image.name.clone(), image.clone()).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate image: {}",
                    image.name
                )));
            }
        }

        for label in labels.values() {
            if !images.contains_key(&label.image) {
                return Err(ConfigError::Invalid(format!(
                    "label {} references undefined image {}",
                    label.name, label.image
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for provider in &file.providers {
            if !seen.insert(provider.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider: {}",
                    provider.name
                )));
            }
            if provider.max_servers == 0 {
                return Err(ConfigError::Invalid(format!(
                    "provider {} has max_servers = 0",
                    provider.name
                )));
            }
            for label in &provider.labels {
                if !labels.contains_key(label) {
                    return Err(ConfigError::Invalid(format!(
                        "provider {} serves undefined label {}",
                        provider.name, label
                    )));
                }
            }
        }

        Ok(Self {
            version,
            providers: file.providers,
            labels,
            images,
        })
    }

    pub fn provider(&self, name: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.name == name)
    }

    pub fn label(&self, name: &str) -> Option<&Label> {
        self.labels.get(name)
    }

    pub fn image(&self, name: &str) -> Option<&Image> {
        self.images.get(name)
    }

    /// Whether `provider` serves `label` in this snapshot.
    pub fn serves(&self, provider: &str, label: &str) -> bool {
        self.provider(provider)
            .map(|p| p.labels.iter().any(|l| l == label))
            .unwrap_or(false)
    }

    /// Distinct (provider, image) pairs the builder must keep fresh,
    /// derived from label bindings.
    pub fn provider_image_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = BTreeSet::new();
        for provider in &self.providers {
            for label_name in &provider.labels {
                if let Some(label) = self.labels.get(label_name) {
                    pairs.insert((provider.name.clone(), label.image.clone()));
                }
            }
        }
        pairs.into_iter().collect()
    }

    /// Rebuild interval for an image, if defined.
    pub fn rebuild_interval(&self, image_name: &str) -> Option<Duration> {
        self.images
            .get(image_name)
            .map(|i| Duration::from_secs(i.rebuild_interval_secs))
    }
}

// =============================================================================
// Reload loop
// =============================================================================

/// Periodically re-read the pool file and atomically swap in a new
/// snapshot on change. A failed load keeps the previous snapshot.
pub async fn run_reload_loop(
    path: PathBuf,
    interval: Duration,
    tx: watch::Sender<Arc<ConfigSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let current = tx.borrow().clone();
                match ConfigSnapshot::load(&path, current.version + 1) {
                    Ok(next) => {
                        if snapshots_equal(&current, &next) {
                            continue;
                        }
                        info!(
                            version = next.version,
                            providers = next.providers.len(),
                            "Pool config changed, installing new snapshot"
                        );
                        let _ = tx.send(Arc::new(next));
                    }
                    Err(e) => {
                        warn!(error = %e, "Pool config reload failed, keeping previous snapshot");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Config reload loop shutting down");
                    break;
                }
            }
        }
    }
}

fn snapshots_equal(a: &ConfigSnapshot, b: &ConfigSnapshot) -> bool {
    a.providers == b.providers && a.labels == b.labels && a.images == b.images
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[providers]]
        name = "cloud-a"
        driver = "mock"
        max_servers = 10
        labels = ["small"]

        [[labels]]
        name = "small"
        min_ready = 2
        image = "ci-base"

        [[images]]
        name = "ci-base"
        rebuild_interval_secs = 3600
    "#;

    #[test]
    fn test_parse_and_views() {
        let snapshot = ConfigSnapshot::from_toml(SAMPLE, 1).unwrap();

        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.providers.len(), 1);
        assert_eq!(snapshot.label("small").unwrap().min_ready, 2);
        assert!(snapshot.serves("cloud-a", "small"));
        assert!(!snapshot.serves("cloud-a", "large"));
        assert_eq!(
            snapshot.provider_image_pairs(),
            vec![("cloud-a".to_string(), "ci-base".to_string())]
        );
        assert_eq!(
            snapshot.rebuild_interval("ci-base"),
            Some(Duration::from_secs(3600))
        );
    }

    #[test]
    fn test_rejects_undefined_image() {
        let toml = r#"
            [[labels]]
            name = "small"
            min_ready = 1
            image = "missing"
        "#;
        let err = ConfigSnapshot::from_toml(toml, 1).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_undefined_label_binding() {
        let toml = r#"
            [[providers]]
            name = "cloud-a"
            driver = "mock"
            max_servers = 5
            labels = ["missing"]
        "#;
        let err = ConfigSnapshot::from_toml(toml, 1).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let toml = r#"
            [[providers]]
            name = "cloud-a"
            driver = "mock"
            max_servers = 0
            labels = []
        "#;
        let err = ConfigSnapshot::from_toml(toml, 1).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_duplicates() {
        let toml = r#"
            [[images]]
            name = "ci-base"
            rebuild_interval_secs = 60

            [[images]]
            name = "ci-base"
            rebuild_interval_secs = 120
        "#;
        let err = ConfigSnapshot::from_toml(toml, 1).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = ConfigSnapshot::empty();
        assert_eq!(snapshot.version, 0);
        assert!(snapshot.provider_image_pairs().is_empty());
    }
}
