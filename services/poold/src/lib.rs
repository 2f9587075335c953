//! warmpool daemon library.
//!
//! poold keeps a pool of pre-booted CI nodes warm across one or more
//! cloud providers. It converges durable state toward the configured
//! targets and survives restarts without losing or duplicating work.
//!
//! ## Architecture
//!
//! - **Demand Reconciler**: Compares inventory against per-label targets
//!   and turns deficits into launches, surpluses into deletions
//! - **Node Launcher**: Per-provider worker pool driving individual nodes
//!   through their lifecycle under the provider's concurrency cap
//! - **Image Builder**: Keeps one fresh bootable snapshot per
//!   (provider, image) pair, superseding stale builds
//! - **Cleanup**: Retires failed nodes, reaps orphaned servers, prunes
//!   terminal records and unreferenced image builds
//! - **State Store**: SQLite-backed records with optimistic concurrency;
//!   every state transition goes through a version check
//!
//! ## Modules
//!
//! - `config`: Environment settings and the versioned pool snapshot
//! - `model`: Node and image build records and their lifecycles
//! - `state`: The persistent store
//! - `launcher`: Per-provider launch/delete execution
//! - `reconciler`: The demand loop
//! - `builder`: The image build pipeline
//! - `cleanup`: Garbage collection

pub mod backoff;
pub mod builder;
pub mod cleanup;
pub mod config;
pub mod launcher;
pub mod model;
pub mod reconciler;
pub mod state;

pub use builder::{BuilderConfig, ImageBuilder};
pub use cleanup::{Cleanup, CleanupConfig};
pub use config::{Config, ConfigSnapshot};
pub use launcher::{AdapterFactory, LauncherConfig, NodeAction, ProviderRegistry};
pub use model::{ImageBuildRecord, ImageState, NodeRecord, NodeState};
pub use reconciler::{DemandReconciler, ReconcilerConfig};
pub use state::{StateStore, StateStoreError};
