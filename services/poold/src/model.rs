//! Durable data model for pool nodes and image builds.
//!
//! ## Node lifecycle
//!
//! ```text
//! requested -> building -> ready -> in_use -> deleting -> gone
//!      |           |         |        |
//!      +--------> error <----+--------+
//!                   |
//!                   +-> deleting -> gone
//! ```
//!
//! Transitions are monotonic: no backward moves except into `error` or
//! `deleting`. The store rejects writes that violate [`NodeState::can_transition_to`].
//!
//! ## Image build lifecycle
//!
//! `building -> ready | error`, then `deleting -> gone` once retired. A
//! `ready` build superseded by a newer one keeps serving existing nodes
//! until nothing references it (tracked by the `superseded` flag, not a
//! separate state).

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Lifecycle state of a pool node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Launch demand persisted, not yet handed to the provider.
    Requested,
    /// Server created on the provider, waiting for boot.
    Building,
    /// Booted and available for assignment.
    Ready,
    /// Assigned to a consumer.
    InUse,
    /// Marked for deletion.
    Deleting,
    /// External server is gone; record awaits pruning.
    Gone,
    /// Launch or boot failed; awaits cleanup.
    Error,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::InUse => "in_use",
            Self::Deleting => "deleting",
            Self::Gone => "gone",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(Self::Requested),
            "building" => Some(Self::Building),
            "ready" => Some(Self::Ready),
            "in_use" => Some(Self::InUse),
            "deleting" => Some(Self::Deleting),
            "gone" => Some(Self::Gone),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// True for states on the healthy path (not failed, retiring, or gone).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Requested | Self::Building | Self::Ready | Self::InUse
        )
    }

    /// Check whether a transition is allowed. Same-state writes are
    /// permitted so field updates can go through the same CAS path.
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        use NodeState::*;

        if *self == next {
            return true;
        }
        matches!(
            (*self, next),
            (Requested, Building)
                | (Building, Ready)
                | (Ready, InUse)
                | (Requested, Error)
                | (Building, Error)
                | (Ready, Error)
                | (InUse, Error)
                | (Requested, Deleting)
                | (Building, Deleting)
                | (Ready, Deleting)
                | (InUse, Deleting)
                | (Error, Deleting)
                | (Deleting, Gone)
        )
    }
}

/// Lifecycle state of an image build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageState {
    Building,
    Ready,
    Error,
    Deleting,
    Gone,
}

impl ImageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Deleting => "deleting",
            Self::Gone => "gone",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "building" => Some(Self::Building),
            "ready" => Some(Self::Ready),
            "error" => Some(Self::Error),
            "deleting" => Some(Self::Deleting),
            "gone" => Some(Self::Gone),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: ImageState) -> bool {
        use ImageState::*;

        if *self == next {
            return true;
        }
        matches!(
            (*self, next),
            (Building, Ready)
                | (Building, Error)
                | (Ready, Deleting)
                | (Error, Deleting)
                | (Deleting, Gone)
        )
    }
}

/// Durable record of one pool node.
///
/// Provider, label, and the pinned image build never change after
/// creation. `version` carries the CAS counter; a write is accepted only
/// if it presents the currently stored version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub provider: String,
    pub label: String,
    /// Logical image name the label binds to.
    pub image_name: String,
    /// Image build the node boots from, pinned at creation. A superseding
    /// build never retroactively changes what a node is running.
    pub build_id: String,
    /// Provider-side server id, set once the server exists.
    pub external_id: Option<String>,
    pub state: NodeState,
    /// Last failure reason, surfaced in listings for `error` nodes.
    pub last_error: Option<String>,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds; set when a consumer takes the node.
    pub assigned_at: Option<i64>,
    /// Unix seconds; refreshed on every accepted write. Grace periods
    /// are measured from here, not from `created_at`.
    pub updated_at: i64,
    /// CAS version counter.
    pub version: i64,
}

impl NodeRecord {
    /// Create a new node in `requested` state, pinned to an image build.
    pub fn new(provider: &str, label: &str, image_name: &str, build_id: &str) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: new_node_id(),
            provider: provider.to_string(),
            label: label.to_string(),
            image_name: image_name.to_string(),
            build_id: build_id.to_string(),
            external_id: None,
            state: NodeState::Requested,
            last_error: None,
            created_at: now,
            assigned_at: None,
            updated_at: now,
            version: 1,
        }
    }
}

/// Durable record of one per-provider image build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBuildRecord {
    pub id: String,
    pub image_name: String,
    pub provider: String,
    /// Provider-side snapshot id, set once the build completes.
    pub snapshot_id: Option<String>,
    pub state: ImageState,
    /// A newer ready build exists; this one is retired once unreferenced.
    pub superseded: bool,
    pub last_error: Option<String>,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds; refreshed on every accepted write.
    pub updated_at: i64,
    /// CAS version counter.
    pub version: i64,
}

impl ImageBuildRecord {
    /// Create a new build record in `building` state.
    pub fn new(image_name: &str, provider: &str) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: new_build_id(),
            image_name: image_name.to_string(),
            provider: provider.to_string(),
            snapshot_id: None,
            state: ImageState::Building,
            superseded: false,
            last_error: None,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }
}

/// Generate a new node id.
pub fn new_node_id() -> String {
    format!("node_{}", Ulid::new())
}

/// Generate a new image build id.
pub fn new_build_id() -> String {
    format!("img_{}", Ulid::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_roundtrip() {
        for state in [
            NodeState::Requested,
            NodeState::Building,
            NodeState::Ready,
            NodeState::InUse,
            NodeState::Deleting,
            NodeState::Gone,
            NodeState::Error,
        ] {
            assert_eq!(NodeState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn test_node_transitions_monotonic() {
        use NodeState::*;

        assert!(Requested.can_transition_to(Building));
        assert!(Building.can_transition_to(Ready));
        assert!(Ready.can_transition_to(InUse));
        assert!(InUse.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Gone));

        // No backward moves.
        assert!(!Ready.can_transition_to(Building));
        assert!(!InUse.can_transition_to(Ready));
        assert!(!Gone.can_transition_to(Deleting));

        // Error is reachable from every live state, and only exits via deleting.
        assert!(Building.can_transition_to(Error));
        assert!(InUse.can_transition_to(Error));
        assert!(Error.can_transition_to(Deleting));
        assert!(!Error.can_transition_to(Ready));
    }

    #[test]
    fn test_image_transitions() {
        use ImageState::*;

        assert!(Building.can_transition_to(Ready));
        assert!(Building.can_transition_to(Error));
        assert!(Ready.can_transition_to(Deleting));
        assert!(!Ready.can_transition_to(Building));
        assert!(!Error.can_transition_to(Ready));
    }

    #[test]
    fn test_active_states() {
        assert!(NodeState::Requested.is_active());
        assert!(NodeState::InUse.is_active());
        assert!(!NodeState::Deleting.is_active());
        assert!(!NodeState::Error.is_active());
        assert!(!NodeState::Gone.is_active());
    }

    #[test]
    fn test_new_node_record() {
        let node = NodeRecord::new("cloud-a", "small", "ci-base", "img_123");
        assert_eq!(node.state, NodeState::Requested);
        assert_eq!(node.version, 1);
        assert!(node.external_id.is_none());
        assert_eq!(node.updated_at, node.created_at);
        assert!(node.id.starts_with("node_"));
    }
}
