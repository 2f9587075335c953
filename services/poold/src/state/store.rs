//! SQLite-based state store with optimistic concurrency.
//!
//! Every node and image build row carries a `version` counter. An update
//! is accepted only if the caller presents the currently stored version;
//! a stale write is rejected with [`StateStoreError::VersionConflict`],
//! forcing the caller to re-read. [`StateStore::update_node_with`] wraps
//! the read-modify-write loop with a bounded retry budget.
//!
//! The store survives restarts: launch demand persisted as `requested`
//! rows and half-finished `building`/`deleting` work are all recoverable
//! after a crash.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use crate::model::{ImageBuildRecord, ImageState, NodeRecord, NodeState};

/// Read-modify-write attempts before a conflict is surfaced to the caller.
pub const CAS_RETRY_LIMIT: u32 = 5;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("stale write for {id}: expected version {expected}")]
    VersionConflict { id: String, expected: i64 },

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("CAS retry budget exhausted for {0}")]
    Conflict(String),

    #[error("corrupt record {id}: unknown state {state}")]
    Corrupt { id: String, state: String },
}

/// Filter for node queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub provider: Option<String>,
    pub label: Option<String>,
    pub state: Option<NodeState>,
}

impl NodeFilter {
    pub fn provider(name: &str) -> Self {
        Self {
            provider: Some(name.to_string()),
            ..Default::default()
        }
    }
}

/// Filter for image build queries.
#[derive(Debug, Clone, Default)]
pub struct ImageFilter {
    pub image_name: Option<String>,
    pub provider: Option<String>,
    pub state: Option<ImageState>,
}

/// SQLite state store. Shared across workers as `Arc<StateStore>`; all
/// statements are short and synchronous, so the internal lock is never
/// held across an await.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Poisoning means a writer panicked mid-statement; nothing
        // sensible can continue from there.
        self.conn.lock().expect("state store lock poisoned")
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                node_id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                label TEXT NOT NULL,
                image_name TEXT NOT NULL,
                build_id TEXT NOT NULL,
                external_id TEXT,
                state TEXT NOT NULL,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                assigned_at INTEGER,
                updated_at INTEGER NOT NULL,
                version INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_nodes_provider ON nodes(provider);
            CREATE INDEX IF NOT EXISTS idx_nodes_label ON nodes(label);
            CREATE INDEX IF NOT EXISTS idx_nodes_state ON nodes(state);

            CREATE TABLE IF NOT EXISTS image_builds (
                build_id TEXT PRIMARY KEY,
                image_name TEXT NOT NULL,
                provider TEXT NOT NULL,
                snapshot_id TEXT,
                state TEXT NOT NULL,
                superseded INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                version INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_builds_pair ON image_builds(provider, image_name);
            CREATE INDEX IF NOT EXISTS idx_builds_state ON image_builds(state);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }

    // =========================================================================
    // Nodes
    // =========================================================================

    /// Insert a new node record. The record's version must be 1.
    pub fn insert_node(&self, node: &NodeRecord) -> Result<(), StateStoreError> {
        self.conn().execute(
            r#"
            INSERT INTO nodes (node_id, provider, label, image_name, build_id, external_id,
                               state, last_error, created_at, assigned_at, updated_at, version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                node.id,
                node.provider,
                node.label,
                node.image_name,
                node.build_id,
                node.external_id,
                node.state.as_str(),
                node.last_error,
                node.created_at,
                node.assigned_at,
                node.updated_at,
                node.version,
            ],
        )?;
        Ok(())
    }

    /// Get a node record by id.
    pub fn get_node(&self, node_id: &str) -> Result<Option<NodeRecord>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT node_id, provider, label, image_name, build_id, external_id,
                    state, last_error, created_at, assigned_at, updated_at, version
             FROM nodes WHERE node_id = ?1",
        )?;

        stmt.query_row(params![node_id], read_node)
            .optional()?
            .transpose()
    }

    /// Write a node record, guarded by the version the caller read.
    ///
    /// The stored version must equal `node.version`; on success the row is
    /// written with `version + 1`. A stale version yields
    /// [`StateStoreError::VersionConflict`]; a state change that violates
    /// the lifecycle yields [`StateStoreError::InvalidTransition`].
    pub fn update_node(&self, node: &NodeRecord) -> Result<(), StateStoreError> {
        let conn = self.conn();

        let current: Option<(String, i64)> = conn
            .query_row(
                "SELECT state, version FROM nodes WHERE node_id = ?1",
                params![node.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((state_str, _)) = current else {
            return Err(StateStoreError::NotFound(node.id.clone()));
        };
        let current_state = NodeState::parse(&state_str).ok_or_else(|| StateStoreError::Corrupt {
            id: node.id.clone(),
            state: state_str.clone(),
        })?;

        if !current_state.can_transition_to(node.state) {
            return Err(StateStoreError::InvalidTransition {
                id: node.id.clone(),
                from: current_state.as_str(),
                to: node.state.as_str(),
            });
        }

        let updated = conn.execute(
            r#"
            UPDATE nodes
            SET external_id = ?1, state = ?2, last_error = ?3, assigned_at = ?4,
                updated_at = ?5, version = version + 1
            WHERE node_id = ?6 AND version = ?7
            "#,
            params![
                node.external_id,
                node.state.as_str(),
                node.last_error,
                node.assigned_at,
                node.updated_at,
                node.id,
                node.version,
            ],
        )?;

        if updated == 0 {
            // Row exists (checked above) but the version moved under us.
            return Err(StateStoreError::VersionConflict {
                id: node.id.clone(),
                expected: node.version,
            });
        }
        Ok(())
    }

    /// Read-modify-write a node with bounded CAS retries.
    ///
    /// The closure may inspect the freshly read record and either mutate
    /// it (returning `Ok(true)`) or decline the update (`Ok(false)`).
    /// Returns the record as last read.
    pub fn update_node_with<F>(
        &self,
        node_id: &str,
        mut apply: F,
    ) -> Result<NodeRecord, StateStoreError>
    where
        F: FnMut(&mut NodeRecord) -> Result<bool, StateStoreError>,
    {
        for _ in 0..CAS_RETRY_LIMIT {
            let Some(mut node) = self.get_node(node_id)? else {
                return Err(StateStoreError::NotFound(node_id.to_string()));
            };

            if !apply(&mut node)? {
                return Ok(node);
            }
            node.updated_at = chrono::Utc::now().timestamp();

            match self.update_node(&node) {
                Ok(()) => {
                    node.version += 1;
                    return Ok(node);
                }
                Err(StateStoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StateStoreError::Conflict(node_id.to_string()))
    }

    /// Hard-delete a node record (cleanup pruning only).
    pub fn delete_node(&self, node_id: &str) -> Result<(), StateStoreError> {
        self.conn()
            .execute("DELETE FROM nodes WHERE node_id = ?1", params![node_id])?;
        Ok(())
    }

    /// Query nodes matching a filter, ordered oldest first.
    pub fn query_nodes(&self, filter: &NodeFilter) -> Result<Vec<NodeRecord>, StateStoreError> {
        let mut sql = String::from(
            "SELECT node_id, provider, label, image_name, build_id, external_id,
                    state, last_error, created_at, assigned_at, updated_at, version
             FROM nodes WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(provider) = &filter.provider {
            sql.push_str(&format!(" AND provider = ?{}", args.len() + 1));
            args.push(Box::new(provider.clone()));
        }
        if let Some(label) = &filter.label {
            sql.push_str(&format!(" AND label = ?{}", args.len() + 1));
            args.push(Box::new(label.clone()));
        }
        if let Some(state) = filter.state {
            sql.push_str(&format!(" AND state = ?{}", args.len() + 1));
            args.push(Box::new(state.as_str()));
        }
        sql.push_str(" ORDER BY created_at, node_id");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();

        let rows = stmt.query_map(params.as_slice(), read_node)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    /// Count nodes for a (provider, label) in any of the given states.
    pub fn count_nodes(
        &self,
        provider: &str,
        label: &str,
        states: &[NodeState],
    ) -> Result<i64, StateStoreError> {
        let placeholders = state_placeholders(states, 3);
        let sql = format!(
            "SELECT COUNT(*) FROM nodes WHERE provider = ?1 AND label = ?2 AND state IN ({placeholders})"
        );

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut params: Vec<&dyn rusqlite::ToSql> = vec![&provider, &label];
        let state_strs: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
        for s in &state_strs {
            params.push(s);
        }

        let count: i64 = stmt.query_row(params.as_slice(), |row| row.get(0))?;
        Ok(count)
    }

    /// Count of nodes occupying a concurrency slot on a provider:
    /// `requested`, `building`, `ready`, `in_use`, plus `error` nodes that
    /// still hold a server. A timed-out launch leaves its server behind
    /// until cleanup deletes it, and that server counts against
    /// `max_servers` the whole time.
    pub fn provider_load(&self, provider: &str) -> Result<i64, StateStoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM nodes
             WHERE provider = ?1
               AND (state IN ('requested', 'building', 'ready', 'in_use')
                    OR (state = 'error' AND external_id IS NOT NULL))",
            params![provider],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Count of non-`gone` nodes pinned to an image build.
    pub fn count_build_refs(&self, build_id: &str) -> Result<i64, StateStoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM nodes WHERE build_id = ?1 AND state != 'gone'",
            params![build_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // =========================================================================
    // Image builds
    // =========================================================================

    /// Insert a new image build record.
    pub fn insert_image_build(&self, build: &ImageBuildRecord) -> Result<(), StateStoreError> {
        self.conn().execute(
            r#"
            INSERT INTO image_builds (build_id, image_name, provider, snapshot_id,
                                      state, superseded, last_error, created_at,
                                      updated_at, version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                build.id,
                build.image_name,
                build.provider,
                build.snapshot_id,
                build.state.as_str(),
                build.superseded as i64,
                build.last_error,
                build.created_at,
                build.updated_at,
                build.version,
            ],
        )?;
        Ok(())
    }

    /// Get an image build record by id.
    pub fn get_image_build(
        &self,
        build_id: &str,
    ) -> Result<Option<ImageBuildRecord>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT build_id, image_name, provider, snapshot_id, state, superseded,
                    last_error, created_at, updated_at, version
             FROM image_builds WHERE build_id = ?1",
        )?;

        stmt.query_row(params![build_id], read_build)
            .optional()?
            .transpose()
    }

    /// Write an image build record under the CAS contract (same rules as
    /// [`StateStore::update_node`]).
    pub fn update_image_build(&self, build: &ImageBuildRecord) -> Result<(), StateStoreError> {
        let conn = self.conn();

        let current: Option<String> = conn
            .query_row(
                "SELECT state FROM image_builds WHERE build_id = ?1",
                params![build.id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(state_str) = current else {
            return Err(StateStoreError::NotFound(build.id.clone()));
        };
        let current_state =
            ImageState::parse(&state_str).ok_or_else(|| StateStoreError::Corrupt {
                id: build.id.clone(),
                state: state_str.clone(),
            })?;

        if !current_state.can_transition_to(build.state) {
            return Err(StateStoreError::InvalidTransition {
                id: build.id.clone(),
                from: current_state.as_str(),
                to: build.state.as_str(),
            });
        }

        let updated = conn.execute(
            r#"
            UPDATE image_builds
            SET snapshot_id = ?1, state = ?2, superseded = ?3, last_error = ?4,
                updated_at = ?5, version = version + 1
            WHERE build_id = ?6 AND version = ?7
            "#,
            params![
                build.snapshot_id,
                build.state.as_str(),
                build.superseded as i64,
                build.last_error,
                build.updated_at,
                build.id,
                build.version,
            ],
        )?;

        if updated == 0 {
            return Err(StateStoreError::VersionConflict {
                id: build.id.clone(),
                expected: build.version,
            });
        }
        Ok(())
    }

    /// Read-modify-write an image build with bounded CAS retries.
    pub fn update_image_build_with<F>(
        &self,
        build_id: &str,
        mut apply: F,
    ) -> Result<ImageBuildRecord, StateStoreError>
    where
        F: FnMut(&mut ImageBuildRecord) -> Result<bool, StateStoreError>,
    {
        for _ in 0..CAS_RETRY_LIMIT {
            let Some(mut build) = self.get_image_build(build_id)? else {
                return Err(StateStoreError::NotFound(build_id.to_string()));
            };

            if !apply(&mut build)? {
                return Ok(build);
            }
            build.updated_at = chrono::Utc::now().timestamp();

            match self.update_image_build(&build) {
                Ok(()) => {
                    build.version += 1;
                    return Ok(build);
                }
                Err(StateStoreError::VersionConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StateStoreError::Conflict(build_id.to_string()))
    }

    /// Hard-delete an image build record (cleanup pruning only).
    pub fn delete_image_build(&self, build_id: &str) -> Result<(), StateStoreError> {
        self.conn().execute(
            "DELETE FROM image_builds WHERE build_id = ?1",
            params![build_id],
        )?;
        Ok(())
    }

    /// Query image builds matching a filter, ordered oldest first.
    pub fn query_image_builds(
        &self,
        filter: &ImageFilter,
    ) -> Result<Vec<ImageBuildRecord>, StateStoreError> {
        let mut sql = String::from(
            "SELECT build_id, image_name, provider, snapshot_id, state, superseded,
                    last_error, created_at, updated_at, version
             FROM image_builds WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(image_name) = &filter.image_name {
            sql.push_str(&format!(" AND image_name = ?{}", args.len() + 1));
            args.push(Box::new(image_name.clone()));
        }
        if let Some(provider) = &filter.provider {
            sql.push_str(&format!(" AND provider = ?{}", args.len() + 1));
            args.push(Box::new(provider.clone()));
        }
        if let Some(state) = filter.state {
            sql.push_str(&format!(" AND state = ?{}", args.len() + 1));
            args.push(Box::new(state.as_str()));
        }
        sql.push_str(" ORDER BY created_at, build_id");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();

        let rows = stmt.query_map(params.as_slice(), read_build)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row??);
        }
        Ok(records)
    }

    /// Newest non-superseded `ready` build for a (provider, image) pair.
    pub fn latest_ready_build(
        &self,
        provider: &str,
        image_name: &str,
    ) -> Result<Option<ImageBuildRecord>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT build_id, image_name, provider, snapshot_id, state, superseded,
                    last_error, created_at, updated_at, version
             FROM image_builds
             WHERE provider = ?1 AND image_name = ?2 AND state = 'ready' AND superseded = 0
             ORDER BY created_at DESC, build_id DESC
             LIMIT 1",
        )?;

        stmt.query_row(params![provider, image_name], read_build)
            .optional()?
            .transpose()
    }
}

fn state_placeholders(states: &[NodeState], first: usize) -> String {
    (0..states.len())
        .map(|i| format!("?{}", first + i))
        .collect::<Vec<_>>()
        .join(", ")
}

type RowResult<T> = rusqlite::Result<Result<T, StateStoreError>>;

fn read_node(row: &Row<'_>) -> RowResult<NodeRecord> {
    let id: String = row.get(0)?;
    let state_str: String = row.get(6)?;
    let Some(state) = NodeState::parse(&state_str) else {
        return Ok(Err(StateStoreError::Corrupt {
            id,
            state: state_str,
        }));
    };

    Ok(Ok(NodeRecord {
        id,
        provider: row.get(1)?,
        label: row.get(2)?,
        image_name: row.get(3)?,
        build_id: row.get(4)?,
        external_id: row.get(5)?,
        state,
        last_error: row.get(7)?,
        created_at: row.get(8)?,
        assigned_at: row.get(9)?,
        updated_at: row.get(10)?,
        version: row.get(11)?,
    }))
}

fn read_build(row: &Row<'_>) -> RowResult<ImageBuildRecord> {
    let id: String = row.get(0)?;
    let state_str: String = row.get(4)?;
    let Some(state) = ImageState::parse(&state_str) else {
        return Ok(Err(StateStoreError::Corrupt {
            id,
            state: state_str,
        }));
    };
    let superseded: i64 = row.get(5)?;

    Ok(Ok(ImageBuildRecord {
        id,
        image_name: row.get(1)?,
        provider: row.get(2)?,
        snapshot_id: row.get(3)?,
        state,
        superseded: superseded != 0,
        last_error: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        version: row.get(9)?,
    }))
}
