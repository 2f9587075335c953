//! Durable pool state.
//!
//! SQLite-backed storage for node and image build records. Every writer
//! (reconciler, launcher, builder, cleanup) goes through the per-record
//! compare-and-swap contract; nothing holds an exclusive in-memory copy
//! of a record across a suspension point.

mod store;

pub use store::{ImageFilter, NodeFilter, StateStore, StateStoreError, CAS_RETRY_LIMIT};
