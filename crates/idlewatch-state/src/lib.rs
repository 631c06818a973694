//! idlewatch-state — durable state store for the idle shutdown controller.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for idle records, shutdown decisions, runtime settings,
//! and per-instance errors.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Idle records are keyed by instance id; decisions use the composite key
//! `{instance_id}:{decision_id}` so one instance's decisions can be found by
//! prefix scan.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. Read-modify-write sequences for one
//! instance run inside [`StateStore::with_instance`], a single write
//! transaction that commits all of its writes or none.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{InstanceTxn, StateStore};
pub use types::*;
