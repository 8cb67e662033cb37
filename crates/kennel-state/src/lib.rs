//! kennel-state — embedded state store for Kennel.
//!
//! Backed by [redb](https://docs.rs/redb), holds the scheduler's cached view
//! of the cluster: task records, instance records, the active-task and
//! pending-instance sets, and a handful of scalars (the launch-timeout
//! marker and arn → id reverse lookups).
//!
//! # Architecture
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns. Set
//! membership is stored as composite keys (`{set}:{member}`) so members can
//! be listed with a prefix scan.
//!
//! Every mutating operation runs in its own write transaction. redb
//! serializes writers, so read-modify-write helpers such as
//! [`StateStore::update_task`] and [`StateStore::set_idle_since_if_absent`]
//! are atomic with respect to each other.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
