//! edgegrid-state — embedded state store for EdgeGrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for the fleet inventory (hosts, cloud instances, containers,
//! services) and for the decision engine's bookkeeping (field statistics,
//! event counters, executed decisions, monitoring log).
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Per-entity records use `{entity}:{suffix}` keys so that everything
//! belonging to one host or container can be found with a prefix scan.
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
