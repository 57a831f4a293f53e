//! # meridian-store
//!
//! The per-region item store that Meridian global tables replicate over.
//!
//! The replication layer treats each region's store as an external
//! collaborator behind the [`ItemStore`] trait. This crate defines that
//! trait, the request shapes it accepts, and [`MemoryItemStore`], an
//! in-memory replica used for tests and simulations.
//!
//! - [`store`] - The `ItemStore` and `RegionDirectory` traits
//! - [`request`] - Consistency levels, scan filters and attribute updates
//! - [`memory`] - In-memory replicas and clusters
//! - [`error`] - Error types

pub mod error;
pub mod memory;
pub mod request;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{MemoryCluster, MemoryItemStore};
pub use request::{apply_updates, AttributeUpdate, Condition, Consistency, ScanFilter, UpdateAction};
pub use store::{ItemStore, RegionDirectory, SharedStore};
