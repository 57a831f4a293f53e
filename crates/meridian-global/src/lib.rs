//! # meridian-global
//!
//! Active-active global tables: every region accepts writes, strongly
//! consistent requests go to a per-table master region, and replicas
//! converge through incremental pull replication.
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use meridian_core::{Item, RegionId, SystemClock};
//! use meridian_global::{GlobalConfigBuilder, MetadataStore, ReplicationEngine};
//! use meridian_store::{Consistency, MemoryCluster};
//!
//! #[tokio::main]
//! async fn main() -> meridian_global::Result<()> {
//!     let cluster = Arc::new(MemoryCluster::new(["us-west-1", "eu-central-1"]));
//!     cluster.create_table("movies", "name").await?;
//!
//!     let config = GlobalConfigBuilder::new()
//!         .local_region("us-west-1")
//!         .metadata_home("us-west-1")
//!         .build();
//!     let metadata = Arc::new(
//!         MetadataStore::open(config, cluster.clone(), Arc::new(SystemClock)).await?,
//!     );
//!     metadata.create_table("movies", &RegionId::new("us-west-1")).await?;
//!     metadata.add_region("movies", &RegionId::new("eu-central-1")).await?;
//!
//!     // Write in Europe, locally
//!     let router = metadata.router("movies", RegionId::new("eu-central-1")).await?;
//!     router
//!         .put_item(Item::new().with("name", "Casablanca").with("year", 1942), Consistency::Eventual)
//!         .await?;
//!
//!     // Replicate everywhere
//!     let engine = ReplicationEngine::new(metadata.clone());
//!     engine.sync_replicas("movies").await?;
//!     assert!(cluster.is_converged("movies"));
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`router`] - Per-table request routing, write stamping and master discovery
//! - [`metadata`] - Table catalog (master, replica set) and mastership leases
//! - [`replication`] - Pairwise incremental pull replication with conflict resolution
//! - [`config`] - Configuration structs and builders
//! - [`error`] - Error types

pub mod config;
pub mod error;
pub mod metadata;
pub mod replication;
pub mod router;

// Re-exports for convenience
pub use config::{ApplyPolicy, GlobalConfig, GlobalConfigBuilder, MetadataConfig, ReplicationConfig};
pub use error::{GlobalError, Result};
pub use metadata::{MetadataStore, TableMetadata, TableTopology, METADATA_TABLE};
pub use replication::{PullReport, ReplicationEngine, ReplicationStats};
pub use router::{GlobalRequestRouter, KeyLocks, MasterLookup, MasterSource};
