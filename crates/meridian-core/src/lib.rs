//! # meridian-core
//!
//! Core types for Meridian global tables: multi-region replicated key-value
//! tables with eventual and strong consistency.
//!
//! This crate provides:
//! - Items and the reserved system attributes stamped on every write
//! - Version vectors: causal write tracking per item
//! - Mastership leases tolerant of bounded clock skew
//! - Deterministic conflict resolution between concurrent writes
//!
//! Everything here is synchronous and free of I/O.

pub mod clock;
pub mod conflict;
pub mod item;
pub mod lease;
pub mod region;
pub mod version_vector;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use conflict::{ConflictResolver, Resolution, ResolutionKind, Side};
pub use item::{system, AttributeValue, Item};
pub use lease::{Lease, LeaseConfig, LeaseSnapshot, LeaseState};
pub use region::RegionId;
pub use version_vector::VersionVector;
