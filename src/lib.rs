//! Meridian - active-active multi-region replication for key-value tables.
//!
//! Umbrella crate re-exporting the workspace crates, plus the soak test
//! driven by the `meridian` binary.

pub use meridian_core;
pub use meridian_global;
pub use meridian_store;
