//! The item store interface consumed by routers and the replication engine.

use crate::error::Result;
use crate::request::{AttributeUpdate, Consistency, ScanFilter};
use async_trait::async_trait;
use meridian_core::{Item, RegionId};
use std::sync::Arc;

/// One physical replica: the tables stored in a single region.
///
/// Implementations are expected to complete or fail every call within a
/// bounded I/O timeout. Failures propagate to callers unchanged.
#[async_trait]
pub trait ItemStore: Send + Sync + 'static {
    /// Region this replica lives in.
    fn region(&self) -> &RegionId;

    /// Read one item by primary key. A missing key is `Ok(None)`.
    async fn get_item(&self, table: &str, key: &str, consistency: Consistency)
        -> Result<Option<Item>>;

    /// Replace the item with the same primary key. Returns the stored item.
    async fn put_item(&self, table: &str, item: Item) -> Result<Item>;

    /// Apply partial updates to an item, creating it if absent. Returns the
    /// stored item after the update.
    async fn update_item(
        &self,
        table: &str,
        key: &str,
        updates: &[AttributeUpdate],
    ) -> Result<Item>;

    /// All items matching `filter`.
    async fn scan(
        &self,
        table: &str,
        filter: &ScanFilter,
        consistency: Consistency,
    ) -> Result<Vec<Item>>;

    /// Name of the table's primary key attribute.
    async fn describe_key_schema(&self, table: &str) -> Result<String>;

    /// Create the table if it does not exist. Returns true if created.
    async fn create_if_absent(&self, table: &str, key_attribute: &str) -> Result<bool>;

    /// Delete the table if it exists. Returns true if deleted.
    async fn delete_if_exists(&self, table: &str) -> Result<bool>;

    /// Wait until the table accepts reads and writes.
    async fn wait_until_active(&self, table: &str) -> Result<()>;
}

/// Shared handle to a replica.
pub type SharedStore = Arc<dyn ItemStore>;

/// Resolves a region to a handle on its physical replica.
///
/// Routers call this at construction for their local region and again
/// whenever the master region changes.
pub trait RegionDirectory: Send + Sync + 'static {
    fn connect(&self, region: &RegionId) -> Result<SharedStore>;
}
