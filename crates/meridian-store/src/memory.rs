//! In-memory replicas for testing and simulation.

use crate::error::{Result, StoreError};
use crate::request::{apply_updates, AttributeUpdate, Consistency, ScanFilter};
use crate::store::{ItemStore, RegionDirectory, SharedStore};
use async_trait::async_trait;
use meridian_core::{Item, RegionId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
struct MemoryTable {
    key_attribute: String,
    items: BTreeMap<String, Item>,
}

/// A single-region replica holding its tables in memory.
///
/// There is only one copy of each item, so every read is strongly
/// consistent regardless of the requested consistency.
#[derive(Debug)]
pub struct MemoryItemStore {
    region: RegionId,
    tables: RwLock<HashMap<String, MemoryTable>>,
    available: AtomicBool,
    put_failures: Mutex<HashSet<(String, String)>>,
    latency: Option<Duration>,
}

impl MemoryItemStore {
    pub fn new(region: RegionId) -> Self {
        Self {
            region,
            tables: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            put_failures: Mutex::new(HashSet::new()),
            latency: None,
        }
    }

    /// Delay every call by `latency`, to interleave concurrent callers.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every call fail with [`StoreError::Unavailable`] until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next write of `key` in `table` once.
    pub fn fail_next_put(&self, table: &str, key: &str) {
        self.put_failures
            .lock()
            .insert((table.to_string(), key.to_string()));
    }

    /// Snapshot of a table's items in key order.
    pub fn items(&self, table: &str) -> Vec<Item> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.items.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of items in a table.
    pub fn len(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.items.len())
    }

    async fn enter(&self) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(self.region.to_string()))
        }
    }

    fn check_injected_failure(&self, table: &str, key: &str) -> Result<()> {
        let injected = self
            .put_failures
            .lock()
            .remove(&(table.to_string(), key.to_string()));
        if injected {
            debug!(region = %self.region, table, key, "injected write failure");
            return Err(StoreError::Unavailable(format!(
                "{}: injected failure writing {}",
                self.region, key
            )));
        }
        Ok(())
    }

    fn missing(table: &str) -> StoreError {
        StoreError::TableNotFound(table.to_string())
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    fn region(&self) -> &RegionId {
        &self.region
    }

    async fn get_item(
        &self,
        table: &str,
        key: &str,
        _consistency: Consistency,
    ) -> Result<Option<Item>> {
        self.enter().await?;
        let tables = self.tables.read();
        let table = tables.get(table).ok_or_else(|| Self::missing(table))?;
        Ok(table.items.get(key).cloned())
    }

    async fn put_item(&self, table: &str, item: Item) -> Result<Item> {
        self.enter().await?;
        let mut tables = self.tables.write();
        let entry = tables.get_mut(table).ok_or_else(|| Self::missing(table))?;
        let key = item
            .get_string(&entry.key_attribute)
            .ok_or_else(|| StoreError::MissingKey {
                table: table.to_string(),
                key_attribute: entry.key_attribute.clone(),
            })?
            .to_string();
        self.check_injected_failure(table, &key)?;
        entry.items.insert(key, item.clone());
        Ok(item)
    }

    async fn update_item(
        &self,
        table: &str,
        key: &str,
        updates: &[AttributeUpdate],
    ) -> Result<Item> {
        self.enter().await?;
        let mut tables = self.tables.write();
        let entry = tables.get_mut(table).ok_or_else(|| Self::missing(table))?;
        if updates.iter().any(|u| u.name == entry.key_attribute) {
            return Err(StoreError::InvalidUpdate {
                attribute: entry.key_attribute.clone(),
                reason: "primary key cannot be updated".to_string(),
            });
        }
        self.check_injected_failure(table, key)?;

        let mut item = entry
            .items
            .get(key)
            .cloned()
            .unwrap_or_else(|| Item::new().with(entry.key_attribute.clone(), key));
        apply_updates(&mut item, updates)?;
        entry.items.insert(key.to_string(), item.clone());
        Ok(item)
    }

    async fn scan(
        &self,
        table: &str,
        filter: &ScanFilter,
        _consistency: Consistency,
    ) -> Result<Vec<Item>> {
        self.enter().await?;
        let tables = self.tables.read();
        let table = tables.get(table).ok_or_else(|| Self::missing(table))?;
        Ok(table
            .items
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect())
    }

    async fn describe_key_schema(&self, table: &str) -> Result<String> {
        self.enter().await?;
        self.tables
            .read()
            .get(table)
            .map(|t| t.key_attribute.clone())
            .ok_or_else(|| Self::missing(table))
    }

    async fn create_if_absent(&self, table: &str, key_attribute: &str) -> Result<bool> {
        self.enter().await?;
        let mut tables = self.tables.write();
        if tables.contains_key(table) {
            return Ok(false);
        }
        tables.insert(
            table.to_string(),
            MemoryTable {
                key_attribute: key_attribute.to_string(),
                items: BTreeMap::new(),
            },
        );
        debug!(region = %self.region, table, "table created");
        Ok(true)
    }

    async fn delete_if_exists(&self, table: &str) -> Result<bool> {
        self.enter().await?;
        Ok(self.tables.write().remove(table).is_some())
    }

    async fn wait_until_active(&self, table: &str) -> Result<()> {
        self.enter().await?;
        if self.tables.read().contains_key(table) {
            Ok(())
        } else {
            Err(Self::missing(table))
        }
    }
}

/// A set of in-memory regions, one replica each.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    stores: HashMap<RegionId, Arc<MemoryItemStore>>,
}

impl MemoryCluster {
    /// Create one empty replica per region.
    pub fn new<I, R>(regions: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<RegionId>,
    {
        Self::from_stores(
            regions
                .into_iter()
                .map(|r| MemoryItemStore::new(r.into())),
        )
    }

    /// Build a cluster from preconfigured replicas.
    pub fn from_stores(stores: impl IntoIterator<Item = MemoryItemStore>) -> Self {
        Self {
            stores: stores
                .into_iter()
                .map(|s| (s.region().clone(), Arc::new(s)))
                .collect(),
        }
    }

    pub fn store(&self, region: &RegionId) -> Option<Arc<MemoryItemStore>> {
        self.stores.get(region).cloned()
    }

    /// All regions, sorted.
    pub fn regions(&self) -> Vec<RegionId> {
        let mut regions: Vec<_> = self.stores.keys().cloned().collect();
        regions.sort();
        regions
    }

    /// Create `table` in every region.
    pub async fn create_table(&self, table: &str, key_attribute: &str) -> Result<()> {
        for store in self.stores.values() {
            store.create_if_absent(table, key_attribute).await?;
            store.wait_until_active(table).await?;
        }
        Ok(())
    }

    /// True if every region holds exactly the same items in `table`.
    pub fn is_converged(&self, table: &str) -> bool {
        let mut snapshots = self.stores.values().map(|s| s.items(table));
        match snapshots.next() {
            Some(first) => snapshots.all(|s| s == first),
            None => true,
        }
    }
}

impl RegionDirectory for MemoryCluster {
    fn connect(&self, region: &RegionId) -> Result<SharedStore> {
        self.stores
            .get(region)
            .map(|s| s.clone() as SharedStore)
            .ok_or_else(|| StoreError::RegionNotFound(region.to_string()))
    }
}
