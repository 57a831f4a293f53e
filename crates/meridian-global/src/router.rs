//! Global request router.
//!
//! A [`GlobalRequestRouter`] is bound to one table and one local region. It
//! sends eventually consistent reads and writes to the local replica and
//! strongly consistent ones to the table's master replica, and stamps every
//! write with origin, timestamp and a bumped version vector.

use crate::error::{GlobalError, Result};
use async_trait::async_trait;
use meridian_core::{system, Item, Lease, RegionId, SharedClock, VersionVector};
use meridian_store::{
    AttributeUpdate, Consistency, RegionDirectory, ScanFilter, SharedStore,
};
use parking_lot::{Mutex, RwLock};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

/// Where a managed router learns the current master of its table.
///
/// Implemented by [`MetadataStore`](crate::metadata::MetadataStore).
#[async_trait]
pub trait MasterLookup: Send + Sync + 'static {
    /// Current master region of `table`, if the table exists.
    async fn master_of(&self, table: &str) -> Result<Option<RegionId>>;

    /// The runtime mastership lease of `table`.
    fn lease_for(&self, table: &str) -> Arc<Lease>;
}

/// How a router finds its master replica.
#[derive(Clone)]
pub enum MasterSource {
    /// A fixed master with no lease-based discovery. Used to bootstrap the
    /// metadata table, whose master cannot itself come from metadata.
    Fixed(RegionId),
    /// Master discovered through metadata, refreshed when the lease may
    /// have expired.
    Managed(Arc<dyn MasterLookup>),
}

impl std::fmt::Debug for MasterSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MasterSource::Fixed(region) => f.debug_tuple("Fixed").field(region).finish(),
            MasterSource::Managed(_) => f.write_str("Managed"),
        }
    }
}

/// Striped per-key write locks.
///
/// The stored-version read, bump and write of one key in one region run
/// under the key's stripe, so writers sharing the locks never lose a bump.
pub struct KeyLocks {
    stripes: Vec<tokio::sync::Mutex<()>>,
}

impl KeyLocks {
    pub const DEFAULT_STRIPES: usize = 64;

    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1))
                .map(|_| tokio::sync::Mutex::new(()))
                .collect(),
        }
    }

    pub async fn lock(&self, region: &RegionId, key: &str) -> tokio::sync::MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        region.hash(&mut hasher);
        key.hash(&mut hasher);
        let idx = (hasher.finish() % self.stripes.len() as u64) as usize;
        self.stripes[idx].lock().await
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(Self::DEFAULT_STRIPES)
    }
}

#[derive(Clone)]
struct MasterEndpoint {
    region: RegionId,
    store: SharedStore,
}

/// Routes reads and writes of one table from one region.
pub struct GlobalRequestRouter {
    table: String,
    key_name: String,
    local_region: RegionId,
    local: SharedStore,
    directory: Arc<dyn RegionDirectory>,
    source: MasterSource,
    clock: SharedClock,
    master: RwLock<Option<MasterEndpoint>>,
    lease: Mutex<Option<Arc<Lease>>>,
    locks: Arc<KeyLocks>,
}

impl GlobalRequestRouter {
    /// Create a router for `table` running in `local_region`.
    ///
    /// The primary key attribute is read from the local replica's schema.
    /// The master is not resolved until the first strong operation.
    pub async fn new(
        table: impl Into<String>,
        local_region: RegionId,
        source: MasterSource,
        directory: Arc<dyn RegionDirectory>,
        clock: SharedClock,
    ) -> Result<Self> {
        let table = table.into();
        let local = directory.connect(&local_region)?;
        let key_name = local.describe_key_schema(&table).await?;
        debug!(table = %table, region = %local_region, ?source, "router created");

        Ok(Self {
            table,
            key_name,
            local_region,
            local,
            directory,
            source,
            clock,
            master: RwLock::new(None),
            lease: Mutex::new(None),
            locks: Arc::new(KeyLocks::default()),
        })
    }

    /// Share write locks with other routers of the same table and region.
    pub fn with_write_locks(mut self, locks: Arc<KeyLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    pub fn local_region(&self) -> &RegionId {
        &self.local_region
    }

    /// Master region as last discovered, if any.
    pub fn cached_master(&self) -> Option<RegionId> {
        self.master.read().as_ref().map(|m| m.region.clone())
    }

    /// Read an item. Strong reads go to the master, eventual reads to the
    /// local replica and may be stale.
    pub async fn get_item(&self, key: &str, consistency: Consistency) -> Result<Option<Item>> {
        let (region, store) = self.select(consistency).await?;
        debug!(table = %self.table, key, %region, ?consistency, "get_item");
        Ok(store.get_item(&self.table, key, consistency).await?)
    }

    /// Scan the replica chosen by `consistency`.
    pub async fn scan(&self, filter: &ScanFilter, consistency: Consistency) -> Result<Vec<Item>> {
        let (_, store) = self.select(consistency).await?;
        Ok(store.scan(&self.table, filter, consistency).await?)
    }

    /// Write a whole item and return it as committed, system attributes
    /// included.
    pub async fn put_item(&self, mut item: Item, consistency: Consistency) -> Result<Item> {
        let key = self.primary_key(&item)?;
        let (region, store) = self.select(consistency).await?;
        let _guard = self.locks.lock(&region, &key).await;

        let version = self.next_version(&store, &key, &region).await?;
        item.stamp(&region, self.clock.now_millis(), &version);
        let committed = store.put_item(&self.table, item).await?;

        debug!(table = %self.table, key = %key, %region, version = ?version.to_map(), "put_item committed");
        Ok(committed)
    }

    /// Write a whole item only if no item with its key exists in the chosen
    /// replica. The existence check and the write run under the key's lock.
    /// Returns `None` and writes nothing when the key is taken.
    pub async fn put_item_if_absent(
        &self,
        mut item: Item,
        consistency: Consistency,
    ) -> Result<Option<Item>> {
        let key = self.primary_key(&item)?;
        let (region, store) = self.select(consistency).await?;
        let _guard = self.locks.lock(&region, &key).await;

        if store.get_item(&self.table, &key, Consistency::Strong).await?.is_some() {
            debug!(table = %self.table, key = %key, %region, "put_item_if_absent: key exists");
            return Ok(None);
        }
        let mut version = VersionVector::new();
        version.bump(&region);
        item.stamp(&region, self.clock.now_millis(), &version);
        let committed = store.put_item(&self.table, item).await?;

        debug!(table = %self.table, key = %key, %region, "put_item_if_absent committed");
        Ok(Some(committed))
    }

    /// Apply partial updates to an item together with fresh system
    /// attributes, as one write.
    pub async fn update_item(
        &self,
        key: &str,
        updates: Vec<AttributeUpdate>,
        consistency: Consistency,
    ) -> Result<Item> {
        if let Some(reserved) = updates.iter().find(|u| system::is_reserved(&u.name)) {
            return Err(GlobalError::ReservedAttribute(reserved.name.clone()));
        }

        let (region, store) = self.select(consistency).await?;
        let _guard = self.locks.lock(&region, key).await;

        let version = self.next_version(&store, key, &region).await?;
        let mut updates = updates;
        updates.push(AttributeUpdate::put(
            system::TIMESTAMP,
            meridian_core::item::clamp_timestamp(self.clock.now_millis()),
        ));
        updates.push(AttributeUpdate::put(system::ORIGIN, region.as_str()));
        updates.push(AttributeUpdate::put(system::VERSION, version.to_attribute()));
        let committed = store.update_item(&self.table, key, &updates).await?;

        debug!(table = %self.table, key, %region, version = ?version.to_map(), "update_item committed");
        Ok(committed)
    }

    /// Primary key of a client item, which must not carry system attributes.
    fn primary_key(&self, item: &Item) -> Result<String> {
        if let Some(reserved) = item.reserved_attributes().first() {
            return Err(GlobalError::ReservedAttribute(reserved.to_string()));
        }
        item.get_string(&self.key_name)
            .map(str::to_string)
            .ok_or_else(|| GlobalError::MissingPrimaryKey(self.key_name.clone()))
    }

    /// Pick the replica for an operation: master for strong, local otherwise.
    async fn select(&self, consistency: Consistency) -> Result<(RegionId, SharedStore)> {
        match consistency {
            Consistency::Eventual => Ok((self.local_region.clone(), self.local.clone())),
            Consistency::Strong => {
                let master = self.refresh_master().await?;
                Ok((master.region, master.store))
            }
        }
    }

    /// Current stored version of `key` in `store`, bumped for `region`.
    ///
    /// Not atomic with respect to writers in other processes sharing the
    /// replica; those races surface later as conflicts.
    async fn next_version(
        &self,
        store: &SharedStore,
        key: &str,
        region: &RegionId,
    ) -> Result<VersionVector> {
        let stored = store.get_item(&self.table, key, Consistency::Strong).await?;
        let mut version = stored.map(|item| item.version()).unwrap_or_default();
        version.bump(region);
        Ok(version)
    }

    /// Resolve the master endpoint, rediscovering it when nothing is cached
    /// or the lease may have expired. Never waits on the lease itself.
    async fn refresh_master(&self) -> Result<MasterEndpoint> {
        let cached = self.master.read().clone();

        let lookup = match &self.source {
            MasterSource::Fixed(region) => {
                if let Some(endpoint) = cached {
                    return Ok(endpoint);
                }
                let endpoint = MasterEndpoint {
                    region: region.clone(),
                    store: self.directory.connect(region)?,
                };
                *self.master.write() = Some(endpoint.clone());
                return Ok(endpoint);
            }
            MasterSource::Managed(lookup) => lookup.clone(),
        };

        let lease = self.lease(lookup.as_ref());
        if let Some(endpoint) = &cached {
            if !lease.maybe_expired() {
                return Ok(endpoint.clone());
            }
        }

        let current = lookup
            .master_of(&self.table)
            .await?
            .ok_or_else(|| GlobalError::TableNotFound(self.table.clone()))?;

        if let Some(endpoint) = cached {
            if endpoint.region == current {
                return Ok(endpoint);
            }
        }

        let endpoint = MasterEndpoint {
            store: self.directory.connect(&current)?,
            region: current,
        };
        debug!(table = %self.table, master = %endpoint.region, "master endpoint changed");
        *self.master.write() = Some(endpoint.clone());
        Ok(endpoint)
    }

    fn lease(&self, lookup: &dyn MasterLookup) -> Arc<Lease> {
        self.lease
            .lock()
            .get_or_insert_with(|| lookup.lease_for(&self.table))
            .clone()
    }
}
