//! Global table metadata.
//!
//! One row per global table in the `mrd_metadata` table records its master
//! region and replica set. The metadata table is an ordinary replicated
//! table, written through a router with a fixed master (the configured home
//! region). Mastership leases are process-local and never persisted.

use crate::config::GlobalConfig;
use crate::error::Result;
use crate::router::{GlobalRequestRouter, KeyLocks, MasterLookup, MasterSource};
use async_trait::async_trait;
use meridian_core::{AttributeValue, Item, Lease, RegionId, SharedClock};
use meridian_store::{AttributeUpdate, Consistency, RegionDirectory, ScanFilter};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the metadata table in every metadata replica region.
pub const METADATA_TABLE: &str = "mrd_metadata";
/// Primary key attribute of the metadata table.
pub const TABLE_NAME_ATTR: &str = "table_name";
pub const MASTER_ATTR: &str = "master";
pub const REGIONS_ATTR: &str = "regions";

/// A decoded metadata row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableMetadata {
    pub table_name: String,
    pub master_region: RegionId,
    pub replica_set: BTreeSet<RegionId>,
}

impl TableMetadata {
    /// Decode a metadata row. Rows without a name or master are ignored; a
    /// missing region set reads as empty.
    pub fn from_item(item: &Item) -> Option<Self> {
        Some(Self {
            table_name: item.get_string(TABLE_NAME_ATTR)?.to_string(),
            master_region: RegionId::new(item.get_string(MASTER_ATTR)?),
            replica_set: regions_of(item),
        })
    }
}

/// Regions and master of a table, as needed for replication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableTopology {
    pub regions: BTreeSet<RegionId>,
    pub master: RegionId,
}

fn regions_of(item: &Item) -> BTreeSet<RegionId> {
    item.get(REGIONS_ATTR)
        .and_then(AttributeValue::as_string_set)
        .map(|set| set.iter().map(RegionId::new).collect())
        .unwrap_or_default()
}

fn region_set(region: &RegionId) -> AttributeValue {
    AttributeValue::string_set([region.as_str()])
}

/// Catalog of global tables plus their runtime mastership leases.
///
/// Every router opened through the store, its own included, shares one set
/// of per-key write locks, so strong writers in this process serialize on
/// the master replica.
pub struct MetadataStore {
    config: GlobalConfig,
    router: GlobalRequestRouter,
    directory: Arc<dyn RegionDirectory>,
    clock: SharedClock,
    leases: RwLock<HashMap<String, Arc<Lease>>>,
    locks: Arc<KeyLocks>,
}

impl MetadataStore {
    /// Validate `config`, ensure the metadata table exists in every metadata
    /// replica region, and open a router on it.
    pub async fn open(
        config: GlobalConfig,
        directory: Arc<dyn RegionDirectory>,
        clock: SharedClock,
    ) -> Result<Self> {
        config.validate()?;

        for region in &config.metadata.replica_regions {
            let store = directory.connect(region)?;
            if store.create_if_absent(METADATA_TABLE, TABLE_NAME_ATTR).await? {
                info!(%region, "metadata table created");
            }
            store.wait_until_active(METADATA_TABLE).await?;
        }

        let home = config.metadata.home_region.clone();
        let local = if config.metadata.replica_regions.contains(&config.local_region) {
            config.local_region.clone()
        } else {
            home.clone()
        };
        let locks = Arc::new(KeyLocks::default());
        let router = GlobalRequestRouter::new(
            METADATA_TABLE,
            local,
            MasterSource::Fixed(home),
            directory.clone(),
            clock.clone(),
        )
        .await?
        .with_write_locks(locks.clone());

        Ok(Self {
            config,
            router,
            directory,
            clock,
            leases: RwLock::new(HashMap::new()),
            locks,
        })
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn directory(&self) -> Arc<dyn RegionDirectory> {
        self.directory.clone()
    }

    pub fn clock(&self) -> SharedClock {
        self.clock.clone()
    }

    /// Regions holding the metadata table itself.
    pub fn metadata_regions(&self) -> Vec<RegionId> {
        self.config.metadata.replica_regions.clone()
    }

    /// Register a global table with `initial_region` as master and sole
    /// replica. Returns false if it is already registered.
    pub async fn create_table(&self, name: &str, initial_region: &RegionId) -> Result<bool> {
        let row = Item::new()
            .with(TABLE_NAME_ATTR, name)
            .with(MASTER_ATTR, initial_region.as_str())
            .with(REGIONS_ATTR, region_set(initial_region));
        if self.router.put_item_if_absent(row, Consistency::Strong).await?.is_none() {
            debug!(table = name, "global table already registered");
            return Ok(false);
        }
        info!(table = name, master = %initial_region, "global table registered");
        Ok(true)
    }

    /// Add a replica region. Returns false if the table is not registered.
    pub async fn add_region(&self, name: &str, region: &RegionId) -> Result<bool> {
        if !self.exists(name).await? {
            return Ok(false);
        }
        self.router
            .update_item(
                name,
                vec![AttributeUpdate::add(REGIONS_ATTR, region_set(region))],
                Consistency::Strong,
            )
            .await?;
        info!(table = name, %region, "replica region added");
        Ok(true)
    }

    /// Remove a replica region. Returns false if the table is not registered.
    pub async fn remove_region(&self, name: &str, region: &RegionId) -> Result<bool> {
        if !self.exists(name).await? {
            return Ok(false);
        }
        self.router
            .update_item(
                name,
                vec![AttributeUpdate::delete_elements(REGIONS_ATTR, region_set(region))],
                Consistency::Strong,
            )
            .await?;
        info!(table = name, %region, "replica region removed");
        Ok(true)
    }

    pub async fn list_regions(&self, name: &str) -> Result<Option<BTreeSet<RegionId>>> {
        Ok(self.read(name).await?.map(|row| regions_of(&row)))
    }

    pub async fn get_master(&self, name: &str) -> Result<Option<RegionId>> {
        Ok(self
            .read(name)
            .await?
            .and_then(|row| row.get_string(MASTER_ATTR).map(RegionId::new)))
    }

    /// Record a new master. Administrative: the lease is not consulted.
    pub async fn set_master(&self, name: &str, region: &RegionId) -> Result<bool> {
        if !self.exists(name).await? {
            return Ok(false);
        }
        self.router
            .update_item(
                name,
                vec![AttributeUpdate::put(MASTER_ATTR, region.as_str())],
                Consistency::Strong,
            )
            .await?;
        info!(table = name, master = %region, "master changed");
        Ok(true)
    }

    pub async fn get_table(&self, name: &str) -> Result<Option<TableMetadata>> {
        Ok(self.read(name).await?.as_ref().and_then(TableMetadata::from_item))
    }

    /// All registered tables, by name.
    pub async fn list_tables(&self) -> Result<Vec<TableMetadata>> {
        let rows = self
            .router
            .scan(&ScanFilter::all(), self.config.metadata.read_consistency)
            .await?;
        let mut tables: Vec<_> = rows.iter().filter_map(TableMetadata::from_item).collect();
        tables.sort_by(|a, b| a.table_name.cmp(&b.table_name));
        Ok(tables)
    }

    /// Replica set and master of `name`. The metadata table reports the
    /// configured metadata replicas with the home region as master.
    pub async fn topology(&self, name: &str) -> Result<Option<TableTopology>> {
        if name == METADATA_TABLE {
            return Ok(Some(TableTopology {
                regions: self.config.metadata.replica_regions.iter().cloned().collect(),
                master: self.config.metadata.home_region.clone(),
            }));
        }
        Ok(self.get_table(name).await?.map(|table| TableTopology {
            regions: table.replica_set,
            master: table.master_region,
        }))
    }

    /// The runtime lease for `name`, created unheld on first access.
    pub fn get_lease(&self, name: &str) -> Arc<Lease> {
        if let Some(lease) = self.leases.read().get(name) {
            return lease.clone();
        }
        self.leases
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Lease::new(self.config.lease.clone(), self.clock.clone())))
            .clone()
    }

    /// Acquire or renew the lease of `name` for `region` and record it as
    /// master. Returns false if the lease is held elsewhere or the table is
    /// not registered.
    pub async fn acquire_mastership(&self, name: &str, region: &RegionId) -> Result<bool> {
        let lease = self.get_lease(name);
        if !(lease.acquire(region) || lease.renew(region)) {
            debug!(table = name, %region, owner = ?lease.owner(), "mastership contended");
            return Ok(false);
        }
        if self.get_master(name).await?.as_ref() == Some(region) {
            return Ok(true);
        }
        if !self.set_master(name, region).await? {
            lease.release(region);
            return Ok(false);
        }
        Ok(true)
    }

    /// Give up the lease of `name`. The recorded master is left as is.
    pub fn release_mastership(&self, name: &str, region: &RegionId) -> bool {
        self.get_lease(name).release(region)
    }

    /// Open a lease-aware router on `table` in `local_region`, sharing this
    /// store's write locks.
    pub async fn router(
        self: &Arc<Self>,
        table: &str,
        local_region: RegionId,
    ) -> Result<GlobalRequestRouter> {
        Ok(GlobalRequestRouter::new(
            table,
            local_region,
            MasterSource::Managed(self.clone()),
            self.directory.clone(),
            self.clock.clone(),
        )
        .await?
        .with_write_locks(self.locks.clone()))
    }

    /// The write locks shared by every router this store opens.
    pub fn write_locks(&self) -> Arc<KeyLocks> {
        self.locks.clone()
    }

    async fn read(&self, name: &str) -> Result<Option<Item>> {
        self.router
            .get_item(name, self.config.metadata.read_consistency)
            .await
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .router
            .get_item(name, Consistency::Strong)
            .await?
            .is_some())
    }
}

#[async_trait]
impl MasterLookup for MetadataStore {
    async fn master_of(&self, table: &str) -> Result<Option<RegionId>> {
        self.get_master(table).await
    }

    fn lease_for(&self, table: &str) -> Arc<Lease> {
        self.get_lease(table)
    }
}
