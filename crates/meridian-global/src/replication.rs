//! Incremental pull replication between regions.
//!
//! For every ordered pair (target, source) of a table's regions the engine
//! keeps a watermark: the highest writer timestamp of a source-originated
//! item already pulled into the target. A pull scans the source for items
//! it originated after the watermark and applies each to the target:
//!
//! 1. concurrent copies are settled by the [`ConflictResolver`];
//! 2. otherwise the [`ApplyPolicy`] decides whether the source copy replaces
//!    the target's.
//!
//! Watermarks live in memory only. The first pull of a table bootstraps them
//! from a full scan of every replica, so a restarted engine resumes without
//! re-applying what each target already holds.

use crate::config::{ApplyPolicy, ReplicationConfig};
use crate::error::{GlobalError, Result};
use crate::metadata::{MetadataStore, METADATA_TABLE};
use meridian_core::item::clamp_timestamp;
use meridian_core::{system, ConflictResolver, Item, RegionId, Side};
use meridian_store::{Consistency, RegionDirectory, ScanFilter, SharedStore};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one pull from a source region into a target region.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PullReport {
    /// Items the source originated after the watermark.
    pub scanned: usize,
    /// Items written to the target.
    pub applied: usize,
    /// Scanned items concurrent with the target's copy.
    pub conflicts: usize,
    /// Conflicts the source copy won (and was applied).
    pub conflicts_won: usize,
    /// Items the target already held an equal or newer copy of.
    pub stale_skipped: usize,
    /// Items that could not be read from or written to the target.
    pub failed: usize,
    /// Watermark after the pull. In a report summed over several pairs,
    /// the lowest watermark among them.
    pub watermark: u64,
}

impl PullReport {
    fn absorb(&mut self, other: &PullReport) {
        self.scanned += other.scanned;
        self.applied += other.applied;
        self.conflicts += other.conflicts;
        self.conflicts_won += other.conflicts_won;
        self.stale_skipped += other.stale_skipped;
        self.failed += other.failed;
    }
}

/// Cumulative counters over an engine's lifetime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationStats {
    pub pulls: u64,
    pub scanned: u64,
    pub applied: u64,
    pub conflicts: u64,
    pub conflicts_won: u64,
    pub stale_skipped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    pulls: AtomicU64,
    scanned: AtomicU64,
    applied: AtomicU64,
    conflicts: AtomicU64,
    conflicts_won: AtomicU64,
    stale_skipped: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn record(&self, report: &PullReport) {
        self.pulls.fetch_add(1, Ordering::Relaxed);
        self.scanned.fetch_add(report.scanned as u64, Ordering::Relaxed);
        self.applied.fetch_add(report.applied as u64, Ordering::Relaxed);
        self.conflicts.fetch_add(report.conflicts as u64, Ordering::Relaxed);
        self.conflicts_won
            .fetch_add(report.conflicts_won as u64, Ordering::Relaxed);
        self.stale_skipped
            .fetch_add(report.stale_skipped as u64, Ordering::Relaxed);
        self.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ReplicationStats {
        ReplicationStats {
            pulls: self.pulls.load(Ordering::Relaxed),
            scanned: self.scanned.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            conflicts_won: self.conflicts_won.load(Ordering::Relaxed),
            stale_skipped: self.stale_skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

type Pair = (RegionId, RegionId);

/// Watermarks of one table, keyed by (target, source).
///
/// Each pair has its own lock, held for the whole pull, so one pair never
/// runs twice at once while different pairs proceed in parallel.
#[derive(Default)]
struct TableWatermarks {
    pairs: RwLock<HashMap<Pair, Arc<tokio::sync::Mutex<u64>>>>,
}

impl TableWatermarks {
    fn pair(&self, target: &RegionId, source: &RegionId) -> Arc<tokio::sync::Mutex<u64>> {
        let key = (target.clone(), source.clone());
        if let Some(mark) = self.pairs.read().get(&key) {
            return mark.clone();
        }
        self.pairs
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(0)))
            .clone()
    }
}

enum Applied {
    Written,
    Stale,
    ConflictWon,
    ConflictLost,
}

/// Pulls updates between the replicas of global tables.
pub struct ReplicationEngine {
    metadata: Arc<MetadataStore>,
    directory: Arc<dyn RegionDirectory>,
    config: ReplicationConfig,
    resolver: ConflictResolver,
    watermarks: tokio::sync::Mutex<HashMap<String, Arc<TableWatermarks>>>,
    counters: Counters,
}

impl ReplicationEngine {
    /// Create an engine using the replication settings of the metadata
    /// store's configuration.
    pub fn new(metadata: Arc<MetadataStore>) -> Self {
        let config = metadata.config().replication.clone();
        Self::with_config(metadata, config)
    }

    pub fn with_config(metadata: Arc<MetadataStore>, config: ReplicationConfig) -> Self {
        Self {
            directory: metadata.directory(),
            metadata,
            config,
            resolver: ConflictResolver::new(),
            watermarks: tokio::sync::Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Pull from `source` into `target` and return the number of items
    /// scanned.
    pub async fn pull_items(
        &self,
        table: &str,
        target: &RegionId,
        source: &RegionId,
    ) -> Result<usize> {
        Ok(self.pull(table, target, source).await?.scanned)
    }

    /// Pull from `source` into `target`, reporting what happened per item.
    ///
    /// Errors reading the source propagate. Errors on single items are
    /// counted in [`PullReport::failed`] and the watermark stays below the
    /// earliest failed item, so the next pull retries it.
    pub async fn pull(&self, table: &str, target: &RegionId, source: &RegionId) -> Result<PullReport> {
        let topology = self
            .metadata
            .topology(table)
            .await?
            .ok_or_else(|| GlobalError::TableNotFound(table.to_string()))?;
        let marks = self.table_watermarks(table, &topology.regions).await?;
        let pair = marks.pair(target, source);
        let mut watermark = pair.lock().await;
        let last_sync = *watermark;

        let source_store = self.directory.connect(source)?;
        let target_store = self.directory.connect(target)?;
        let key_name = source_store.describe_key_schema(table).await?;

        let filter = ScanFilter::all()
            .eq(system::ORIGIN, source.as_str())
            .gt(system::TIMESTAMP, clamp_timestamp(last_sync));
        let mut items = source_store
            .scan(table, &filter, self.config.scan_consistency)
            .await?;
        items.sort_by_key(Item::timestamp);

        let mut report = PullReport {
            scanned: items.len(),
            ..PullReport::default()
        };
        let mut earliest_failure: Option<u64> = None;

        for item in items.iter() {
            let outcome = match item.get_string(&key_name) {
                Some(key) => {
                    self.apply(table, key, item, &target_store, &topology.master)
                        .await
                }
                None => Err(GlobalError::MissingPrimaryKey(key_name.clone())),
            };
            match outcome {
                Ok(Applied::Written) => report.applied += 1,
                Ok(Applied::Stale) => report.stale_skipped += 1,
                Ok(Applied::ConflictWon) => {
                    report.conflicts += 1;
                    report.conflicts_won += 1;
                    report.applied += 1;
                }
                Ok(Applied::ConflictLost) => report.conflicts += 1,
                Err(err) => {
                    report.failed += 1;
                    earliest_failure.get_or_insert(item.timestamp());
                    warn!(
                        table,
                        %target,
                        %source,
                        key = item.get_string(&key_name).unwrap_or_default(),
                        error = %err,
                        "failed to replicate item"
                    );
                }
            }
        }

        let reached = match earliest_failure {
            Some(ts) => ts.saturating_sub(1),
            None => items.last().map_or(last_sync, Item::timestamp),
        };
        *watermark = last_sync.max(reached);
        report.watermark = *watermark;
        drop(watermark);

        self.counters.record(&report);
        if report.scanned > 0 {
            info!(
                table,
                %target,
                %source,
                scanned = report.scanned,
                applied = report.applied,
                conflicts = report.conflicts,
                failed = report.failed,
                watermark = report.watermark,
                "pull complete"
            );
        }
        Ok(report)
    }

    /// Pull between every ordered pair of distinct regions of `table`.
    ///
    /// Every pair is attempted; the first error is returned after all pairs
    /// have run.
    pub async fn sync_replicas(&self, table: &str) -> Result<usize> {
        Ok(self.sync_report(table).await?.scanned)
    }

    /// Like [`sync_replicas`](Self::sync_replicas) with the summed report.
    pub async fn sync_report(&self, table: &str) -> Result<PullReport> {
        let topology = self
            .metadata
            .topology(table)
            .await?
            .ok_or_else(|| GlobalError::TableNotFound(table.to_string()))?;

        let mut total = PullReport::default();
        let mut lowest: Option<u64> = None;
        let mut first_error = None;
        for target in &topology.regions {
            for source in &topology.regions {
                if target == source {
                    continue;
                }
                match self.pull(table, target, source).await {
                    Ok(report) => {
                        total.absorb(&report);
                        let mark = report.watermark;
                        lowest = Some(lowest.map_or(mark, |low| low.min(mark)));
                    }
                    Err(err) => {
                        warn!(table, %target, %source, error = %err, "pull failed");
                        first_error.get_or_insert(err);
                    }
                }
            }
        }
        total.watermark = lowest.unwrap_or_default();
        match first_error {
            Some(err) => Err(err),
            None => Ok(total),
        }
    }

    /// Replicate the metadata table across the metadata replica regions.
    pub async fn sync_metadata(&self) -> Result<usize> {
        self.sync_replicas(METADATA_TABLE).await
    }

    /// Current watermark of a pair, if the table has been bootstrapped.
    pub async fn watermark(&self, table: &str, target: &RegionId, source: &RegionId) -> Option<u64> {
        let marks = self.watermarks.lock().await.get(table).cloned()?;
        let pair = marks.pair(target, source);
        let value = *pair.lock().await;
        Some(value)
    }

    /// Forget the watermarks of `table`; the next pull bootstraps again.
    pub async fn reset(&self, table: &str) {
        if self.watermarks.lock().await.remove(table).is_some() {
            debug!(table, "watermarks reset");
        }
    }

    pub fn stats(&self) -> ReplicationStats {
        self.counters.snapshot()
    }

    async fn apply(
        &self,
        table: &str,
        key: &str,
        item: &Item,
        target: &SharedStore,
        master: &RegionId,
    ) -> Result<Applied> {
        let existing = target.get_item(table, key, Consistency::Strong).await?;

        if let Some(current) = existing
            .as_ref()
            .filter(|current| self.resolver.is_conflict(Some(item), Some(*current)))
        {
            let resolution = self.resolver.resolve(item, current, master);
            let source_wins = resolution.winner == Side::First;
            info!(
                table,
                key,
                target = %target.region(),
                incoming = ?item.version().to_map(),
                current = ?current.version().to_map(),
                rule = ?resolution.kind,
                source_wins,
                "conflict detected"
            );
            if !source_wins {
                return Ok(Applied::ConflictLost);
            }
            target.put_item(table, item.clone()).await?;
            return Ok(Applied::ConflictWon);
        }

        let newer = match (&existing, self.config.apply_policy) {
            (_, ApplyPolicy::Always) | (None, _) => true,
            (Some(current), ApplyPolicy::SourceDominates) => {
                item.version().strictly_dominates(&current.version())
            }
        };
        if !newer {
            return Ok(Applied::Stale);
        }
        target.put_item(table, item.clone()).await?;
        Ok(Applied::Written)
    }

    /// Watermarks of `table`, bootstrapped on first use from a full scan of
    /// every replica: for each (target, origin) the highest timestamp the
    /// target holds. An unreachable replica is skipped and its pairs start
    /// at 0.
    async fn table_watermarks(
        &self,
        table: &str,
        regions: &BTreeSet<RegionId>,
    ) -> Result<Arc<TableWatermarks>> {
        let mut tables = self.watermarks.lock().await;
        if let Some(marks) = tables.get(table) {
            return Ok(marks.clone());
        }

        let mut highest: HashMap<Pair, u64> = HashMap::new();
        for target in regions {
            let store = self.directory.connect(target)?;
            let items = match store.scan(table, &ScanFilter::all(), Consistency::Strong).await {
                Ok(items) => items,
                Err(err) if err.is_retryable() => {
                    warn!(table, %target, error = %err, "replica unreachable, watermarks start at 0");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            for item in &items {
                let Some(origin) = item.origin() else {
                    continue;
                };
                if &origin == target || !regions.contains(&origin) {
                    continue;
                }
                let mark = highest.entry((target.clone(), origin)).or_insert(0);
                *mark = (*mark).max(item.timestamp());
            }
        }

        let pairs = highest
            .into_iter()
            .map(|(pair, ts)| (pair, Arc::new(tokio::sync::Mutex::new(ts))))
            .collect();
        let marks = Arc::new(TableWatermarks {
            pairs: RwLock::new(pairs),
        });
        debug!(table, regions = regions.len(), "watermarks bootstrapped");
        tables.insert(table.to_string(), marks.clone());
        Ok(marks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalConfigBuilder;
    use crate::router::{GlobalRequestRouter, MasterSource};
    use meridian_core::{ManualClock, VersionVector};
    use meridian_store::{ItemStore, MemoryCluster};

    const TABLE: &str = "movies";
    const START: u64 = 1_000_000_000;

    fn r(name: &str) -> RegionId {
        RegionId::new(name)
    }

    struct Fixture {
        cluster: Arc<MemoryCluster>,
        clock: Arc<ManualClock>,
        engine: ReplicationEngine,
    }

    async fn fixture(policy: ApplyPolicy) -> Fixture {
        let cluster = Arc::new(MemoryCluster::new(["a", "b"]));
        cluster.create_table(TABLE, "name").await.unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let config = GlobalConfigBuilder::new()
            .local_region("a")
            .metadata_home("a")
            .metadata_replicas(["a"])
            .apply_policy(policy)
            .build();
        let metadata = Arc::new(
            MetadataStore::open(config, cluster.clone(), clock.clone())
                .await
                .unwrap(),
        );
        metadata.create_table(TABLE, &r("a")).await.unwrap();
        metadata.add_region(TABLE, &r("b")).await.unwrap();
        Fixture {
            engine: ReplicationEngine::new(metadata),
            cluster,
            clock,
        }
    }

    async fn local_router(f: &Fixture, region: &str) -> GlobalRequestRouter {
        GlobalRequestRouter::new(
            TABLE,
            r(region),
            MasterSource::Fixed(r("a")),
            f.cluster.clone(),
            f.clock.clone(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_pull_applies_and_advances_watermark() {
        let f = fixture(ApplyPolicy::SourceDominates).await;
        let a = local_router(&f, "a").await;
        a.put_item(Item::new().with("name", "x"), Consistency::Eventual)
            .await
            .unwrap();
        f.clock.advance(10);
        a.put_item(Item::new().with("name", "y"), Consistency::Eventual)
            .await
            .unwrap();

        let report = f.engine.pull(TABLE, &r("b"), &r("a")).await.unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.applied, 2);
        assert_eq!(report.watermark, START + 10);
        assert_eq!(f.engine.watermark(TABLE, &r("b"), &r("a")).await, Some(START + 10));
        assert!(f.cluster.is_converged(TABLE));

        assert_eq!(f.engine.pull_items(TABLE, &r("b"), &r("a")).await.unwrap(), 0);
        assert_eq!(f.engine.stats().pulls, 2);
    }

    #[tokio::test]
    async fn test_stale_copy_is_not_applied_by_default() {
        let f = fixture(ApplyPolicy::SourceDominates).await;
        let b_store = f.cluster.store(&r("b")).unwrap();

        // b holds a newer copy of an item a originated
        let mut older = Item::new().with("name", "x").with("v", 1);
        older.stamp(&r("a"), START, &VersionVector::for_region(&r("a")));
        let mut newer = Item::new().with("name", "x").with("v", 2);
        let mut version = VersionVector::for_region(&r("a"));
        version.bump(&r("b"));
        newer.stamp(&r("b"), START + 5, &version);
        f.cluster
            .store(&r("a"))
            .unwrap()
            .put_item(TABLE, older)
            .await
            .unwrap();
        b_store.put_item(TABLE, newer.clone()).await.unwrap();

        // bootstrap sees no a-originated item in b, so the older copy is scanned
        let report = f.engine.pull(TABLE, &r("b"), &r("a")).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.stale_skipped, 1);
        assert_eq!(b_store.items(TABLE), vec![newer]);
    }

    #[tokio::test]
    async fn test_always_policy_overwrites() {
        let f = fixture(ApplyPolicy::Always).await;
        let mut older = Item::new().with("name", "x").with("v", 1);
        older.stamp(&r("a"), START, &VersionVector::for_region(&r("a")));
        let mut newer = Item::new().with("name", "x").with("v", 2);
        let mut version = VersionVector::for_region(&r("a"));
        version.bump(&r("b"));
        newer.stamp(&r("b"), START + 5, &version);
        f.cluster
            .store(&r("a"))
            .unwrap()
            .put_item(TABLE, older.clone())
            .await
            .unwrap();
        f.cluster
            .store(&r("b"))
            .unwrap()
            .put_item(TABLE, newer)
            .await
            .unwrap();

        let report = f.engine.pull(TABLE, &r("b"), &r("a")).await.unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(f.cluster.store(&r("b")).unwrap().items(TABLE), vec![older]);
    }

    #[tokio::test]
    async fn test_failed_item_holds_watermark_back() {
        let f = fixture(ApplyPolicy::SourceDominates).await;
        let a = local_router(&f, "a").await;
        for (offset, name) in [(0, "x"), (10, "y"), (20, "z")] {
            f.clock.set(START + offset);
            a.put_item(Item::new().with("name", name), Consistency::Eventual)
                .await
                .unwrap();
        }
        f.cluster.store(&r("b")).unwrap().fail_next_put(TABLE, "y");

        let report = f.engine.pull(TABLE, &r("b"), &r("a")).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.applied, 2);
        assert_eq!(report.watermark, START + 9);

        let retry = f.engine.pull(TABLE, &r("b"), &r("a")).await.unwrap();
        assert_eq!(retry.scanned, 2);
        assert_eq!(retry.applied, 1);
        assert_eq!(retry.stale_skipped, 1);
        assert_eq!(retry.watermark, START + 20);
        assert!(f.cluster.is_converged(TABLE));
    }

    #[tokio::test]
    async fn test_bootstrap_and_reset() {
        let f = fixture(ApplyPolicy::SourceDominates).await;
        assert_eq!(f.engine.watermark(TABLE, &r("b"), &r("a")).await, None);

        let a = local_router(&f, "a").await;
        a.put_item(Item::new().with("name", "x"), Consistency::Eventual)
            .await
            .unwrap();
        f.engine.sync_replicas(TABLE).await.unwrap();

        f.engine.reset(TABLE).await;
        assert_eq!(f.engine.watermark(TABLE, &r("b"), &r("a")).await, None);
        // rebuilt from b's contents: nothing is rescanned
        assert_eq!(f.engine.pull_items(TABLE, &r("b"), &r("a")).await.unwrap(), 0);
        assert_eq!(f.engine.watermark(TABLE, &r("b"), &r("a")).await, Some(START));
    }

    #[tokio::test]
    async fn test_unknown_table_and_unreachable_source() {
        let f = fixture(ApplyPolicy::SourceDominates).await;
        let err = f.engine.pull("nope", &r("b"), &r("a")).await.unwrap_err();
        assert!(matches!(err, GlobalError::TableNotFound(_)));

        // metadata lives in a, so only the source read fails
        f.engine.sync_replicas(TABLE).await.unwrap();
        f.cluster.store(&r("b")).unwrap().set_available(false);
        let err = f.engine.pull(TABLE, &r("a"), &r("b")).await.unwrap_err();
        assert!(matches!(err, GlobalError::Store(ref e) if e.is_retryable()));
        assert!(f.engine.sync_replicas(TABLE).await.is_err());
        assert_eq!(f.engine.stats().failed, 0);
    }
}
