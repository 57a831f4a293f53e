//! Routing scenarios against an in-memory cluster with a managed metadata
//! store and a manual clock.

use meridian_core::{system, Item, ManualClock, RegionId};
use meridian_global::{
    GlobalConfigBuilder, GlobalError, GlobalRequestRouter, KeyLocks, MetadataStore,
};
use meridian_store::{AttributeUpdate, Consistency, MemoryCluster, MemoryItemStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

const TABLE: &str = "orders";
const START: u64 = 1_700_000_000_000;

fn m() -> RegionId {
    RegionId::new("us-east-1")
}

fn l() -> RegionId {
    RegionId::new("ap-south-1")
}

struct Setup {
    cluster: Arc<MemoryCluster>,
    clock: Arc<ManualClock>,
    metadata: Arc<MetadataStore>,
}

/// M creates the table as master, then L is added as a replica.
async fn setup() -> Setup {
    setup_on(MemoryCluster::new([m(), l()])).await
}

/// Like `setup`, with every store call delayed so concurrent writers
/// interleave.
async fn setup_with_latency(latency: Duration) -> Setup {
    let stores = [m(), l()]
        .into_iter()
        .map(|region| MemoryItemStore::new(region).with_latency(latency));
    setup_on(MemoryCluster::from_stores(stores)).await
}

async fn setup_on(cluster: MemoryCluster) -> Setup {
    let cluster = Arc::new(cluster);
    cluster.create_table(TABLE, "id").await.unwrap();
    let clock = Arc::new(ManualClock::new(START));
    let config = GlobalConfigBuilder::new()
        .local_region(m())
        .metadata_home(m())
        .metadata_replicas([m()])
        .build();
    let metadata = Arc::new(
        MetadataStore::open(config, cluster.clone(), clock.clone())
            .await
            .unwrap(),
    );
    assert!(metadata.create_table(TABLE, &m()).await.unwrap());
    assert!(metadata.add_region(TABLE, &l()).await.unwrap());
    Setup {
        cluster,
        clock,
        metadata,
    }
}

async fn router(s: &Setup, region: RegionId) -> GlobalRequestRouter {
    s.metadata.router(TABLE, region).await.unwrap()
}

fn order(id: &str) -> Item {
    Item::new().with("id", id).with("status", "open")
}

#[tokio::test]
async fn test_strong_writes_from_replica_region_are_stamped_by_master() {
    let s = setup().await;
    let router = router(&s, l()).await;
    assert_eq!(router.key_name(), "id");

    let first = router.put_item(order("o-1"), Consistency::Strong).await.unwrap();
    assert_eq!(first.origin(), Some(m()));
    assert_eq!(first.version().count(&m()), 1);
    assert_eq!(first.version().count(&l()), 0);
    assert_eq!(first.timestamp(), START);

    s.clock.advance(100);
    let second = router.put_item(order("o-1"), Consistency::Strong).await.unwrap();
    assert_eq!(second.origin(), Some(m()));
    assert_eq!(second.version().count(&m()), 2);
    assert_eq!(second.version().len(), 1);
    assert_eq!(second.timestamp(), START + 100);

    // written to the master only, until replicated
    assert!(router.get_item("o-1", Consistency::Eventual).await.unwrap().is_none());
    let stored = router.get_item("o-1", Consistency::Strong).await.unwrap().unwrap();
    assert_eq!(stored, second);
    assert_eq!(s.cluster.store(&l()).unwrap().len(TABLE), 0);
}

#[tokio::test]
async fn test_eventual_writes_stay_local() {
    let s = setup().await;
    let router = router(&s, l()).await;

    let committed = router.put_item(order("o-2"), Consistency::Eventual).await.unwrap();
    assert_eq!(committed.origin(), Some(l()));
    assert_eq!(committed.version().count(&l()), 1);
    assert!(committed.is_stamped());

    assert_eq!(s.cluster.store(&m()).unwrap().len(TABLE), 0);
    assert_eq!(
        router.get_item("o-2", Consistency::Eventual).await.unwrap(),
        Some(committed)
    );
}

#[tokio::test]
async fn test_update_item_stamps_alongside_client_updates() {
    let s = setup().await;
    let router = router(&s, l()).await;

    router.put_item(order("o-3"), Consistency::Strong).await.unwrap();
    s.clock.advance(5);
    let updated = router
        .update_item(
            "o-3",
            vec![
                AttributeUpdate::put("status", "shipped"),
                AttributeUpdate::add("tags", meridian_core::AttributeValue::string_set(["gift"])),
            ],
            Consistency::Strong,
        )
        .await
        .unwrap();

    assert_eq!(updated.get_string("status"), Some("shipped"));
    assert!(updated.get("tags").is_some());
    assert_eq!(updated.version().count(&m()), 2);
    assert_eq!(updated.timestamp(), START + 5);
    assert_eq!(updated.get_string(system::ORIGIN), Some("us-east-1"));
}

#[tokio::test]
async fn test_reserved_attributes_are_rejected() {
    let s = setup().await;
    let router = router(&s, l()).await;

    for name in system::ALL {
        let err = router
            .put_item(order("o-4").with(name, "x"), Consistency::Eventual)
            .await
            .unwrap_err();
        assert!(matches!(err, GlobalError::ReservedAttribute(ref a) if a == name));
    }
    assert_eq!(s.cluster.store(&l()).unwrap().len(TABLE), 0);
}

#[tokio::test]
async fn test_set_master_redirects_strong_writes_without_a_lease() {
    let s = setup().await;
    let router = router(&s, l()).await;

    router.put_item(order("o-5"), Consistency::Strong).await.unwrap();
    assert_eq!(router.cached_master(), Some(m()));

    // nobody holds the lease, so every strong request rediscovers
    assert!(s.metadata.set_master(TABLE, &l()).await.unwrap());
    let committed = router.put_item(order("o-5"), Consistency::Strong).await.unwrap();
    assert_eq!(committed.origin(), Some(l()));
    assert_eq!(router.cached_master(), Some(l()));
}

#[tokio::test]
async fn test_held_lease_pins_master_until_it_may_expire() {
    let s = setup().await;
    let router = router(&s, l()).await;

    assert!(s.metadata.acquire_mastership(TABLE, &m()).await.unwrap());
    let lease = s.metadata.get_lease(TABLE);
    router.put_item(order("o-6"), Consistency::Strong).await.unwrap();
    assert_eq!(router.cached_master(), Some(m()));

    // an administrative change is not seen while the lease is trusted
    assert!(s.metadata.set_master(TABLE, &l()).await.unwrap());
    s.clock.advance(60_000);
    let pinned = router.put_item(order("o-6"), Consistency::Strong).await.unwrap();
    assert_eq!(pinned.origin(), Some(m()));

    s.clock.set(lease.expiration() - lease.config().clock_bound_ms + 1);
    assert!(lease.maybe_expired());
    assert!(!lease.is_expired());
    let moved = router.put_item(order("o-6"), Consistency::Strong).await.unwrap();
    assert_eq!(moved.origin(), Some(l()));
    assert_eq!(router.cached_master(), Some(l()));
}

#[tokio::test]
async fn test_lease_handover_between_regions() {
    let s = setup().await;
    let lease = s.metadata.get_lease(TABLE);

    assert!(s.metadata.acquire_mastership(TABLE, &m()).await.unwrap());
    assert!(!s.metadata.acquire_mastership(TABLE, &l()).await.unwrap());

    // a forced takeover waits for the current lease
    assert!(!lease.take(&l()));
    assert!(!lease.renew(&l()));
    s.clock.set(lease.expiration() + lease.config().clock_bound_ms + 1);
    assert!(lease.renew(&l()));
    assert_eq!(lease.owner(), Some(l()));

    assert!(s.metadata.acquire_mastership(TABLE, &l()).await.unwrap());
    assert_eq!(s.metadata.get_master(TABLE).await.unwrap(), Some(l()));
}

#[tokio::test]
async fn test_unregistered_table_has_no_master() {
    let s = setup().await;
    s.cluster.create_table("drafts", "id").await.unwrap();
    let router = s.metadata.router("drafts", l()).await.unwrap();

    let err = router.get_item("d-1", Consistency::Strong).await.unwrap_err();
    assert!(matches!(err, GlobalError::TableNotFound(ref t) if t == "drafts"));
    assert!(router.get_item("d-1", Consistency::Eventual).await.unwrap().is_none());

    let missing = s.metadata.router("absent", l()).await;
    assert!(matches!(
        missing,
        Err(GlobalError::Store(StoreError::TableNotFound(_)))
    ));
}

#[tokio::test]
async fn test_routers_from_one_metadata_store_never_lose_bumps() {
    let s = setup_with_latency(Duration::from_millis(2)).await;
    let from_m = Arc::new(router(&s, m()).await);
    let from_l = Arc::new(router(&s, l()).await);

    let mut handles = Vec::new();
    for i in 0..20 {
        let router = if i % 2 == 0 { from_m.clone() } else { from_l.clone() };
        let clock = s.clock.clone();
        handles.push(tokio::spawn(async move {
            clock.advance(1);
            router
                .update_item("o-7", vec![AttributeUpdate::add("qty", 1)], Consistency::Strong)
                .await
                .unwrap();
        }));
    }
    for handle in futures::future::join_all(handles).await {
        handle.unwrap();
    }

    let item = from_l.get_item("o-7", Consistency::Strong).await.unwrap().unwrap();
    assert_eq!(item.get_number("qty"), Some(20));
    assert_eq!(item.version().count(&m()), 20);
}

#[tokio::test]
async fn test_explicit_write_locks_serialize_local_writers() {
    let s = setup_with_latency(Duration::from_millis(1)).await;
    let locks = Arc::new(KeyLocks::default());
    let first = router(&s, l()).await.with_write_locks(locks.clone());
    let second = router(&s, l()).await.with_write_locks(locks);

    let (a, b) = tokio::join!(
        first.update_item("o-8", vec![AttributeUpdate::add("qty", 1)], Consistency::Eventual),
        second.update_item("o-8", vec![AttributeUpdate::add("qty", 1)], Consistency::Eventual),
    );
    a.unwrap();
    b.unwrap();

    let item = first.get_item("o-8", Consistency::Eventual).await.unwrap().unwrap();
    assert_eq!(item.get_number("qty"), Some(2));
    assert_eq!(item.version().count(&l()), 2);
}

#[tokio::test]
async fn test_put_item_if_absent_keeps_the_first_copy() {
    let s = setup_with_latency(Duration::from_millis(1)).await;
    let from_m = router(&s, m()).await;
    let from_l = router(&s, l()).await;

    let (a, b) = tokio::join!(
        from_m.put_item_if_absent(order("o-9").with("by", "m"), Consistency::Strong),
        from_l.put_item_if_absent(order("o-9").with("by", "l"), Consistency::Strong),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.is_some() ^ b.is_some());

    let winner = a.or(b).unwrap();
    let stored = from_l.get_item("o-9", Consistency::Strong).await.unwrap().unwrap();
    assert_eq!(stored, winner);
    assert_eq!(stored.version().count(&m()), 1);
}
