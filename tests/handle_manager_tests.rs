#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aggfs::error::VfsError;
use aggfs::handle::{HandleConfig, HandleManager};
use aggfs::plugin::PluginHandle as _;
use aggfs::types::OpenFlag;

use common::MockHandle;

fn test_config() -> HandleConfig {
    HandleConfig {
        default_lease: Duration::from_millis(100),
        max_lease: Duration::from_millis(500),
        max_handles: 16,
        reap_interval: Duration::from_secs(3600),
    }
}

fn new_handle(closes: &Arc<AtomicUsize>) -> Arc<MockHandle> {
    Arc::new(MockHandle::new(Arc::clone(closes)))
}

#[tokio::test(start_paused = true)]
async fn open_read_expire_reopen() {
    let mgr = HandleManager::new(test_config());
    let closes = Arc::new(AtomicUsize::new(0));

    let (id, _) = mgr
        .register(
            new_handle(&closes),
            "/f",
            OpenFlag::READ,
            Duration::from_millis(50),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = mgr.get(id).await.unwrap_err();
    assert!(matches!(err, VfsError::NotFound(_)));
    assert_eq!(closes.load(Ordering::SeqCst), 1, "expired lookup closes once");

    let (id2, _) = mgr
        .register(
            new_handle(&closes),
            "/f",
            OpenFlag::READ,
            Duration::from_millis(50),
        )
        .unwrap();
    assert_ne!(id, id2, "ids are unique for the server lifetime");
    assert!(mgr.get(id2).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn access_refreshes_lease() {
    let mgr = HandleManager::new(test_config());
    let closes = Arc::new(AtomicUsize::new(0));

    let (id, _) = mgr
        .register(
            new_handle(&closes),
            "/f",
            OpenFlag::READ,
            Duration::from_millis(100),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(mgr.get(id).await.is_ok(), "get at 30ms succeeds");

    tokio::time::sleep(Duration::from_millis(90)).await;
    assert!(
        mgr.get(id).await.is_ok(),
        "get at 120ms succeeds because the 30ms access refreshed the lease"
    );

    tokio::time::sleep(Duration::from_millis(130)).await;
    assert!(
        mgr.get(id).await.is_err(),
        "get at 250ms fails with no access since 120ms"
    );
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn capacity_cap_leaves_table_unchanged() {
    let mgr = HandleManager::new(HandleConfig {
        max_handles: 3,
        ..test_config()
    });
    let closes = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        mgr.register(
            new_handle(&closes),
            "/f",
            OpenFlag::READ,
            Duration::ZERO,
        )
        .unwrap();
    }
    let err = mgr
        .register(new_handle(&closes), "/f", OpenFlag::READ, Duration::ZERO)
        .unwrap_err();
    assert!(matches!(err, VfsError::CapacityExceeded(_)));
    assert_eq!(mgr.count(), 3);
}

#[tokio::test(start_paused = true)]
async fn zero_lease_uses_default_and_oversized_is_clamped() {
    let mgr = HandleManager::new(test_config());
    let closes = Arc::new(AtomicUsize::new(0));

    let now = tokio::time::Instant::now();
    let (_, expires) = mgr
        .register(new_handle(&closes), "/f", OpenFlag::READ, Duration::ZERO)
        .unwrap();
    assert_eq!(expires - now, Duration::from_millis(100), "default lease");

    let (_, expires) = mgr
        .register(
            new_handle(&closes),
            "/f",
            OpenFlag::READ,
            Duration::from_secs(3600),
        )
        .unwrap();
    assert_eq!(expires - now, Duration::from_millis(500), "clamped to max");
}

#[tokio::test(start_paused = true)]
async fn renew_with_zero_keeps_duration() {
    let mgr = HandleManager::new(test_config());
    let closes = Arc::new(AtomicUsize::new(0));

    let (id, _) = mgr
        .register(
            new_handle(&closes),
            "/f",
            OpenFlag::READ,
            Duration::from_millis(200),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    let now = tokio::time::Instant::now();
    let expires = mgr.renew(id, Duration::ZERO).await.unwrap();
    assert_eq!(expires - now, Duration::from_millis(200));

    let expires = mgr.renew(id, Duration::from_secs(60)).await.unwrap();
    assert_eq!(expires - now, Duration::from_millis(500), "clamped to max");
}

#[tokio::test(start_paused = true)]
async fn renew_after_expiry_returns_not_found_and_closes() {
    let mgr = HandleManager::new(test_config());
    let closes = Arc::new(AtomicUsize::new(0));

    let (id, _) = mgr
        .register(
            new_handle(&closes),
            "/f",
            OpenFlag::READ,
            Duration::from_millis(50),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(mgr.renew(id, Duration::from_millis(50)).await.is_err());
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn close_is_exactly_once() {
    let mgr = HandleManager::new(test_config());
    let closes = Arc::new(AtomicUsize::new(0));

    let (id, _) = mgr
        .register(new_handle(&closes), "/f", OpenFlag::READ, Duration::ZERO)
        .unwrap();

    mgr.close(id).await.unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    let err = mgr.close(id).await.unwrap_err();
    assert!(matches!(err, VfsError::NotFound(_)));
    assert_eq!(closes.load(Ordering::SeqCst), 1, "second close is a no-op");
}

#[tokio::test(start_paused = true)]
async fn info_does_not_refresh_the_lease() {
    let mgr = HandleManager::new(test_config());
    let closes = Arc::new(AtomicUsize::new(0));

    let (id, _) = mgr
        .register(
            new_handle(&closes),
            "/some/path",
            OpenFlag::READ | OpenFlag::WRITE,
            Duration::from_millis(100),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    let info = mgr.info(id).unwrap();
    assert_eq!(info.path, "/some/path");
    assert_eq!(info.lease, Duration::from_millis(100));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(
        mgr.get(id).await.is_err(),
        "info at 60ms must not have extended the lease past 100ms"
    );
}

#[tokio::test(start_paused = true)]
async fn list_excludes_expired_records() {
    let mgr = HandleManager::new(test_config());
    let closes = Arc::new(AtomicUsize::new(0));

    mgr.register(
        new_handle(&closes),
        "/short",
        OpenFlag::READ,
        Duration::from_millis(50),
    )
    .unwrap();
    mgr.register(
        new_handle(&closes),
        "/long",
        OpenFlag::READ,
        Duration::from_millis(400),
    )
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let listed = mgr.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].path, "/long");
}

#[tokio::test(start_paused = true)]
async fn reaper_closes_expired_handles() {
    let mgr = HandleManager::new(HandleConfig {
        reap_interval: Duration::from_millis(20),
        ..test_config()
    });
    let closes = Arc::new(AtomicUsize::new(0));

    for i in 0..5 {
        mgr.register(
            new_handle(&closes),
            &format!("/f{i}"),
            OpenFlag::READ,
            Duration::from_millis(10 + 10 * i),
        )
        .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mgr.count(), 0, "reaper removed every expired record");
    assert_eq!(closes.load(Ordering::SeqCst), 5, "each closed exactly once");
}

#[tokio::test(start_paused = true)]
async fn stop_closes_remaining_handles() {
    let mgr = HandleManager::new(test_config());
    let closes = Arc::new(AtomicUsize::new(0));

    mgr.register(new_handle(&closes), "/a", OpenFlag::READ, Duration::ZERO)
        .unwrap();
    mgr.register(new_handle(&closes), "/b", OpenFlag::READ, Duration::ZERO)
        .unwrap();

    mgr.stop().await;
    assert_eq!(mgr.count(), 0);
    assert_eq!(closes.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn get_returns_registered_handle_within_lease() {
    let mgr = HandleManager::new(test_config());
    let closes = Arc::new(AtomicUsize::new(0));
    let handle = new_handle(&closes);
    handle
        .write_at(bytes::Bytes::from_static(b"payload"), 0)
        .await
        .unwrap();

    let (id, _) = mgr
        .register(handle, "/f", OpenFlag::READ, Duration::from_millis(200))
        .unwrap();

    let fetched = mgr.get(id).await.unwrap();
    let data = fetched.read_at(0, -1).await.unwrap();
    assert_eq!(&data[..], b"payload");
}
