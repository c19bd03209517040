//! End-to-end behaviour of the cache manager over the in-process tiers.
//!
//! Several managers sharing one `MemoryDistributedTier` and one
//! `MemoryBackplane` stand in for a farm of processes.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use hybrid_cache::{
    AppConfig, CacheError, CacheManager, CacheTier, MemoryBackplane, MemoryDistributedTier,
    lock_key_for,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct User {
    id: u64,
    name: String,
}

async fn manager_on(tier: &MemoryDistributedTier, backplane: &MemoryBackplane) -> CacheManager {
    CacheManager::builder()
        .with_config(AppConfig::default())
        .with_distributed(Arc::new(tier.clone()))
        .with_backplane(Arc::new(backplane.clone()))
        .build()
        .await
        .expect("build manager")
}

/// Wait until `check` holds, polling for up to two seconds.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..40 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

#[tokio::test(start_paused = true)]
async fn test_user_is_loaded_once_per_ttl_window() {
    let manager = CacheManager::from_config(&AppConfig::default()).await.unwrap();
    let loads = Arc::new(AtomicUsize::new(0));
    let ttl = Some(Duration::from_secs(60 * 60));

    let load_user = |loads: Arc<AtomicUsize>| {
        move || async move {
            let n = loads.fetch_add(1, Ordering::SeqCst) as u64;
            Ok::<_, anyhow::Error>(User {
                id: 42,
                name: format!("Ada #{n}"),
            })
        }
    };

    let first: User = manager
        .get_or_compute("user:42", ttl, load_user(Arc::clone(&loads)))
        .await
        .unwrap();
    // Past the local lifetime cap, still inside the distributed TTL
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    let second: User = manager
        .get_or_compute("user:42", ttl, load_user(Arc::clone(&loads)))
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(60 * 60)).await;
    let third: User = manager
        .get_or_compute("user:42", ttl, load_user(Arc::clone(&loads)))
        .await
        .unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 2);
    assert_ne!(third, first);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_misses_share_one_load() {
    let manager = CacheManager::from_config(&AppConfig::default()).await.unwrap();
    let loads = Arc::new(AtomicUsize::new(0));

    let calls = (0..10).map(|_| {
        let cache = manager.cache().clone();
        let loads = Arc::clone(&loads);
        tokio::spawn(async move {
            cache
                .get_or_compute("report:daily", None, move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(vec![1u32, 2, 3])
                })
                .await
        })
    });

    for result in join_all(calls).await {
        assert_eq!(result.unwrap().unwrap(), vec![1, 2, 3]);
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().in_flight, 0);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_set_value_expires_from_both_tiers() {
    let manager = CacheManager::from_config(&AppConfig::default()).await.unwrap();
    let user = User {
        id: 7,
        name: "Grace".into(),
    };

    manager
        .set("user:7", &user, Some(Duration::from_secs(2)))
        .await
        .unwrap();
    assert!(manager.exists("user:7").await.unwrap());
    assert_eq!(manager.get::<User>("user:7").await.unwrap(), Some(user));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!manager.exists("user:7").await.unwrap());
    assert_eq!(manager.get::<User>("user:7").await.unwrap(), None);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_loader_error_is_not_cached() {
    let manager = CacheManager::from_config(&AppConfig::default()).await.unwrap();

    let err = manager
        .get_or_compute::<u32, _, _>("flaky", None, || async {
            Err(anyhow::anyhow!("database offline"))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Loader { .. }));
    assert!(!manager.exists("flaky").await.unwrap());

    let value: u32 = manager
        .get_or_compute("flaky", None, || async { Ok(7) })
        .await
        .unwrap();
    assert_eq!(value, 7);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_write_on_one_instance_invalidates_the_other() {
    let tier = MemoryDistributedTier::new();
    let backplane = MemoryBackplane::new();
    let first = manager_on(&tier, &backplane).await;
    let second = manager_on(&tier, &backplane).await;

    first.set("product:1", &"red", None).await.unwrap();
    assert_eq!(
        second.get::<String>("product:1").await.unwrap().as_deref(),
        Some("red")
    );
    assert!(second.cache().local().contains("product:1"));

    first.set("product:1", &"blue", None).await.unwrap();
    let local = Arc::clone(second.cache().local());
    assert!(eventually(|| !local.contains("product:1")).await);
    assert_eq!(
        second.get::<String>("product:1").await.unwrap().as_deref(),
        Some("blue")
    );

    // The writer keeps its own fresh copy
    assert!(first.cache().local().contains("product:1"));

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_prefix_removal_reaches_every_instance() {
    let tier = MemoryDistributedTier::new();
    let backplane = MemoryBackplane::new();
    let first = manager_on(&tier, &backplane).await;
    let second = manager_on(&tier, &backplane).await;

    let keys = ["product:1", "product:2", "category:1"];
    for key in keys {
        first.set(key, &1u32, None).await.unwrap();
    }
    // Let the write invalidations drain before warming the second instance
    tokio::time::sleep(Duration::from_millis(200)).await;
    for key in keys {
        assert_eq!(second.get::<u32>(key).await.unwrap(), Some(1));
    }

    first
        .remove_by_prefix("product:")
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(!tier.exists("product:1").await.unwrap());
    assert!(tier.exists("category:1").await.unwrap());
    let local = Arc::clone(second.cache().local());
    assert!(eventually(|| !local.contains("product:1") && !local.contains("product:2")).await);
    assert!(local.contains("category:1"));

    first.clear().unwrap().wait().await.unwrap();
    assert!(tier.is_empty());
    assert!(eventually(|| local.is_empty()).await);

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_lock_is_exclusive_across_instances() {
    let tier = MemoryDistributedTier::new();
    let backplane = MemoryBackplane::new();
    let first = manager_on(&tier, &backplane).await;
    let second = manager_on(&tier, &backplane).await;

    let lease = first
        .try_acquire("nightly-report", None)
        .await
        .unwrap()
        .expect("first instance takes the lock");

    let ran = second
        .try_acquire_and_run("nightly-report", None, || async { Ok(()) })
        .await
        .unwrap();
    assert!(!ran);

    assert!(lease.release().await.unwrap());

    let runs = AtomicUsize::new(0);
    let ran = second
        .try_acquire_and_run("nightly-report", None, || async {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
    assert!(ran);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!first.exists(&lock_key_for("nightly-report")).await.unwrap());

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_operations_after_shutdown_reject_background_jobs() {
    let manager = CacheManager::from_config(&AppConfig::default()).await.unwrap();
    manager.shutdown().await;

    let err = manager.remove_by_prefix("any:").err().unwrap();
    assert!(matches!(err, CacheError::DispatcherClosed));
}
