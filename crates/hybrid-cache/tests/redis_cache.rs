//! Integration tests for the Redis tier and backplane.
//!
//! These tests verify the two-tier caching system against a real Redis:
//! - L2 reads, writes, prefix removal and lock primitives
//! - L1/L2 promotion across instances
//! - Cross-instance invalidation over Pub/Sub
//!
//! Tests use testcontainers to spin up a real Redis instance.

use std::sync::Arc;
use std::time::Duration;

use hybrid_cache::{
    AppConfig, CacheManager, CacheTier, DistributedTier, RedisConfig, RedisTier,
    cache::create_pool,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;

// Shared Redis container for all tests
static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

/// Get or create the shared Redis container
async fn get_redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");

            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);

            (container, url)
        })
        .await;

    url.clone()
}

/// Config with a per-test key namespace so tests can run in parallel.
async fn redis_config(namespace: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.redis = RedisConfig {
        enabled: true,
        url: get_redis_url().await,
        pool_size: 5,
        key_prefix: format!("{namespace}:"),
        ..RedisConfig::default()
    };
    config
}

async fn redis_tier(namespace: &str) -> RedisTier {
    let config = redis_config(namespace).await;
    let pool = create_pool(&config.redis).expect("create pool");
    RedisTier::from_config(pool, &config.redis)
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

#[tokio::test]
#[ignore = "requires Docker for the Redis testcontainer"]
async fn test_redis_tier_get_set_with_ttl() {
    let tier = redis_tier("tier-basic").await;
    tier.ping().await.expect("ping");

    tier.set("k", Arc::new(b"value".to_vec()), Duration::from_secs(60))
        .await
        .unwrap();

    let entry = tier.get("k").await.unwrap().expect("stored entry");
    assert_eq!(entry.data.as_slice(), b"value");
    let remaining = entry.remaining_ttl().expect("entry has a ttl");
    assert!(remaining <= Duration::from_secs(60));
    assert!(remaining > Duration::from_secs(50));

    assert!(tier.exists("k").await.unwrap());
    assert!(tier.remove("k").await.unwrap());
    assert!(tier.get("k").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker for the Redis testcontainer"]
async fn test_redis_tier_prefix_removal_stays_in_namespace() {
    let tier = redis_tier("tier-prefix").await;
    let other = redis_tier("tier-prefix-other").await;
    let ttl = Duration::from_secs(60);

    for key in ["product:1", "product:2", "product:*", "category:1"] {
        tier.set(key, Arc::new(Vec::new()), ttl).await.unwrap();
    }
    other
        .set("product:1", Arc::new(Vec::new()), ttl)
        .await
        .unwrap();

    assert_eq!(tier.remove_by_prefix("product:").await.unwrap(), 3);
    assert!(tier.exists("category:1").await.unwrap());
    assert!(other.exists("product:1").await.unwrap());

    assert_eq!(tier.remove_all().await.unwrap(), 1);
    assert!(other.exists("product:1").await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker for the Redis testcontainer"]
async fn test_redis_tier_lock_primitives() {
    let tier = redis_tier("tier-lock").await;
    let ttl = Duration::from_secs(30);

    assert!(tier.set_if_absent("lock:job", b"t1", ttl).await.unwrap());
    assert!(!tier.set_if_absent("lock:job", b"t2", ttl).await.unwrap());

    assert!(!tier.remove_if_equals("lock:job", b"t2").await.unwrap());
    assert!(tier.remove_if_equals("lock:job", b"t1").await.unwrap());
    assert!(tier.set_if_absent("lock:job", b"t3", ttl).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker for the Redis testcontainer"]
async fn test_manager_connects_to_redis() {
    let config = redis_config("manager-connect").await;
    let manager = CacheManager::from_config(&config).await.unwrap();

    let stats = manager.stats();
    assert_eq!(stats.distributed, "redis");
    assert_eq!(stats.backplane, "redis");

    manager.set("k", &"v", None).await.unwrap();
    assert_eq!(manager.get::<String>("k").await.unwrap().as_deref(), Some("v"));
    manager.shutdown().await;
}

#[tokio::test]
#[ignore = "requires Docker for the Redis testcontainer"]
async fn test_l1_l2_promotion_across_instances() {
    let config = redis_config("promotion").await;
    let first = CacheManager::from_config(&config).await.unwrap();
    let second = CacheManager::from_config(&config).await.unwrap();

    first
        .set("promotion_key", &42u32, Some(Duration::from_secs(60)))
        .await
        .unwrap();

    // Second instance reads through L2 and promotes to L1
    assert!(!second.cache().local().contains("promotion_key"));
    assert_eq!(second.get::<u32>("promotion_key").await.unwrap(), Some(42));
    assert!(second.cache().local().contains("promotion_key"));

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
#[ignore = "requires Docker for the Redis testcontainer"]
async fn test_invalidation_over_pubsub() {
    let config = redis_config("pubsub").await;
    let first = CacheManager::from_config(&config).await.unwrap();
    let second = CacheManager::from_config(&config).await.unwrap();
    // Let both listeners subscribe
    tokio::time::sleep(Duration::from_millis(300)).await;

    first.set("shared", &1u32, None).await.unwrap();
    assert_eq!(second.get::<u32>("shared").await.unwrap(), Some(1));
    assert!(second.cache().local().contains("shared"));

    first.set("shared", &2u32, None).await.unwrap();
    let local = Arc::clone(second.cache().local());
    assert!(eventually(|| !local.contains("shared")).await);
    assert_eq!(second.get::<u32>("shared").await.unwrap(), Some(2));

    first.remove_by_prefix("sha").unwrap().wait().await.unwrap();
    assert!(eventually(|| !local.contains("shared")).await);
    assert_eq!(second.get::<u32>("shared").await.unwrap(), None);

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
#[ignore = "requires Docker for the Redis testcontainer"]
async fn test_distributed_lock_excludes_other_instance() {
    let config = redis_config("locks").await;
    let first = CacheManager::from_config(&config).await.unwrap();
    let second = CacheManager::from_config(&config).await.unwrap();

    let lease = first.try_acquire("reindex", None).await.unwrap().unwrap();
    let ran = second
        .try_acquire_and_run("reindex", None, || async { Ok(()) })
        .await
        .unwrap();
    assert!(!ran);

    assert!(lease.release().await.unwrap());
    let ran = second
        .try_acquire_and_run("reindex", None, || async { Ok(()) })
        .await
        .unwrap();
    assert!(ran);

    first.shutdown().await;
    second.shutdown().await;
}
