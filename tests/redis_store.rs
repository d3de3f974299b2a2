//! Counter semantics against a live Redis.
//!
//! Ignored by default. Run with a server available:
//!
//! ```bash
//! REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_store -- --ignored
//! ```
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lifeguard::middleware::{Dimension, RateLimiter, RequestView};
use lifeguard::store::{CounterStore, RedisStore, RedisStoreConfig, StoreError};

async fn connect() -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    // Unique prefix per run so reruns never see stale counters
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let config = RedisStoreConfig {
        key_prefix: format!("lifeguard-test:{nonce}:"),
        ..RedisStoreConfig::default()
    };
    RedisStore::connect_with_config(&url, config)
        .await
        .expect("Redis must be reachable for ignored tests")
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_increment_opens_and_continues_window() {
    let store = connect().await;
    let window = Duration::from_secs(30);

    let first = store.increment("k", window).await.unwrap();
    assert_eq!(first.count, 1);
    assert!(first.ttl <= window && first.ttl > Duration::ZERO);

    let second = store.increment("k", window).await.unwrap();
    assert_eq!(second.count, 2);
    assert!(second.ttl <= first.ttl);

    assert_eq!(store.get("k").await.unwrap(), 2);
    store.reset("k").await.unwrap();
    assert_eq!(store.get("k").await.unwrap(), 0);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_window_expires() {
    let store = connect().await;
    let window = Duration::from_millis(200);

    store.increment("short", window).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let fresh = store.increment("short", window).await.unwrap();
    assert_eq!(fresh.count, 1);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_exact_limit_under_concurrency() {
    let store: Arc<dyn CounterStore> = Arc::new(connect().await);
    let limiter = Arc::new(
        RateLimiter::new(
            store,
            25,
            Duration::from_secs(60),
            vec![Dimension::custom("fixed", true, |_: &RequestView<'_>| {
                Some("client".to_string())
            })],
        )
        .unwrap(),
    );

    let tasks: Vec<_> = (0..100)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter
                    .check_key(Some("client"))
                    .await
                    .unwrap()
                    .is_allowed()
            })
        })
        .collect();

    let mut allowed = 0;
    for task in tasks {
        if task.await.unwrap() {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 25);
}

#[tokio::test]
#[ignore = "requires a running Redis"]
async fn test_closed_store_rejects_calls() {
    let store = connect().await;
    store.close().await.unwrap();
    store.close().await.unwrap();

    assert!(matches!(
        store.increment("k", Duration::from_secs(1)).await,
        Err(StoreError::Closed)
    ));
}
