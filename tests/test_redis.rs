//! Integration tests for the remote KV tier.
//!
//! These need a reachable server (`REDIS_URL`, default
//! `redis://127.0.0.1:6379`) and are ignored by default.

use std::time::Duration;

use cascade_cache::adapters::RedisStorage;
use cascade_cache::{Cache, CacheError};
use redis::aio::ConnectionManager;

async fn connection_manager() -> ConnectionManager {
    let url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = redis::Client::open(url).expect("redis url should parse");
    client
        .get_connection_manager()
        .await
        .expect("redis server should be reachable")
}

fn decode_str(value: &[u8]) -> String {
    serde_json::from_slice(value).expect("value should decode as a JSON string")
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn test_redis_set_get_roundtrip() {
    let conn = connection_manager().await;
    let cache = Cache::new(vec![RedisStorage::maker(conn, Duration::from_secs(21_600))]).unwrap();

    cache.set("wf_test_key", "my_value").await.unwrap();

    let item = cache.get("wf_test_key").await.unwrap();
    assert_eq!(decode_str(&item.value), "my_value");

    cache.del("wf_test_key").await.unwrap();
    assert!(matches!(
        cache.get("wf_test_key").await,
        Err(CacheError::NotFulfilled)
    ));
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn test_redis_batch_set_batch_get() {
    let conn = connection_manager().await;
    let cache = Cache::new(vec![RedisStorage::maker(conn, Duration::from_secs(21_600))]).unwrap();

    let pairs: Vec<(String, String)> = (0..300)
        .map(|i| (format!("wf_test_batch_{}", i), format!("value_{}", i)))
        .collect();
    cache.batch_set(&pairs).await.unwrap();

    // More keys than one MGET round-trip carries.
    let keys: Vec<String> = pairs.iter().map(|(key, _)| key.clone()).collect();
    let items = cache.batch_get(&keys).await.unwrap();
    assert_eq!(items.len(), 300);

    for (key, _) in &pairs {
        cache.del(key).await.unwrap();
    }
}

#[tokio::test]
#[ignore = "requires a running redis server"]
async fn test_redis_entries_carry_server_side_ttl() {
    let conn = connection_manager().await;
    let cache =
        Cache::new(vec![RedisStorage::maker(conn.clone(), Duration::from_millis(100))]).unwrap();

    cache.set("wf_test_ttl", "v").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(matches!(
        cache.get("wf_test_ttl").await,
        Err(CacheError::NotFulfilled)
    ));
}
