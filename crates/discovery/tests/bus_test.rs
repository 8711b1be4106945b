//! Integration tests for the discovery bus flush loop against a file store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use interlock_core::{DurableStore, FileStore};
use interlock_discovery::{BusConfig, Discovery, DiscoveryBus};

const TIMEOUT: Duration = Duration::from_secs(5);

fn config() -> BusConfig {
    BusConfig {
        history_capacity: 3,
        flush_interval_seconds: 1,
        ..BusConfig::default()
    }
}

#[tokio::test]
async fn flush_loop_persists_on_shutdown_and_restores() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn DurableStore> = Arc::new(FileStore::new(dir.path()).unwrap());

    let bus = Arc::new(DiscoveryBus::with_store(config(), store.clone()));
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    bus.subscribe_fn("counter", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let flush_loop = bus.spawn_flush_loop();

    for i in 0..5 {
        bus.publish(Discovery::new("spread", json!({ "i": i }), 0.7, "scan", "scout"));
    }
    assert_eq!(seen.load(Ordering::SeqCst), 5);

    bus.shutdown();
    timeout(TIMEOUT, flush_loop).await.unwrap().unwrap();
    assert!(dir.path().join("discovery").join("history.json").exists());

    let restored = DiscoveryBus::with_store(config(), store);
    assert_eq!(restored.restore().await.unwrap(), 3);
    let payloads: Vec<_> = restored.history().iter().map(|d| d.payload().clone()).collect();
    assert_eq!(payloads, vec![json!({"i": 2}), json!({"i": 3}), json!({"i": 4})]);
    assert_eq!(restored.metrics().published, 0);
}
