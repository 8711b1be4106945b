use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use interlock_core::{DurableStore, RingBuffer, StoreError};

use crate::config::BusConfig;
use crate::discovery::Discovery;
use crate::error::SubscriberError;

/// Receives every published discovery, synchronously, on the publisher's task.
///
/// Implementations must return quickly; anything slow belongs on a channel
/// owned by the subscriber.
pub trait DiscoverySubscriber: Send + Sync {
    /// Name used in logs and delivery reports.
    fn name(&self) -> &str;

    fn on_discovery(&self, discovery: &Discovery) -> Result<(), SubscriberError>;
}

/// Handle returned by [`DiscoveryBus::subscribe`]; pass it to
/// [`DiscoveryBus::unsubscribe`] to end the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(u64);

struct FnSubscriber<F> {
    name: String,
    f: F,
}

impl<F> DiscoverySubscriber for FnSubscriber<F>
where
    F: Fn(&Discovery) -> Result<(), SubscriberError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_discovery(&self, discovery: &Discovery) -> Result<(), SubscriberError> {
        (self.f)(discovery)
    }
}

/// Per-publish delivery summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Names of subscribers that returned an error or panicked.
    pub failed: Vec<String>,
}

/// Result of a single [`DiscoveryBus::flush`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// No store attached.
    NoStore,
    /// Nothing published since the last successful flush.
    Clean,
    Flushed { count: usize },
}

/// Counters exposed for dashboards and tests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusMetrics {
    pub published: u64,
    pub deliveries: u64,
    pub subscriber_failures: u64,
    pub flushes: u64,
    pub flush_failures: u64,
}

/// Publish/subscribe hub for discoveries.
pub struct DiscoveryBus {
    config: BusConfig,
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn DiscoverySubscriber>)>>,
    next_subscription: AtomicU64,
    history: RwLock<RingBuffer<Discovery>>,
    /// Set on publish, cleared by a successful flush.
    dirty: AtomicBool,
    store: Option<Arc<dyn DurableStore>>,
    metrics: RwLock<BusMetrics>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl DiscoveryBus {
    /// Create a bus without durable mirroring.
    pub fn new(config: BusConfig) -> Self {
        let history = RingBuffer::new(config.history_capacity);
        Self {
            config,
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            history: RwLock::new(history),
            dirty: AtomicBool::new(false),
            store: None,
            metrics: RwLock::new(BusMetrics::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    /// Create a bus that flushes its history to `store`.
    pub fn with_store(config: BusConfig, store: Arc<dyn DurableStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new(config)
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // ── Subscriptions ───────────────────────────────────────────────

    pub fn subscribe(&self, subscriber: Arc<dyn DiscoverySubscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        info!(subscriber = subscriber.name(), "discovery subscriber registered");
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, subscriber));
        id
    }

    /// Subscribe a closure.
    pub fn subscribe_fn<F>(&self, name: impl Into<String>, f: F) -> SubscriptionId
    where
        F: Fn(&Discovery) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnSubscriber {
            name: name.into(),
            f,
        }))
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    // ── Publishing ──────────────────────────────────────────────────

    /// Record `discovery` and deliver it to every subscriber in subscription order.
    ///
    /// A subscriber that errors or panics is logged and skipped; delivery to
    /// the rest continues and the publisher never sees the failure.
    pub fn publish(&self, discovery: Discovery) -> DeliveryReport {
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(discovery.clone());
        self.dirty.store(true, Ordering::Release);

        // Snapshot so subscribers may (un)subscribe from inside a callback.
        let subscribers: Vec<Arc<dyn DiscoverySubscriber>> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();

        let mut report = DeliveryReport::default();
        for sub in subscribers {
            match catch_unwind(AssertUnwindSafe(|| sub.on_discovery(&discovery))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    warn!(subscriber = sub.name(), kind = discovery.kind(), error = %e, "discovery subscriber failed");
                    report.failed.push(sub.name().to_string());
                }
                Err(_) => {
                    error!(subscriber = sub.name(), kind = discovery.kind(), "discovery subscriber panicked");
                    report.failed.push(sub.name().to_string());
                }
            }
        }

        debug!(
            kind = discovery.kind(),
            source_task = discovery.source_task(),
            delivered = report.delivered,
            failed = report.failed.len(),
            "published discovery"
        );

        let mut m = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        m.published += 1;
        m.deliveries += report.delivered as u64;
        m.subscriber_failures += report.failed.len() as u64;
        report
    }

    // ── History ─────────────────────────────────────────────────────

    /// All retained discoveries, oldest first.
    pub fn history(&self) -> Vec<Discovery> {
        self.history.read().unwrap_or_else(PoisonError::into_inner).to_vec()
    }

    /// The newest `n` discoveries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Discovery> {
        self.history.read().unwrap_or_else(PoisonError::into_inner).tail(n)
    }

    pub fn metrics(&self) -> BusMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    // ── Durable mirroring ───────────────────────────────────────────

    /// Write the history snapshot to the store if anything was published
    /// since the last successful flush.
    ///
    /// On failure the dirty flag is restored so the next call retries.
    pub async fn flush(&self) -> Result<FlushOutcome, StoreError> {
        let Some(store) = &self.store else {
            return Ok(FlushOutcome::NoStore);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(FlushOutcome::Clean);
        }

        let snapshot = self.history();
        let count = snapshot.len();
        let result = match serde_json::to_value(&snapshot) {
            Ok(value) => store.store(&self.config.history_key, value).await,
            Err(e) => Err(e.into()),
        };

        let mut m = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(()) => {
                m.flushes += 1;
                debug!(count, key = %self.config.history_key, "flushed discovery history");
                Ok(FlushOutcome::Flushed { count })
            }
            Err(e) => {
                m.flush_failures += 1;
                self.dirty.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Load the last flushed history into memory. Returns the number restored.
    pub async fn restore(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let Some(value) = store.load_latest(&self.config.history_key).await? else {
            return Ok(0);
        };
        let restored: Vec<Discovery> = serde_json::from_value(value)?;
        let count = restored.len();
        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(restored);
        info!(count, "restored discovery history");
        Ok(count)
    }

    /// Flush on `flush_interval` until [`shutdown`](Self::shutdown), then flush once more.
    pub fn spawn_flush_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(bus.config.flush_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            while !bus.shutdown.load(Ordering::Acquire) {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = bus.flush().await {
                            warn!(error = %e, "discovery flush failed, retrying next tick");
                        }
                    }
                    _ = bus.shutdown_notify.notified() => break,
                }
            }

            if let Err(e) = bus.flush().await {
                warn!(error = %e, "final discovery flush failed");
            }
            info!("discovery flush loop stopped");
        })
    }

    /// Stop the flush loop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use interlock_core::MemoryStore;
    use serde_json::json;

    fn discovery(kind: &str) -> Discovery {
        Discovery::new(kind, json!({"k": kind}), 0.9, "task-1", "scout")
    }

    struct Recorder {
        name: String,
        seen: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl DiscoverySubscriber for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_discovery(&self, d: &Discovery) -> Result<(), SubscriberError> {
            self.seen.lock().unwrap().push(d.kind().to_string());
            Ok(())
        }
    }

    /// Store whose writes fail until `healthy` is flipped.
    struct FlakyStore {
        healthy: AtomicBool,
        inner: MemoryStore,
    }

    #[async_trait]
    impl DurableStore for FlakyStore {
        async fn store(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("down".into()));
            }
            self.inner.store(key, value).await
        }

        async fn load_latest(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
            self.inner.load_latest(key).await
        }
    }

    #[test]
    fn fan_out_reaches_all_subscribers() {
        let bus = DiscoveryBus::new(BusConfig::default());
        let a = Recorder::new("a");
        let b = Recorder::new("b");
        bus.subscribe(a.clone());
        bus.subscribe(b.clone());

        let report = bus.publish(discovery("arb"));

        assert_eq!(report.delivered, 2);
        assert!(report.failed.is_empty());
        assert_eq!(a.seen(), vec!["arb"]);
        assert_eq!(b.seen(), vec!["arb"]);
    }

    #[test]
    fn failing_subscriber_is_isolated() {
        let bus = DiscoveryBus::new(BusConfig::default());
        bus.subscribe_fn("erroring", |_| Err(SubscriberError::Rejected("nope".into())));
        bus.subscribe_fn("panicking", |_| panic!("subscriber bug"));
        let healthy = Recorder::new("healthy");
        bus.subscribe(healthy.clone());

        let report = bus.publish(discovery("arb"));

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, vec!["erroring".to_string(), "panicking".to_string()]);
        assert_eq!(healthy.seen(), vec!["arb"]);
        assert_eq!(bus.metrics().subscriber_failures, 2);

        // The bus keeps working after a panic.
        let report = bus.publish(discovery("second"));
        assert_eq!(report.delivered, 1);
        assert_eq!(healthy.seen(), vec!["arb", "second"]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = DiscoveryBus::new(BusConfig::default());
        let rec = Recorder::new("r");
        let id = bus.subscribe(rec.clone());

        bus.publish(discovery("one"));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(discovery("two"));

        assert_eq!(rec.seen(), vec!["one"]);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let bus = DiscoveryBus::new(BusConfig {
            history_capacity: 2,
            ..BusConfig::default()
        });
        for kind in ["a", "b", "c"] {
            bus.publish(discovery(kind));
        }
        let kinds: Vec<String> = bus.history().iter().map(|d| d.kind().to_string()).collect();
        assert_eq!(kinds, vec!["b", "c"]);
        assert_eq!(bus.recent(1)[0].kind(), "c");
    }

    #[tokio::test]
    async fn flush_without_store_is_noop() {
        let bus = DiscoveryBus::new(BusConfig::default());
        bus.publish(discovery("a"));
        assert_eq!(bus.flush().await.unwrap(), FlushOutcome::NoStore);
    }

    #[tokio::test]
    async fn flush_skips_when_clean() {
        let store = Arc::new(MemoryStore::new());
        let bus = DiscoveryBus::with_store(BusConfig::default(), store.clone());

        assert_eq!(bus.flush().await.unwrap(), FlushOutcome::Clean);
        bus.publish(discovery("a"));
        assert_eq!(bus.flush().await.unwrap(), FlushOutcome::Flushed { count: 1 });
        assert_eq!(bus.flush().await.unwrap(), FlushOutcome::Clean);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn failed_flush_is_retried() {
        let store = Arc::new(FlakyStore {
            healthy: AtomicBool::new(false),
            inner: MemoryStore::new(),
        });
        let bus = DiscoveryBus::with_store(BusConfig::default(), store.clone());
        bus.publish(discovery("a"));

        assert!(bus.flush().await.is_err());
        assert_eq!(bus.metrics().flush_failures, 1);

        store.healthy.store(true, Ordering::SeqCst);
        assert_eq!(bus.flush().await.unwrap(), FlushOutcome::Flushed { count: 1 });

        let stored = store.inner.load_latest("discovery/history").await.unwrap().unwrap();
        assert_eq!(stored.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn restore_loads_flushed_history() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let first = DiscoveryBus::with_store(BusConfig::default(), Arc::clone(&store));
        first.publish(discovery("a"));
        first.publish(discovery("b"));
        first.flush().await.unwrap();

        let second = DiscoveryBus::with_store(BusConfig::default(), store);
        assert_eq!(second.restore().await.unwrap(), 2);
        assert_eq!(second.history(), first.history());
        // Restored history is not re-flushed.
        assert_eq!(second.flush().await.unwrap(), FlushOutcome::Clean);
    }
}
