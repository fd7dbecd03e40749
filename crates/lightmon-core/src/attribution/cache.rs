//! Expiring stores backing container attribution.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use lightmon_common::{Pid, containers::ContainerRecord};
use moka::{Expiry, sync::Cache};
use tokio::{task::JoinHandle, time};

use super::Attribution;

#[derive(Clone)]
struct Expiring<V> {
    value: V,
    /// `None` never expires.
    ttl: Option<Duration>,
}

/// Every entry carries its own lifetime, which restarts when it's overwritten.
/// Reads never extend it.
struct PerEntryTtl;

impl<V> Expiry<Pid, Expiring<V>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &Pid,
        value: &Expiring<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &Pid,
        value: &Expiring<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// Thread safe key-value store keyed by pid, with a lifetime per key.
///
/// Expired entries are invisible to lookups right away, but they're physically
/// removed only by [`ExpiringStore::sweep`].
#[derive(Clone)]
pub struct ExpiringStore<V> {
    inner: Cache<Pid, Expiring<V>>,
}

impl<V: Clone + Send + Sync + 'static> Default for ExpiringStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> ExpiringStore<V> {
    pub fn new() -> Self {
        Self {
            inner: Cache::builder().expire_after(PerEntryTtl).build(),
        }
    }

    pub fn get(&self, key: &Pid) -> Option<V> {
        self.inner.get(key).map(|entry| entry.value)
    }

    pub fn set(&self, key: Pid, value: V, ttl: Option<Duration>) {
        self.inner.insert(key, Expiring { value, ttl });
    }

    pub fn exists(&self, key: &Pid) -> bool {
        self.inner.contains_key(key)
    }

    /// Removes expired entries.
    pub fn sweep(&self) {
        self.inner.run_pending_tasks();
    }

    /// Number of entries, possibly including expired ones not swept yet.
    #[cfg(test)]
    fn len(&self) -> u64 {
        self.inner.entry_count()
    }
}

/// The two stores used by container attribution.
///
/// Cloning is cheap, clones share the same stores.
#[derive(Clone, Default)]
pub struct AttributionCache {
    /// pid -> container record. The same record is indexed under many pids.
    containers: ExpiringStore<Arc<ContainerRecord>>,
    /// pid -> resolved container name
    names: ExpiringStore<Attribution>,
}

impl AttributionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_container(&self, pid: &Pid) -> Option<Arc<ContainerRecord>> {
        self.containers.get(pid)
    }

    pub fn put_container(&self, pid: Pid, record: Arc<ContainerRecord>, ttl: Duration) {
        self.containers.set(pid, record, Some(ttl));
    }

    pub fn contains_container(&self, pid: &Pid) -> bool {
        self.containers.exists(pid)
    }

    pub fn get_name(&self, pid: &Pid) -> Option<Attribution> {
        self.names.get(pid)
    }

    /// Without a `ttl` the entry never expires.
    pub fn put_name(&self, pid: Pid, name: Attribution, ttl: Option<Duration>) {
        self.names.set(pid, name, ttl);
    }

    #[cfg(test)]
    pub fn contains_name(&self, pid: &Pid) -> bool {
        self.names.exists(pid)
    }

    pub fn sweep(&self) {
        self.containers.sweep();
        self.names.sweep();
    }
}

/// Starts the background task which periodically evicts expired entries.
pub fn spawn_sweeper(cache: AttributionCache, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            log::trace!("periodic attribution cache sweep");
            cache.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    const PID_1: Pid = Pid::from_raw(42);
    const PID_2: Pid = Pid::from_raw(43);

    fn record(name: &str) -> Arc<ContainerRecord> {
        Arc::new(ContainerRecord {
            id: "abc".to_string(),
            name: name.to_string(),
            init_pid: PID_1,
            parent_pid: PID_2,
        })
    }

    #[test]
    fn entries_expire_without_reads() {
        let store = ExpiringStore::new();
        store.set(PID_1, "short".to_string(), Some(Duration::from_millis(50)));
        store.set(PID_2, "long".to_string(), Some(Duration::from_secs(60)));
        assert!(store.exists(&PID_1));

        thread::sleep(Duration::from_millis(120));
        assert!(!store.exists(&PID_1));
        assert_eq!(store.get(&PID_1), None);
        assert_eq!(store.get(&PID_2).as_deref(), Some("long"));
    }

    #[test]
    fn entries_without_ttl_never_expire() {
        let store = ExpiringStore::new();
        store.set(PID_1, 1, None);
        thread::sleep(Duration::from_millis(60));
        store.sweep();
        assert_eq!(store.get(&PID_1), Some(1));
    }

    #[test]
    fn overwrite_restarts_lifetime() {
        let store = ExpiringStore::new();
        store.set(PID_1, 1, Some(Duration::from_millis(50)));
        store.set(PID_1, 2, None);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(store.get(&PID_1), Some(2));
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let store = ExpiringStore::new();
        store.set(PID_1, 1, Some(Duration::from_millis(20)));
        store.set(PID_2, 2, None);
        store.sweep();
        assert_eq!(store.len(), 2);

        thread::sleep(Duration::from_millis(60));
        store.sweep();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn one_record_many_keys() {
        let cache = AttributionCache::new();
        let web = record("web");
        cache.put_container(PID_1, web.clone(), Duration::from_secs(60));
        cache.put_container(PID_2, web.clone(), Duration::from_secs(60));

        let a = cache.get_container(&PID_1).unwrap();
        let b = cache.get_container(&PID_2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!cache.contains_name(&PID_1));
    }

    #[test]
    fn stores_are_independent() {
        let cache = AttributionCache::new();
        cache.put_name(PID_1, Attribution::Unknown, None);
        assert!(cache.contains_name(&PID_1));
        assert!(!cache.contains_container(&PID_1));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_periodically() {
        let cache = AttributionCache::new();
        cache.put_name(PID_1, Attribution::Unknown, None);
        let sweeper = spawn_sweeper(cache.clone(), Duration::from_secs(600));
        time::sleep(Duration::from_secs(1200)).await;
        assert!(cache.contains_name(&PID_1));
        sweeper.abort();
    }
}
