//! Keyed pool of live connections.
//!
//! # Locking
//!
//! - A per-key `tokio::sync::Mutex` serialises get-or-create for one
//!   [`ConnectionKey`], so concurrent callers for the same key never race to
//!   open duplicate connections. Per-key locks are created lazily in a
//!   `DashMap` and dropped once their entry closes or creation fails, unless
//!   a caller still holds one.
//! - One pool-level mutex guards the entry map. It is held only while the map
//!   is mutated, never across connect, probe or close.
//! - Acquire order is key lock, then pool lock. Never the reverse.
//!
//! Entries are removed from the map before they are closed, so no caller can
//! pick up a half-closed entry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::circuit::CircuitRegistry;
use super::config::{CircuitConfig, PoolConfig};
use super::error::Result;
use super::transport::{CommandRunner, Connector, LIVENESS_PROBE_TIMEOUT, Transport};
use super::types::{CommandOutput, ConnectionInfo, ConnectionKey, ExecRequest, HostTarget};

/// One live connection and its idle bookkeeping.
pub struct ConnectionEntry {
    id: Uuid,
    key: ConnectionKey,
    transport: Box<dyn Transport>,
    connected_at: DateTime<Utc>,
    created: Instant,
    /// Milliseconds after `created` of the last use.
    last_used_ms: AtomicU64,
    idle_timeout: Duration,
}

impl ConnectionEntry {
    fn new(key: ConnectionKey, transport: Box<dyn Transport>, idle_timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            transport,
            connected_at: Utc::now(),
            created: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            idle_timeout,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn touch(&self) {
        let offset = Instant::now().saturating_duration_since(self.created);
        self.last_used_ms
            .fetch_max(offset.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn last_used(&self) -> Instant {
        self.created + Duration::from_millis(self.last_used_ms.load(Ordering::Relaxed))
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.idle_for(now) > self.idle_timeout
    }

    /// Idle-expired entries count as dead without probing. A probe that
    /// does not answer within [`LIVENESS_PROBE_TIMEOUT`] counts as dead too.
    pub async fn is_alive(&self) -> bool {
        if self.is_expired(Instant::now()) {
            return false;
        }
        match tokio::time::timeout(LIVENESS_PROBE_TIMEOUT, self.transport.is_alive()).await {
            Ok(alive) => alive,
            Err(_) => {
                debug!("Liveness probe of {} ({}) timed out", self.id, self.key);
                false
            }
        }
    }

    pub async fn exec(&self, request: &ExecRequest) -> Result<CommandOutput> {
        self.touch();
        let result = self.transport.exec(request).await;
        self.touch();
        result
    }

    async fn close(&self) {
        debug!("Closing connection {} ({})", self.id, self.key);
        self.transport.close().await;
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.to_string(),
            key: self.key.clone(),
            connected_at: self.connected_at.to_rfc3339(),
            idle_secs: self.idle_for(Instant::now()).as_secs(),
            via_jump_host: self.transport.via_jump_host(),
        }
    }
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("id", &self.id)
            .field("key", &self.key.to_string())
            .field("idle", &self.idle_for(Instant::now()))
            .finish()
    }
}

#[async_trait]
impl CommandRunner for ConnectionEntry {
    async fn run(&self, request: &ExecRequest) -> Result<CommandOutput> {
        self.exec(request).await
    }
}

/// Snapshot of pool occupancy and lifetime counters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PoolStats {
    pub total: usize,
    pub max_connections: usize,
    pub per_host: BTreeMap<String, usize>,
    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
    pub closed: u64,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
    closed: AtomicU64,
}

pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    key_locks: DashMap<ConnectionKey, Arc<Mutex<()>>>,
    entries: Mutex<HashMap<ConnectionKey, Arc<ConnectionEntry>>>,
    circuits: CircuitRegistry,
    counters: PoolCounters,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, circuit: CircuitConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            key_locks: DashMap::new(),
            entries: Mutex::new(HashMap::new()),
            circuits: CircuitRegistry::new(circuit),
            counters: PoolCounters::default(),
        }
    }

    /// Per-host circuit breakers.
    pub fn circuits(&self) -> &CircuitRegistry {
        &self.circuits
    }

    fn key_lock(&self, key: &ConnectionKey) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the key's lock unless a caller still holds or waits on it.
    fn release_key_lock(&self, key: &ConnectionKey) {
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Reuse a live entry for the target's key or open a new one.
    ///
    /// Creation failures propagate and are not cached.
    pub async fn get_connection(&self, target: &HostTarget) -> Result<Arc<ConnectionEntry>> {
        target.validate()?;
        let key = target.key();

        let result = {
            let lock = self.key_lock(&key);
            let _key_guard = lock.lock().await;
            self.get_or_create(target, &key).await
        };
        if result.is_err() {
            self.release_key_lock(&key);
        }
        result
    }

    /// Runs under the key lock.
    async fn get_or_create(
        &self,
        target: &HostTarget,
        key: &ConnectionKey,
    ) -> Result<Arc<ConnectionEntry>> {
        let existing = self.entries.lock().await.get(key).cloned();
        if let Some(entry) = existing {
            if entry.is_alive().await {
                entry.touch();
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                debug!("Reusing connection {} for {}", entry.id, key);
                return Ok(entry);
            }
            info!("Connection {} for {} is dead, replacing it", entry.id, key);
            self.remove_if_current(&entry).await;
            self.close_entry(&entry).await;
        }

        self.evict_to_fit(None).await;

        let transport = self
            .connector
            .connect(target, self.config.connect_timeout)
            .await?;
        let entry = Arc::new(ConnectionEntry::new(
            key.clone(),
            transport,
            self.config.idle_timeout,
        ));
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        info!("Opened connection {} for {}", entry.id, key);

        self.entries.lock().await.insert(key.clone(), entry.clone());
        // Another key may have filled the pool while we were connecting.
        self.evict_to_fit(Some(key)).await;

        Ok(entry)
    }

    /// Evict least-recently-used entries until there is room.
    ///
    /// With `keep` set, the pool may hold `max_connections` entries including
    /// `keep`; otherwise room is made for one more.
    async fn evict_to_fit(&self, keep: Option<&ConnectionKey>) {
        let limit = match keep {
            Some(_) => self.config.max_connections,
            None => self.config.max_connections.saturating_sub(1),
        };
        loop {
            let victim = {
                let mut entries = self.entries.lock().await;
                if entries.len() <= limit {
                    return;
                }
                let Some(lru_key) = entries
                    .iter()
                    .filter(|(k, _)| Some(*k) != keep)
                    .min_by_key(|(_, e)| e.last_used())
                    .map(|(k, _)| k.clone())
                else {
                    return;
                };
                entries.remove(&lru_key)
            };
            if let Some(entry) = victim {
                warn!(
                    "Pool at capacity ({}), evicting least recently used {}",
                    self.config.max_connections, entry.key
                );
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                self.close_entry(&entry).await;
            }
        }
    }

    async fn remove_if_current(&self, entry: &Arc<ConnectionEntry>) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(&entry.key) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(&entry.key);
                true
            }
            _ => false,
        }
    }

    async fn close_entry(&self, entry: &ConnectionEntry) {
        entry.close().await;
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        self.release_key_lock(&entry.key);
    }

    /// Drop `entry` so the next request reconnects. A newer entry under the
    /// same key is left alone.
    pub async fn invalidate(&self, entry: &Arc<ConnectionEntry>) {
        if self.remove_if_current(entry).await {
            debug!("Invalidated connection {} for {}", entry.id, entry.key);
            self.close_entry(entry).await;
        }
    }

    async fn close_all(&self, entries: Vec<Arc<ConnectionEntry>>) -> usize {
        let count = entries.len();
        futures::future::join_all(entries.iter().map(|e| self.close_entry(e))).await;
        count
    }

    /// Close every entry for `host`, whatever the port or user.
    pub async fn disconnect(&self, host: &str) -> usize {
        let removed: Vec<_> = {
            let mut entries = self.entries.lock().await;
            let keys: Vec<_> = entries.keys().filter(|k| k.host == host).cloned().collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        let count = self.close_all(removed).await;
        info!("Disconnected {} connection(s) to {}", count, host);
        count
    }

    pub async fn disconnect_all(&self) -> usize {
        let removed: Vec<_> = self.entries.lock().await.drain().map(|(_, e)| e).collect();
        let count = self.close_all(removed).await;
        info!("Disconnected all {} pooled connection(s)", count);
        count
    }

    /// Close entries idle past their timeout.
    pub async fn cleanup_idle(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut entries = self.entries.lock().await;
            let keys: Vec<_> = entries
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        let count = self.close_all(expired).await;
        if count > 0 {
            info!("Closed {} idle connection(s)", count);
        }
        count
    }

    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self
            .entries
            .lock()
            .await
            .values()
            .map(|e| e.info())
            .collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> PoolStats {
        let entries = self.entries.lock().await;
        let mut per_host = BTreeMap::new();
        for key in entries.keys() {
            *per_host.entry(key.host.clone()).or_insert(0) += 1;
        }
        PoolStats {
            total: entries.len(),
            max_connections: self.config.max_connections,
            per_host,
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::error::{ErrorKind, SshCoreError};
    use crate::ssh::testing::FakeConnector;

    fn pool_with(connector: Arc<FakeConnector>, max: usize) -> ConnectionPool {
        ConnectionPool::new(
            PoolConfig {
                max_connections: max,
                idle_timeout: Duration::from_secs(300),
                connect_timeout: Duration::from_secs(30),
            },
            CircuitConfig::default(),
            connector,
        )
    }

    fn target(host: &str) -> HostTarget {
        HostTarget::new(host).with_username("deploy")
    }

    mod get_or_create {
        use super::*;

        #[tokio::test]
        async fn test_reuses_live_entry() {
            let connector = Arc::new(FakeConnector::new());
            let pool = pool_with(connector.clone(), 10);

            let first = pool.get_connection(&target("db-01")).await.unwrap();
            let second = pool.get_connection(&target("db-01")).await.unwrap();

            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(connector.connects(), 1);
            assert_eq!(pool.stats().await.reused, 1);
        }

        #[tokio::test(start_paused = true)]
        async fn test_concurrent_callers_share_one_connection() {
            let connector = Arc::new(FakeConnector::new().with_delay(Duration::from_millis(500)));
            let pool = Arc::new(pool_with(connector.clone(), 10));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let pool = pool.clone();
                    tokio::spawn(async move { pool.get_connection(&target("db-01")).await })
                })
                .collect();

            let mut ids = Vec::new();
            for handle in handles {
                ids.push(handle.await.unwrap().unwrap().id());
            }

            assert_eq!(connector.connects(), 1);
            assert!(ids.iter().all(|id| *id == ids[0]));
        }

        #[tokio::test(start_paused = true)]
        async fn test_different_keys_connect_in_parallel() {
            let connector = Arc::new(FakeConnector::new().with_delay(Duration::from_secs(1)));
            let pool = Arc::new(pool_with(connector.clone(), 10));
            let started = Instant::now();

            let a = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.get_connection(&target("a")).await })
            };
            let b = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.get_connection(&target("b")).await })
            };
            a.await.unwrap().unwrap();
            b.await.unwrap().unwrap();

            assert_eq!(connector.connects(), 2);
            assert!(started.elapsed() < Duration::from_secs(2));
        }

        #[tokio::test]
        async fn test_dead_entry_is_closed_and_replaced() {
            let connector = Arc::new(FakeConnector::new());
            let pool = pool_with(connector.clone(), 10);

            let first = pool.get_connection(&target("db-01")).await.unwrap();
            connector.transport(0).kill();

            let second = pool.get_connection(&target("db-01")).await.unwrap();
            assert_ne!(first.id(), second.id());
            assert_eq!(connector.connects(), 2);
            assert!(connector.transport(0).is_closed());
            assert_eq!(pool.len().await, 1);
        }

        #[tokio::test(start_paused = true)]
        async fn test_unanswered_liveness_check_is_bounded() {
            let connector = Arc::new(FakeConnector::new());
            let pool = pool_with(connector.clone(), 10);

            let first = pool.get_connection(&target("db-01")).await.unwrap();
            connector.transport(0).stall();

            let started = Instant::now();
            let second = pool.get_connection(&target("db-01")).await.unwrap();
            assert!(started.elapsed() >= LIVENESS_PROBE_TIMEOUT);
            assert!(started.elapsed() < LIVENESS_PROBE_TIMEOUT * 2);
            assert_ne!(first.id(), second.id());
            assert_eq!(connector.connects(), 2);
            assert!(connector.transport(0).is_closed());
        }

        #[tokio::test]
        async fn test_failed_creation_is_not_cached() {
            let connector = Arc::new(FakeConnector::new());
            connector.fail_next(SshCoreError::Unreachable {
                host: "db-01".into(),
                reason: "Connection refused".into(),
            });
            let pool = pool_with(connector.clone(), 10);

            let err = pool.get_connection(&target("db-01")).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Unreachable);
            assert!(pool.is_empty().await);
            assert!(pool.key_locks.is_empty());

            pool.get_connection(&target("db-01")).await.unwrap();
            assert_eq!(connector.connects(), 2);
        }

        #[tokio::test]
        async fn test_invalid_port_rejected_before_connecting() {
            let connector = Arc::new(FakeConnector::new());
            let pool = pool_with(connector.clone(), 10);

            let err = pool
                .get_connection(&target("db-01").with_port(0))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput);
            assert_eq!(connector.connects(), 0);
        }

        #[tokio::test(start_paused = true)]
        async fn test_idle_expired_entry_is_replaced() {
            let connector = Arc::new(FakeConnector::new());
            let pool = pool_with(connector.clone(), 10);

            pool.get_connection(&target("db-01")).await.unwrap();
            tokio::time::advance(Duration::from_secs(301)).await;
            pool.get_connection(&target("db-01")).await.unwrap();

            assert_eq!(connector.connects(), 2);
            assert!(connector.transport(0).is_closed());
        }
    }

    mod eviction {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_evicts_least_recently_used_only() {
            let connector = Arc::new(FakeConnector::new());
            let pool = pool_with(connector.clone(), 2);

            let a = pool.get_connection(&target("a")).await.unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
            pool.get_connection(&target("b")).await.unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
            a.touch();
            tokio::time::advance(Duration::from_secs(1)).await;

            pool.get_connection(&target("c")).await.unwrap();

            let transports = connector.transports();
            assert!(!transports[0].is_closed(), "a was used most recently");
            assert!(transports[1].is_closed(), "b is the LRU entry");
            assert!(!transports[2].is_closed());

            let hosts: Vec<_> = pool.list().await.into_iter().map(|i| i.key.host).collect();
            assert_eq!(hosts, vec!["a", "c"]);
            assert_eq!(pool.stats().await.evicted, 1);
        }

        #[tokio::test]
        async fn test_no_eviction_below_capacity() {
            let connector = Arc::new(FakeConnector::new());
            let pool = pool_with(connector.clone(), 3);
            for host in ["a", "b", "c"] {
                pool.get_connection(&target(host)).await.unwrap();
            }
            assert_eq!(pool.len().await, 3);
            assert!(connector.transports().iter().all(|t| !t.is_closed()));
        }
    }

    mod disconnect {
        use super::*;

        #[tokio::test]
        async fn test_disconnect_host_closes_all_ports_and_users() {
            let connector = Arc::new(FakeConnector::new());
            let pool = pool_with(connector.clone(), 10);

            pool.get_connection(&target("db-01")).await.unwrap();
            pool.get_connection(&target("db-01").with_port(2222)).await.unwrap();
            pool.get_connection(&HostTarget::new("db-01").with_username("root"))
                .await
                .unwrap();
            pool.get_connection(&target("web-01")).await.unwrap();

            assert_eq!(pool.disconnect("db-01").await, 3);
            assert_eq!(pool.key_locks.len(), 1);
            let stats = pool.stats().await;
            assert_eq!(stats.total, 1);
            assert_eq!(stats.per_host.get("web-01"), Some(&1));
            let transports = connector.transports();
            for state in &transports {
                assert_eq!(state.is_closed(), state.host == "db-01");
            }
            assert!(
                transports
                    .iter()
                    .any(|s| s.host == "db-01" && s.port == 2222 && s.is_closed())
            );
        }

        #[tokio::test]
        async fn test_disconnect_all() {
            let connector = Arc::new(FakeConnector::new());
            let pool = pool_with(connector.clone(), 10);
            pool.get_connection(&target("a")).await.unwrap();
            pool.get_connection(&target("b")).await.unwrap();

            assert_eq!(pool.key_locks.len(), 2);
            assert_eq!(pool.disconnect_all().await, 2);
            assert!(pool.is_empty().await);
            assert!(pool.key_locks.is_empty());
            assert!(connector.transports().iter().all(|t| t.closes() == 1));
        }

        #[tokio::test]
        async fn test_invalidate_leaves_newer_entry() {
            let connector = Arc::new(FakeConnector::new());
            let pool = pool_with(connector.clone(), 10);

            let stale = pool.get_connection(&target("db-01")).await.unwrap();
            pool.invalidate(&stale).await;
            let fresh = pool.get_connection(&target("db-01")).await.unwrap();

            pool.invalidate(&stale).await;
            assert_eq!(pool.len().await, 1);
            assert_eq!(connector.transport(0).closes(), 1);
            assert!(!connector.transport(1).is_closed());
            assert_eq!(pool.list().await[0].id, fresh.id().to_string());
        }
    }

    mod idle {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_cleanup_idle_closes_only_expired() {
            let connector = Arc::new(FakeConnector::new());
            let pool = pool_with(connector.clone(), 10);

            pool.get_connection(&target("old")).await.unwrap();
            tokio::time::advance(Duration::from_secs(200)).await;
            pool.get_connection(&target("new")).await.unwrap();
            tokio::time::advance(Duration::from_secs(150)).await;

            assert_eq!(pool.cleanup_idle().await, 1);
            assert!(connector.transport(0).is_closed());
            assert!(!connector.transport(1).is_closed());
        }

        #[tokio::test(start_paused = true)]
        async fn test_info_reports_idle_seconds() {
            let connector = Arc::new(FakeConnector::new());
            let pool = pool_with(connector.clone(), 10);
            pool.get_connection(&target("db-01")).await.unwrap();
            tokio::time::advance(Duration::from_secs(42)).await;

            let infos = pool.list().await;
            assert_eq!(infos.len(), 1);
            assert_eq!(infos[0].idle_secs, 42);
            assert!(!infos[0].via_jump_host);
            assert!(DateTime::parse_from_rfc3339(&infos[0].connected_at).is_ok());
        }

        #[tokio::test(start_paused = true)]
        async fn test_debug_shows_id_key_and_idle_time() {
            let connector = Arc::new(FakeConnector::new());
            let pool = pool_with(connector.clone(), 10);
            let entry = pool.get_connection(&target("db-01")).await.unwrap();
            tokio::time::advance(Duration::from_secs(7)).await;

            let debug = format!("{:?}", entry);
            assert!(debug.contains(&entry.id().to_string()));
            assert!(debug.contains("deploy@db-01:22"));
            assert!(debug.contains("idle: 7s"));
        }
    }
}
