//! The quota server: owns the active configuration and keeps it in sync with
//! the persister.
//!
//! # Data Flow
//! ```text
//! update_config / CRUD
//!     → validate, stamp user, version and date, marshal
//!     → ConfigPersister::persist_and_notify
//!     → coalesced signal
//!     → reload loop: read current blob, decode, validate
//!     → keep version past the active one, BucketFactory::init
//!     → atomic swap of the active snapshot
//! ```
//!
//! Readers load the active snapshot lock-free and never see a half-applied
//! configuration. Only the reload loop swaps it, so at most one
//! reconfiguration is in flight.

use crate::admin::Administrable;
use crate::bucket_factory::BucketFactory;
use crate::clock::unix_seconds;
use crate::config_validator::ConfigValidator;
use crate::container::BucketContainer;
use crate::error::{QuotaError, QuotaResult};
use crate::persister::ConfigPersister;
use crate::service_config::{BucketConfig, NamespaceConfig, ServiceConfig};
use crate::stats::{BucketScore, BucketScores, StatsCollector};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Created,
    /// `start` is loading the first configuration; `stop` is refused.
    Starting,
    Started,
    Stopped,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::Created,
            1 => Lifecycle::Starting,
            2 => Lifecycle::Started,
            _ => Lifecycle::Stopped,
        }
    }
}

/// Result of the most recent attempt to apply configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReloadOutcome {
    Pending,
    Applied { version: u64 },
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// How often idle dynamic buckets are dropped; zero disables reaping.
    pub dynamic_reap_interval: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            dynamic_reap_interval: Duration::from_secs(60),
        }
    }
}

/// Configuration and buckets applied together.
pub struct Snapshot {
    pub config: Arc<ServiceConfig>,
    pub buckets: BucketContainer,
}

pub struct Server {
    persister: Arc<dyn ConfigPersister>,
    factory: Arc<dyn BucketFactory>,
    initial_config: ServiceConfig,
    settings: ServerSettings,
    active: ArcSwap<Snapshot>,
    stats: StatsCollector,
    lifecycle: AtomicU8,
    admin_lock: tokio::sync::Mutex<()>,
    reloads: watch::Sender<ReloadOutcome>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// `initial_config` is used when the persister holds nothing yet.
    pub fn new(
        initial_config: ServiceConfig,
        persister: Arc<dyn ConfigPersister>,
        factory: Arc<dyn BucketFactory>,
        settings: ServerSettings,
    ) -> Arc<Self> {
        let empty = Snapshot {
            config: Arc::new(initial_config.clone()),
            buckets: BucketContainer::empty(Arc::clone(&factory)),
        };
        let (reloads, _) = watch::channel(ReloadOutcome::Pending);
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            persister,
            factory,
            initial_config,
            settings,
            active: ArcSwap::from_pointee(empty),
            stats: StatsCollector::new(),
            lifecycle: AtomicU8::new(Lifecycle::Created as u8),
            admin_lock: tokio::sync::Mutex::new(()),
            reloads,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    /// Loads the persisted configuration and starts the background loops.
    pub async fn start(self: &Arc<Self>) -> QuotaResult<()> {
        self.transition(Lifecycle::Created, Lifecycle::Starting)?;

        let watcher = self.persister.config_changed_watcher();
        if let Err(e) = self.load_initial(&watcher).await {
            self.lifecycle.store(Lifecycle::Created as u8, Ordering::SeqCst);
            return Err(e);
        }

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(reload_loop(
            Arc::downgrade(self),
            watcher,
            self.shutdown.subscribe(),
        )));
        if !self.settings.dynamic_reap_interval.is_zero() {
            tasks.push(tokio::spawn(reap_loop(
                Arc::downgrade(self),
                self.settings.dynamic_reap_interval,
                self.shutdown.subscribe(),
            )));
        }
        self.tasks
            .lock()
            .map_err(|_| QuotaError::Internal("Failed to acquire task lock".into()))?
            .extend(tasks);
        self.transition(Lifecycle::Starting, Lifecycle::Started)?;

        info!(version = self.active_config().version, "Quota server started");
        Ok(())
    }

    /// Stops the background loops and releases the store connection.
    /// In-flight takes finish on their own.
    pub async fn stop(&self) -> QuotaResult<()> {
        self.transition(Lifecycle::Started, Lifecycle::Stopped)?;
        self.shutdown.send_replace(true);

        let tasks = {
            let mut guard = self
                .tasks
                .lock()
                .map_err(|_| QuotaError::Internal("Failed to acquire task lock".into()))?;
            std::mem::take(&mut *guard)
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        self.factory.close().await;
        info!("Quota server stopped");
        Ok(())
    }

    /// Takes `tokens` from the bucket resolved for `namespace`/`bucket`.
    pub async fn allow(
        &self,
        namespace: &str,
        bucket: &str,
        tokens: i64,
        max_wait: Duration,
    ) -> QuotaResult<(Duration, bool)> {
        if self.lifecycle() != Lifecycle::Started {
            return Err(QuotaError::Lifecycle("Server is not started".into()));
        }
        if tokens < 1 {
            return Err(QuotaError::Validation("tokens must be positive".into()));
        }

        let snapshot = self.active.load_full();
        let found = snapshot
            .buckets
            .find_bucket(namespace, bucket)
            .ok_or_else(|| QuotaError::NoSuchBucket {
                namespace: namespace.to_string(),
                bucket: bucket.to_string(),
            })?;

        found.report_activity();
        let (wait, admitted) = found.take(tokens, max_wait).await?;

        if found.dynamic() {
            self.stats.record(namespace, bucket, admitted).await;
        }

        Ok((wait, admitted))
    }

    /// The applied configuration, as an immutable snapshot.
    pub fn active_config(&self) -> Arc<ServiceConfig> {
        Arc::clone(&self.active.load().config)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.active.load_full()
    }

    /// Side channel reporting each applied or rejected configuration.
    pub fn subscribe_reloads(&self) -> watch::Receiver<ReloadOutcome> {
        self.reloads.subscribe()
    }

    pub async fn store_healthy(&self) -> bool {
        self.factory.healthy().await
    }

    fn transition(&self, from: Lifecycle, to: Lifecycle) -> QuotaResult<()> {
        self.lifecycle
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|current| {
                QuotaError::Lifecycle(format!(
                    "Cannot move from {:?} to {:?}",
                    Lifecycle::from_u8(current),
                    to
                ))
            })
    }

    async fn load_initial(&self, watcher: &Notify) -> QuotaResult<()> {
        // Anything persisted so far is read below; a stale wake-up would
        // only re-apply it under a new version.
        tokio::select! {
            biased;
            _ = watcher.notified() => debug!("Discarded pending change notification"),
            _ = std::future::ready(()) => {}
        }

        let config = match self.persister.read_persisted_config().await? {
            Some(blob) => ServiceConfig::unmarshal(&blob)?,
            None => {
                info!("No persisted configuration; starting from the default");
                self.initial_config.clone()
            }
        };

        ConfigValidator::validate_service_config(&config)?;
        let version = self.apply(config).await?;
        self.reloads.send_replace(ReloadOutcome::Applied { version });
        Ok(())
    }

    async fn handle_change(&self) {
        match self.reload().await {
            Ok(version) => {
                self.reloads.send_replace(ReloadOutcome::Applied { version });
            }
            Err(e) => {
                error!(error = %e, "Configuration change rejected; keeping the active configuration");
                self.reloads.send_replace(ReloadOutcome::Failed { error: e.to_string() });
            }
        }
    }

    /// Applies the current blob. Its stamped version is kept unless it does
    /// not move past the active one.
    async fn reload(&self) -> QuotaResult<u64> {
        let blob = self
            .persister
            .read_persisted_config()
            .await?
            .ok_or_else(|| QuotaError::ConfigApply("Notified, but nothing is persisted".into()))?;

        let mut config = ServiceConfig::unmarshal(&blob)
            .map_err(|e| QuotaError::ConfigApply(format!("Cannot decode configuration: {}", e)))?;
        ConfigValidator::validate_service_config(&config)
            .map_err(|e| QuotaError::ConfigApply(e.to_string()))?;

        let current = self.active_config();
        if config == *current {
            debug!(version = current.version, "Persisted configuration is already active");
            return Ok(current.version);
        }
        config.version = config.version.max(current.version + 1);
        if config.date == 0 {
            config.date = unix_seconds();
        }
        config.date = config.date.max(current.date);

        self.apply(config).await
    }

    async fn apply(&self, config: ServiceConfig) -> QuotaResult<u64> {
        self.factory
            .init(&config)
            .await
            .map_err(|e| QuotaError::ConfigApply(e.to_string()))?;

        let buckets = BucketContainer::new(&config, Arc::clone(&self.factory));
        let version = config.version;
        let user = config.user.clone();
        self.active.store(Arc::new(Snapshot {
            config: Arc::new(config),
            buckets,
        }));

        info!(version, user = %user, "Applied configuration");
        Ok(version)
    }

    /// Latest persisted configuration, which may be ahead of the applied one.
    async fn latest_config(&self) -> QuotaResult<ServiceConfig> {
        match self.persister.read_persisted_config().await? {
            Some(blob) => ServiceConfig::unmarshal(&blob),
            None => Ok(self.configs()),
        }
    }

    /// Stamps `config` past both the applied and the latest persisted
    /// configuration, then persists it.
    async fn persist(&self, mut config: ServiceConfig, user: &str) -> QuotaResult<()> {
        ConfigValidator::validate_service_config(&config)?;

        let active = self.active_config();
        let persisted = match self.persister.read_persisted_config().await? {
            // An undecodable blob never gets applied, so it doesn't bound the next version.
            Some(blob) => ServiceConfig::unmarshal(&blob).ok(),
            None => None,
        };
        let (persisted_version, persisted_date) = persisted.map_or((0, 0), |p| (p.version, p.date));

        config.user = user.to_string();
        config.version = active.version.max(persisted_version) + 1;
        config.date = unix_seconds().max(active.date).max(persisted_date);

        let blob = config.marshal()?;
        self.persister.persist_and_notify(&blob).await?;

        info!(
            user,
            version = config.version,
            namespaces = config.namespaces.len(),
            "Persisted configuration update"
        );
        Ok(())
    }

    async fn modify<F>(&self, user: &str, change: F) -> QuotaResult<()>
    where
        F: FnOnce(&mut ServiceConfig) -> QuotaResult<()> + Send,
    {
        let _guard = self.admin_lock.lock().await;
        let mut config = self.latest_config().await?;
        change(&mut config)?;
        self.persist(config, user).await
    }
}

#[async_trait]
impl Administrable for Server {
    fn configs(&self) -> ServiceConfig {
        self.active_config().as_ref().clone()
    }

    async fn historical_configs(&self) -> QuotaResult<Vec<ServiceConfig>> {
        self.persister
            .read_historical_configs()
            .await?
            .iter()
            .map(|blob| ServiceConfig::unmarshal(blob))
            .collect()
    }

    async fn update_config(&self, config: ServiceConfig, user: &str) -> QuotaResult<()> {
        let _guard = self.admin_lock.lock().await;
        self.persist(config, user).await
    }

    async fn add_namespace(&self, namespace: NamespaceConfig, user: &str) -> QuotaResult<()> {
        self.modify(user, |cfg| cfg.add_namespace(namespace)).await
    }

    async fn update_namespace(&self, namespace: NamespaceConfig, user: &str) -> QuotaResult<()> {
        self.modify(user, |cfg| cfg.update_namespace(namespace)).await
    }

    async fn delete_namespace(&self, namespace: &str, user: &str) -> QuotaResult<()> {
        self.modify(user, |cfg| cfg.delete_namespace(namespace).map(|_| ()))
            .await?;
        self.stats.reset_namespace(namespace).await;
        Ok(())
    }

    async fn add_bucket(&self, namespace: &str, name: &str, bucket: BucketConfig, user: &str) -> QuotaResult<()> {
        self.modify(user, |cfg| cfg.add_bucket(namespace, name, bucket)).await
    }

    async fn update_bucket(&self, namespace: &str, name: &str, bucket: BucketConfig, user: &str) -> QuotaResult<()> {
        self.modify(user, |cfg| cfg.update_bucket(namespace, name, bucket)).await
    }

    async fn delete_bucket(&self, namespace: &str, name: &str, user: &str) -> QuotaResult<()> {
        self.modify(user, |cfg| cfg.delete_bucket(namespace, name).map(|_| ()))
            .await
    }

    async fn top_dynamic_hits(&self, namespace: &str) -> Vec<BucketScore> {
        self.stats.top_hits(namespace).await
    }

    async fn top_dynamic_misses(&self, namespace: &str) -> Vec<BucketScore> {
        self.stats.top_misses(namespace).await
    }

    async fn dynamic_bucket_stats(&self, namespace: &str, bucket: &str) -> Option<BucketScores> {
        self.stats.bucket_scores(namespace, bucket).await
    }
}

async fn reload_loop(server: Weak<Server>, watcher: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = watcher.notified() => {
                let Some(server) = server.upgrade() else { break };
                server.handle_change().await;
            }
        }
    }
    debug!("Reload loop exited");
}

async fn reap_loop(server: Weak<Server>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;

    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let Some(server) = server.upgrade() else { break };
                server.snapshot().buckets.reap_idle_dynamic();
            }
        }
    }
    debug!("Dynamic bucket reaper exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket_factory::StoreBucketFactory;
    use crate::clock::ManualClock;
    use crate::persister::MemoryConfigPersister;
    use crate::store::{MemoryConnector, MemoryStore};

    /// Delays reads so tests can act while `start` is loading.
    struct SlowPersister {
        inner: MemoryConfigPersister,
        delay: Duration,
    }

    #[async_trait]
    impl ConfigPersister for SlowPersister {
        async fn persist_and_notify(&self, blob: &[u8]) -> QuotaResult<()> {
            self.inner.persist_and_notify(blob).await
        }

        async fn read_persisted_config(&self) -> QuotaResult<Option<Vec<u8>>> {
            tokio::time::sleep(self.delay).await;
            self.inner.read_persisted_config().await
        }

        async fn read_historical_configs(&self) -> QuotaResult<Vec<Vec<u8>>> {
            self.inner.read_historical_configs().await
        }

        fn config_changed_watcher(&self) -> Arc<Notify> {
            self.inner.config_changed_watcher()
        }
    }

    fn server_with(persister: Arc<dyn ConfigPersister>) -> (Arc<MemoryStore>, Arc<Server>) {
        let clock = Arc::new(ManualClock::new(1_000_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let factory = Arc::new(StoreBucketFactory::new(
            Arc::new(MemoryConnector::new(Arc::clone(&store))),
            clock,
            2,
            0,
        ));
        let initial = ServiceConfig::default();
        let server = Server::new(initial, persister, factory, ServerSettings::default());
        (store, server)
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (_, server) = server_with(Arc::new(MemoryConfigPersister::new()));
        assert_eq!(server.lifecycle(), Lifecycle::Created);
        assert!(server.stop().await.is_err());

        server.start().await.unwrap();
        assert_eq!(server.lifecycle(), Lifecycle::Started);
        assert!(matches!(server.start().await, Err(QuotaError::Lifecycle(_))));

        server.stop().await.unwrap();
        assert_eq!(server.lifecycle(), Lifecycle::Stopped);
        assert!(server.start().await.is_err());
        assert!(server.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_start_prefers_persisted_config() {
        let persister = Arc::new(MemoryConfigPersister::new());
        let mut persisted = ServiceConfig::default();
        persisted
            .add_namespace(NamespaceConfig::new("api").with_bucket("search", BucketConfig::new(1, 1)))
            .unwrap();
        persisted.version = 7;
        persister.persist_and_notify(&persisted.marshal().unwrap()).await.unwrap();

        let (_, server) = server_with(persister);
        server.start().await.unwrap();
        assert_eq!(server.active_config().version, 7);
        assert!(server.active_config().namespace("api").is_some());
        assert_eq!(*server.subscribe_reloads().borrow(), ReloadOutcome::Applied { version: 7 });
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_refused_while_starting() {
        let persister = Arc::new(SlowPersister {
            inner: MemoryConfigPersister::new(),
            delay: Duration::from_millis(100),
        });
        let (_, server) = server_with(persister);

        let starting = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.start().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(server.lifecycle(), Lifecycle::Starting);
        assert!(matches!(server.stop().await, Err(QuotaError::Lifecycle(_))));

        starting.await.unwrap().unwrap();
        assert_eq!(server.lifecycle(), Lifecycle::Started);
        server.stop().await.unwrap();

        // No reload loop survives the stop.
        server.update_config(ServiceConfig::default(), "ops").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.active_config().version, 0);
    }

    #[tokio::test]
    async fn test_updates_are_stamped_past_persisted_version() {
        let persister = Arc::new(MemoryConfigPersister::new());
        let mut persisted = ServiceConfig::default();
        persisted.version = 7;
        persisted.date = 1_000;
        persister.persist_and_notify(&persisted.marshal().unwrap()).await.unwrap();

        let (_, server) = server_with(persister.clone());
        server.start().await.unwrap();
        server.update_config(ServiceConfig::default(), "ops").await.unwrap();

        let blob = persister.read_persisted_config().await.unwrap().unwrap();
        let stamped = ServiceConfig::unmarshal(&blob).unwrap();
        assert_eq!(stamped.version, 8);
        assert_eq!(stamped.user, "ops");
        assert!(stamped.date >= 1_000);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_can_be_retried() {
        let (store, server) = server_with(Arc::new(MemoryConfigPersister::new()));
        store.fail_next_connects(1);
        assert!(server.start().await.is_err());
        assert_eq!(server.lifecycle(), Lifecycle::Created);
        server.start().await.unwrap();
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_allow_requires_started_server() {
        let (_, server) = server_with(Arc::new(MemoryConfigPersister::new()));
        assert!(matches!(
            server.allow("ns", "b", 1, Duration::ZERO).await,
            Err(QuotaError::Lifecycle(_))
        ));
    }

    #[tokio::test]
    async fn test_update_config_validates_before_persisting() {
        let persister = Arc::new(MemoryConfigPersister::new());
        let (_, server) = server_with(persister.clone());

        let mut bad = ServiceConfig::default();
        bad.add_namespace(NamespaceConfig::new("api").with_bucket("search", BucketConfig::new(-1, 1)))
            .unwrap();
        assert!(matches!(
            server.update_config(bad, "ops").await,
            Err(QuotaError::Validation(_))
        ));
        assert!(persister.read_persisted_config().await.unwrap().is_none());
    }
}
