use crate::bucket::{Bucket, BucketRuntime, StoreBucket};
use crate::clock::Clock;
use crate::connection::ConnectionManager;
use crate::error::QuotaResult;
use crate::service_config::{BucketConfig, ServiceConfig, DEFAULT_BUCKET_NAME, GLOBAL_NAMESPACE};
use crate::store::StoreConnector;
use crate::token_bucket::{ACCUMULATED_TOKENS_SUFFIX, TOKENS_NEXT_AVAILABLE_SUFFIX};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait BucketFactory: Send + Sync {
    /// Prepares the factory for `config`: connection, script and stale state cleanup.
    async fn init(&self, config: &ServiceConfig) -> QuotaResult<()>;

    /// Pure construction; no I/O.
    fn new_bucket(&self, namespace: &str, name: &str, config: &BucketConfig, dynamic: bool) -> Arc<dyn Bucket>;

    /// Whether the backing store currently answers.
    async fn healthy(&self) -> bool;

    async fn close(&self);
}

pub struct StoreBucketFactory {
    runtime: Arc<BucketRuntime>,
}

impl StoreBucketFactory {
    pub fn new(
        connector: Arc<dyn StoreConnector>,
        clock: Arc<dyn Clock>,
        connection_retries: usize,
        retry_backoff_ms: u64,
    ) -> Self {
        Self {
            runtime: Arc::new(BucketRuntime {
                connections: ConnectionManager::new(connector),
                clock,
                connection_retries: connection_retries.max(1),
                retry_backoff_ms,
            }),
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.runtime.connections
    }

    async fn clean_stale_buckets(&self, config: &ServiceConfig) -> QuotaResult<usize> {
        info!("Inspecting all buckets in the backing store");
        let handle = self.runtime.connections.get_or_connect().await?;
        let existing = handle.connection().scan_bucket_keys().await?;

        let stale = stale_keys(&existing, config);
        if stale.is_empty() {
            return Ok(0);
        }

        let deleted = handle.connection().delete_keys(&stale).await?;
        info!(deleted, scanned = existing.len(), "Removed stale bucket state");
        Ok(deleted)
    }
}

#[async_trait]
impl BucketFactory for StoreBucketFactory {
    async fn init(&self, config: &ServiceConfig) -> QuotaResult<()> {
        self.runtime.connections.ensure_script().await?;

        if let Err(e) = self.clean_stale_buckets(config).await {
            warn!(error = %e, "Problems cleaning stale buckets");
        }

        Ok(())
    }

    fn new_bucket(&self, namespace: &str, name: &str, config: &BucketConfig, dynamic: bool) -> Arc<dyn Bucket> {
        Arc::new(StoreBucket::new(namespace, name, config, dynamic, Arc::clone(&self.runtime)))
    }

    async fn healthy(&self) -> bool {
        match self.runtime.connections.current() {
            Some(handle) => handle.connection().ping().await.is_ok(),
            None => false,
        }
    }

    async fn close(&self) {
        self.runtime.connections.close().await;
    }
}

/// Keys among `existing` that `config` no longer accounts for.
///
/// State under a namespace with a dynamic bucket template is kept, since any
/// bucket name there may belong to a live dynamic bucket.
pub fn stale_keys(existing: &[String], config: &ServiceConfig) -> Vec<String> {
    let mut known: HashSet<(&str, &str)> = HashSet::new();
    let mut dynamic_namespaces: HashSet<&str> = HashSet::new();

    if config.global_default_bucket.is_some() {
        known.insert((GLOBAL_NAMESPACE, DEFAULT_BUCKET_NAME));
    }

    for (name, namespace) in &config.namespaces {
        let name = name.as_str();
        if namespace.default_bucket.is_some() {
            known.insert((name, DEFAULT_BUCKET_NAME));
        }
        if namespace.dynamic_bucket_template.is_some() {
            dynamic_namespaces.insert(name);
        }
        for bucket in namespace.buckets.keys() {
            known.insert((name, bucket.as_str()));
        }
    }

    existing
        .iter()
        .filter(|key| match split_state_key(key) {
            Some((namespace, bucket)) => {
                !dynamic_namespaces.contains(namespace) && !known.contains(&(namespace, bucket))
            }
            None => false,
        })
        .cloned()
        .collect()
}

fn split_state_key(key: &str) -> Option<(&str, &str)> {
    let (rest, suffix) = key.rsplit_once(':')?;
    if suffix != TOKENS_NEXT_AVAILABLE_SUFFIX && suffix != ACCUMULATED_TOKENS_SUFFIX {
        return None;
    }
    rest.split_once(':')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::service_config::NamespaceConfig;
    use crate::store::{MemoryConnector, MemoryStore};
    use std::time::Duration;

    fn config() -> ServiceConfig {
        let mut cfg = ServiceConfig {
            global_default_bucket: Some(BucketConfig::new(1, 1)),
            ..ServiceConfig::default()
        };
        cfg.add_namespace(
            NamespaceConfig::new("api")
                .with_bucket("search", BucketConfig::new(1, 1))
                .with_default_bucket(BucketConfig::new(1, 1)),
        )
        .unwrap();
        cfg.add_namespace(NamespaceConfig::new("users").with_dynamic_template(BucketConfig::new(1, 1), 0))
            .unwrap();
        cfg
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_stale_keys() {
        let existing = keys(&[
            "api:search:TNA",
            "api:search:AT",
            "api:___default_bucket___:AT",
            "api:removed:TNA",
            "api:removed:AT",
            "gone:x:AT",
            "users:alice:TNA",
            "___GLOBAL___:___default_bucket___:TNA",
        ]);
        let mut stale = stale_keys(&existing, &config());
        stale.sort();
        assert_eq!(stale, keys(&["api:removed:AT", "api:removed:TNA", "gone:x:AT"]));
    }

    #[test]
    fn test_new_bucket_is_pure() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let factory = StoreBucketFactory::new(Arc::new(MemoryConnector::new(store.clone())), clock, 3, 0);

        let bucket = factory.new_bucket("api", "search", &BucketConfig::new(4, 8), true);
        assert!(bucket.dynamic());
        assert_eq!(bucket.config().size, 8);
        assert_eq!(store.connect_count(), 0);
        assert!(factory.connections().current().is_none());
    }

    #[tokio::test]
    async fn test_init_cleans_removed_buckets() {
        let clock = Arc::new(ManualClock::new(1_000_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let factory = StoreBucketFactory::new(Arc::new(MemoryConnector::new(store.clone())), clock, 3, 0);

        let cfg = config();
        factory.init(&cfg).await.unwrap();
        for name in ["search", "obsolete"] {
            let bucket = factory.new_bucket("api", name, &BucketConfig::new(1, 5), false);
            assert!(bucket.take(1, Duration::ZERO).await.unwrap().1);
        }
        assert_eq!(store.keys().len(), 4);

        factory.init(&cfg).await.unwrap();
        assert_eq!(store.keys(), keys(&["api:search:AT", "api:search:TNA"]));
        assert_eq!(store.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_init_fails_without_store() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let factory = StoreBucketFactory::new(Arc::new(MemoryConnector::new(store.clone())), clock, 3, 0);

        store.fail_next_connects(1);
        assert!(factory.init(&config()).await.is_err());
        assert!(!factory.healthy().await);
        assert_eq!(store.connect_count(), 0);

        factory.init(&config()).await.unwrap();
        assert!(factory.healthy().await);
        assert_eq!(store.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_health_check_does_not_reopen_closed_connection() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let factory = StoreBucketFactory::new(Arc::new(MemoryConnector::new(store.clone())), clock, 3, 0);

        factory.init(&config()).await.unwrap();
        factory.close().await;

        assert!(!factory.healthy().await);
        assert!(factory.connections().current().is_none());
        assert_eq!(store.connect_count(), 1);
    }
}
