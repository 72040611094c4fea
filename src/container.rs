use crate::bucket::Bucket;
use crate::bucket_factory::BucketFactory;
use crate::config_validator::ConfigValidator;
use crate::service_config::{NamespaceConfig, ServiceConfig, DEFAULT_BUCKET_NAME, GLOBAL_NAMESPACE};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

struct NamespaceBuckets {
    config: NamespaceConfig,
    buckets: HashMap<String, Arc<dyn Bucket>>,
    default_bucket: Option<Arc<dyn Bucket>>,
    dynamic: DashMap<String, Arc<dyn Bucket>>,
}

/// Live buckets for one applied configuration.
pub struct BucketContainer {
    factory: Arc<dyn BucketFactory>,
    namespaces: HashMap<String, NamespaceBuckets>,
    global_default: Option<Arc<dyn Bucket>>,
}

impl BucketContainer {
    pub fn new(config: &ServiceConfig, factory: Arc<dyn BucketFactory>) -> Self {
        let global_default = config
            .global_default_bucket
            .as_ref()
            .map(|cfg| factory.new_bucket(GLOBAL_NAMESPACE, DEFAULT_BUCKET_NAME, cfg, false));

        let namespaces = config
            .namespaces
            .iter()
            .map(|(name, ns)| {
                let buckets = ns
                    .buckets
                    .iter()
                    .map(|(bucket, cfg)| (bucket.clone(), factory.new_bucket(name, bucket, cfg, false)))
                    .collect();
                let default_bucket = ns
                    .default_bucket
                    .as_ref()
                    .map(|cfg| factory.new_bucket(name, DEFAULT_BUCKET_NAME, cfg, false));

                let entry = NamespaceBuckets {
                    config: ns.clone(),
                    buckets,
                    default_bucket,
                    dynamic: DashMap::new(),
                };
                (name.clone(), entry)
            })
            .collect();

        Self {
            factory,
            namespaces,
            global_default,
        }
    }

    /// Empty container, used before the first configuration is applied.
    pub fn empty(factory: Arc<dyn BucketFactory>) -> Self {
        Self {
            factory,
            namespaces: HashMap::new(),
            global_default: None,
        }
    }

    /// Resolves a bucket: named bucket, then a dynamic bucket (created on
    /// first use while under the namespace cap), then the namespace default,
    /// then the global default.
    pub fn find_bucket(&self, namespace: &str, name: &str) -> Option<Arc<dyn Bucket>> {
        let ns = match self.namespaces.get(namespace) {
            Some(ns) => ns,
            None => return self.global_default.clone(),
        };

        if let Some(bucket) = ns.buckets.get(name) {
            return Some(Arc::clone(bucket));
        }

        if let Some(bucket) = self.find_or_create_dynamic(namespace, ns, name) {
            return Some(bucket);
        }

        ns.default_bucket.clone().or_else(|| self.global_default.clone())
    }

    fn find_or_create_dynamic(
        &self,
        namespace: &str,
        ns: &NamespaceBuckets,
        name: &str,
    ) -> Option<Arc<dyn Bucket>> {
        let template = ns.config.dynamic_bucket_template.as_ref()?;

        if let Some(bucket) = ns.dynamic.get(name) {
            return Some(Arc::clone(bucket.value()));
        }

        if ConfigValidator::validate_name("bucket", name).is_err() {
            debug!(namespace, bucket = name, "Refusing dynamic bucket with invalid name");
            return None;
        }

        // Concurrent creators may overshoot the cap by a few buckets.
        if ns.config.max_dynamic_buckets > 0 && ns.dynamic.len() >= ns.config.max_dynamic_buckets {
            debug!(namespace, bucket = name, "Dynamic bucket limit reached");
            return None;
        }

        let bucket = ns
            .dynamic
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(namespace, bucket = name, "Created dynamic bucket");
                self.factory.new_bucket(namespace, name, template, true)
            })
            .value()
            .clone();
        Some(bucket)
    }

    pub fn dynamic_bucket_count(&self, namespace: &str) -> usize {
        self.namespaces.get(namespace).map_or(0, |ns| ns.dynamic.len())
    }

    /// Drops dynamic buckets that saw no traffic since the previous sweep.
    pub fn reap_idle_dynamic(&self) -> usize {
        let mut reaped = 0;
        for (namespace, ns) in &self.namespaces {
            ns.dynamic.retain(|name, bucket| {
                if bucket.activity_detected() {
                    return true;
                }
                debug!(namespace = %namespace, bucket = %name, "Reaping idle dynamic bucket");
                bucket.destroy();
                reaped += 1;
                false
            });
        }
        if reaped > 0 {
            info!(reaped, "Reaped idle dynamic buckets");
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket_factory::StoreBucketFactory;
    use crate::clock::ManualClock;
    use crate::service_config::BucketConfig;
    use crate::store::{MemoryConnector, MemoryStore};

    fn container(config: &ServiceConfig) -> BucketContainer {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let factory = Arc::new(StoreBucketFactory::new(Arc::new(MemoryConnector::new(store)), clock, 1, 0));
        BucketContainer::new(config, factory)
    }

    fn config() -> ServiceConfig {
        let mut cfg = ServiceConfig::default();
        cfg.add_namespace(
            NamespaceConfig::new("api")
                .with_bucket("search", BucketConfig::new(10, 10))
                .with_default_bucket(BucketConfig::new(1, 1)),
        )
        .unwrap();
        cfg.add_namespace(NamespaceConfig::new("users").with_dynamic_template(BucketConfig::new(5, 5), 2))
            .unwrap();
        cfg
    }

    #[test]
    fn test_named_and_default_buckets() {
        let c = container(&config());
        assert_eq!(c.find_bucket("api", "search").unwrap().config().fill_rate, 10);
        assert_eq!(c.find_bucket("api", "other").unwrap().config().fill_rate, 1);
        assert!(c.find_bucket("missing", "search").is_none());
    }

    #[test]
    fn test_global_default() {
        let mut cfg = config();
        cfg.global_default_bucket = Some(BucketConfig::new(7, 7));
        let c = container(&cfg);
        assert_eq!(c.find_bucket("missing", "x").unwrap().config().fill_rate, 7);
        // Names unusable as dynamic buckets fall through to the global default.
        assert_eq!(c.find_bucket("users", "bad:name").unwrap().config().fill_rate, 7);
    }

    #[test]
    fn test_dynamic_buckets_respect_cap() {
        let c = container(&config());
        let alice = c.find_bucket("users", "alice").unwrap();
        assert!(alice.dynamic());
        assert!(Arc::ptr_eq(&alice, &c.find_bucket("users", "alice").unwrap()));

        assert!(c.find_bucket("users", "bob").is_some());
        assert!(c.find_bucket("users", "carol").is_none());
        assert_eq!(c.dynamic_bucket_count("users"), 2);
    }

    #[test]
    fn test_reap_idle_dynamic() {
        let c = container(&config());
        let alice = c.find_bucket("users", "alice").unwrap();
        c.find_bucket("users", "bob").unwrap();
        alice.report_activity();

        assert_eq!(c.reap_idle_dynamic(), 1);
        assert_eq!(c.dynamic_bucket_count("users"), 1);

        // Alice's activity flag was consumed by the first sweep.
        assert_eq!(c.reap_idle_dynamic(), 1);
        assert_eq!(c.dynamic_bucket_count("users"), 0);
    }
}
