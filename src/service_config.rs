use crate::error::{QuotaError, QuotaResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

/// Namespace holding the global default bucket.
pub const GLOBAL_NAMESPACE: &str = "___GLOBAL___";
/// Bucket name used for a namespace's default bucket.
pub const DEFAULT_BUCKET_NAME: &str = "___default_bucket___";

/// Complete quota configuration of the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub version: u64,
    /// Unix seconds of the last applied change.
    #[serde(default)]
    pub date: u64,
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_default_bucket: Option<BucketConfig>,
    #[serde(default)]
    pub namespaces: BTreeMap<String, NamespaceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NamespaceConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_bucket: Option<BucketConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_bucket_template: Option<BucketConfig>,
    /// Upper bound on live dynamic buckets; 0 means unlimited.
    #[serde(default)]
    pub max_dynamic_buckets: usize,
    #[serde(default)]
    pub buckets: BTreeMap<String, BucketConfig>,
}

/// Token bucket parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct BucketConfig {
    /// Tokens added per second.
    #[validate(range(min = 1i64, max = 1_000_000_000i64, message = "fill_rate must be between 1 and 1e9"))]
    pub fill_rate: i64,
    /// Maximum number of tokens the bucket accumulates.
    #[validate(range(min = 1i64, message = "size must be positive"))]
    pub size: i64,
    /// TTL of idle bucket state; 0 keeps state forever.
    #[serde(default)]
    #[validate(range(min = 0i64, message = "max_idle_millis cannot be negative"))]
    pub max_idle_millis: i64,
    /// How far into the future tokens may be borrowed.
    #[serde(default)]
    #[validate(range(min = 0i64, max = 9_223_372_036_854i64, message = "max_debt_millis out of range"))]
    pub max_debt_millis: i64,
    /// Marks a dynamic bucket template. Only templates may set it.
    #[serde(default)]
    pub dynamic: bool,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            fill_rate: 100,
            size: 100,
            max_idle_millis: 0,
            max_debt_millis: 0,
            dynamic: false,
        }
    }
}

impl ServiceConfig {
    pub fn namespace(&self, name: &str) -> Option<&NamespaceConfig> {
        self.namespaces.get(name)
    }

    pub fn add_namespace(&mut self, namespace: NamespaceConfig) -> QuotaResult<()> {
        if self.namespaces.contains_key(&namespace.name) {
            return Err(QuotaError::AlreadyExists(format!("Namespace {}", namespace.name)));
        }
        self.namespaces.insert(namespace.name.clone(), namespace);
        Ok(())
    }

    pub fn update_namespace(&mut self, namespace: NamespaceConfig) -> QuotaResult<()> {
        match self.namespaces.get_mut(&namespace.name) {
            Some(existing) => {
                *existing = namespace;
                Ok(())
            }
            None => Err(QuotaError::NoSuchNamespace(namespace.name)),
        }
    }

    pub fn delete_namespace(&mut self, name: &str) -> QuotaResult<NamespaceConfig> {
        self.namespaces
            .remove(name)
            .ok_or_else(|| QuotaError::NoSuchNamespace(name.to_string()))
    }

    fn namespace_mut(&mut self, name: &str) -> QuotaResult<&mut NamespaceConfig> {
        self.namespaces
            .get_mut(name)
            .ok_or_else(|| QuotaError::NoSuchNamespace(name.to_string()))
    }

    pub fn add_bucket(&mut self, namespace: &str, name: &str, bucket: BucketConfig) -> QuotaResult<()> {
        let ns = self.namespace_mut(namespace)?;
        if ns.buckets.contains_key(name) {
            return Err(QuotaError::AlreadyExists(format!("Bucket {}:{}", namespace, name)));
        }
        ns.buckets.insert(name.to_string(), bucket);
        Ok(())
    }

    pub fn update_bucket(&mut self, namespace: &str, name: &str, bucket: BucketConfig) -> QuotaResult<()> {
        let ns = self.namespace_mut(namespace)?;
        match ns.buckets.get_mut(name) {
            Some(existing) => {
                *existing = bucket;
                Ok(())
            }
            None => Err(QuotaError::NoSuchBucket {
                namespace: namespace.to_string(),
                bucket: name.to_string(),
            }),
        }
    }

    pub fn delete_bucket(&mut self, namespace: &str, name: &str) -> QuotaResult<BucketConfig> {
        let ns = self.namespace_mut(namespace)?;
        ns.buckets.remove(name).ok_or_else(|| QuotaError::NoSuchBucket {
            namespace: namespace.to_string(),
            bucket: name.to_string(),
        })
    }

    /// Serializes to the persisted blob format.
    pub fn marshal(&self) -> QuotaResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn unmarshal(blob: &[u8]) -> QuotaResult<Self> {
        Ok(serde_json::from_slice(blob)?)
    }
}

impl NamespaceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_bucket(mut self, name: impl Into<String>, bucket: BucketConfig) -> Self {
        self.buckets.insert(name.into(), bucket);
        self
    }

    pub fn with_default_bucket(mut self, bucket: BucketConfig) -> Self {
        self.default_bucket = Some(bucket);
        self
    }

    pub fn with_dynamic_template(mut self, mut template: BucketConfig, max_dynamic_buckets: usize) -> Self {
        template.dynamic = true;
        self.dynamic_bucket_template = Some(template);
        self.max_dynamic_buckets = max_dynamic_buckets;
        self
    }
}

impl BucketConfig {
    pub fn new(fill_rate: i64, size: i64) -> Self {
        Self {
            fill_rate,
            size,
            ..Self::default()
        }
    }
}
