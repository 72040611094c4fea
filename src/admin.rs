//! Administration contract, implemented by [`crate::server::Server`] and
//! consumed by the HTTP transport in [`crate::routes`].

use crate::error::QuotaResult;
use crate::service_config::{BucketConfig, NamespaceConfig, ServiceConfig};
use crate::stats::{BucketScore, BucketScores};
use async_trait::async_trait;

#[async_trait]
pub trait Administrable: Send + Sync {
    /// The configuration currently applied.
    fn configs(&self) -> ServiceConfig;

    /// Every distinct configuration ever persisted.
    async fn historical_configs(&self) -> QuotaResult<Vec<ServiceConfig>>;

    /// Persists `config` attributed to `user`. Applied asynchronously.
    async fn update_config(&self, config: ServiceConfig, user: &str) -> QuotaResult<()>;

    async fn add_namespace(&self, namespace: NamespaceConfig, user: &str) -> QuotaResult<()>;
    async fn update_namespace(&self, namespace: NamespaceConfig, user: &str) -> QuotaResult<()>;
    async fn delete_namespace(&self, namespace: &str, user: &str) -> QuotaResult<()>;

    async fn add_bucket(&self, namespace: &str, name: &str, bucket: BucketConfig, user: &str) -> QuotaResult<()>;
    async fn update_bucket(&self, namespace: &str, name: &str, bucket: BucketConfig, user: &str) -> QuotaResult<()>;
    async fn delete_bucket(&self, namespace: &str, name: &str, user: &str) -> QuotaResult<()>;

    async fn top_dynamic_hits(&self, namespace: &str) -> Vec<BucketScore>;
    async fn top_dynamic_misses(&self, namespace: &str) -> Vec<BucketScore>;
    async fn dynamic_bucket_stats(&self, namespace: &str, bucket: &str) -> Option<BucketScores>;
}
