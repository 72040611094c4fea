use crate::backoff::calculate_backoff;
use crate::clock::Clock;
use crate::connection::ConnectionManager;
use crate::error::{QuotaError, QuotaResult};
use crate::service_config::BucketConfig;
use crate::token_bucket::{interpret, BucketKeys, BucketParams};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const MAX_RETRY_BACKOFF_MS: u64 = 2_000;

/// A configured quota that callers take tokens from.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Returns `(wait, true)` when admitted and `(0, false)` when rejected.
    async fn take(&self, requested: i64, max_wait: Duration) -> QuotaResult<(Duration, bool)>;

    fn config(&self) -> &BucketConfig;

    fn dynamic(&self) -> bool;

    fn report_activity(&self);

    /// Whether the bucket saw traffic since the previous call.
    fn activity_detected(&self) -> bool;

    /// Called once the bucket is dropped from service.
    fn destroy(&self);
}

/// Activity bookkeeping shared by bucket implementations.
#[derive(Debug, Default)]
pub struct BucketActivity {
    active: AtomicBool,
    destroyed: AtomicBool,
}

impl BucketActivity {
    pub fn report(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    pub fn detected(&self) -> bool {
        self.active.swap(false, Ordering::Relaxed)
    }

    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Relaxed)
    }
}

/// State shared by every bucket a factory creates.
pub struct BucketRuntime {
    pub connections: ConnectionManager,
    pub clock: Arc<dyn Clock>,
    pub connection_retries: usize,
    pub retry_backoff_ms: u64,
}

/// Bucket whose state lives in the backing store.
pub struct StoreBucket {
    namespace: String,
    name: String,
    config: BucketConfig,
    dynamic: bool,
    keys: BucketKeys,
    params: BucketParams,
    runtime: Arc<BucketRuntime>,
    activity: BucketActivity,
}

impl StoreBucket {
    pub fn new(
        namespace: &str,
        name: &str,
        config: &BucketConfig,
        dynamic: bool,
        runtime: Arc<BucketRuntime>,
    ) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            config: config.clone(),
            dynamic,
            keys: BucketKeys::new(namespace, name),
            params: BucketParams::from_config(config),
            runtime,
            activity: BucketActivity::default(),
        }
    }

    pub fn keys(&self) -> &BucketKeys {
        &self.keys
    }

    pub fn params(&self) -> &BucketParams {
        &self.params
    }

    pub fn is_destroyed(&self) -> bool {
        self.activity.is_destroyed()
    }
}

#[async_trait]
impl Bucket for StoreBucket {
    async fn take(&self, requested: i64, max_wait: Duration) -> QuotaResult<(Duration, bool)> {
        let attempts = self.runtime.connection_retries.max(1);

        for attempt in 0..attempts {
            let delay = calculate_backoff(attempt as u32, self.runtime.retry_backoff_ms, MAX_RETRY_BACKOFF_MS);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let handle = match self.runtime.connections.get_or_connect().await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(attempt, error = %e, "No backing store connection");
                    continue;
                }
            };

            let args = self
                .params
                .take_args(self.runtime.clock.now_nanos(), requested, max_wait);

            match handle.eval_take(&self.keys, &args).await {
                Ok(result) => {
                    let (wait, admitted) = interpret(result);
                    debug!(
                        namespace = %self.namespace,
                        bucket = %self.name,
                        requested,
                        admitted,
                        wait_nanos = wait.as_nanos() as u64,
                        "Take evaluated"
                    );
                    return Ok((wait, admitted));
                }
                Err(e) => {
                    warn!(
                        namespace = %self.namespace,
                        bucket = %self.name,
                        attempt,
                        error = %e,
                        "Take failed; replacing connection"
                    );
                    if let Err(e) = self.runtime.connections.reconnect(&handle).await {
                        warn!(attempt, error = %e, "Reconnect failed");
                    }
                }
            }
        }

        error!(
            namespace = %self.namespace,
            bucket = %self.name,
            attempts,
            "Couldn't reach the backing store"
        );
        Err(QuotaError::RetriesExhausted { attempts })
    }

    fn config(&self) -> &BucketConfig {
        &self.config
    }

    fn dynamic(&self) -> bool {
        self.dynamic
    }

    fn report_activity(&self) {
        self.activity.report();
    }

    fn activity_detected(&self) -> bool {
        self.activity.detected()
    }

    fn destroy(&self) {
        debug!(namespace = %self.namespace, bucket = %self.name, "Bucket destroyed");
        self.activity.destroy();
    }
}
