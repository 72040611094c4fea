//! Backing store access.
//!
//! Bucket state is owned by the store; nothing here caches it. The only
//! requirement on an implementation is that [`StoreConnection::eval_take`]
//! runs the whole token bucket procedure atomically against both keys.

pub mod memory;
pub mod redis;

use crate::error::QuotaResult;
use crate::token_bucket::{BucketKeys, TakeArgs, ACCUMULATED_TOKENS_SUFFIX, TOKENS_NEXT_AVAILABLE_SUFFIX};
use async_trait::async_trait;
use std::sync::Arc;

pub use self::memory::{MemoryConnector, MemoryStore};
pub use self::redis::RedisConnector;

/// Opens connections to a backing store.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> QuotaResult<Arc<dyn StoreConnection>>;

    /// Human readable target, for logs.
    fn describe(&self) -> String;
}

/// A live connection. Dropping the last reference closes it.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    async fn ping(&self) -> QuotaResult<()>;

    /// Store clock in unix seconds.
    async fn server_time(&self) -> QuotaResult<u64>;

    /// Loads the script and returns the handle used to invoke it.
    async fn load_script(&self, script: &str) -> QuotaResult<String>;

    /// Runs the take script; returns the wait in nanos, or a negative value on rejection.
    async fn eval_take(&self, script_sha: &str, keys: &BucketKeys, args: &TakeArgs) -> QuotaResult<i64>;

    /// Every key that looks like bucket state.
    async fn scan_bucket_keys(&self) -> QuotaResult<Vec<String>>;

    async fn delete_keys(&self, keys: &[String]) -> QuotaResult<usize>;
}

pub fn is_bucket_state_key(key: &str) -> bool {
    match key.rsplit_once(':') {
        Some((prefix, suffix)) => {
            prefix.contains(':')
                && (suffix == TOKENS_NEXT_AVAILABLE_SUFFIX || suffix == ACCUMULATED_TOKENS_SUFFIX)
        }
        None => false,
    }
}
