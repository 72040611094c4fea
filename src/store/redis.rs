use super::{is_bucket_state_key, StoreConnection, StoreConnector};
use crate::error::{QuotaError, QuotaResult};
use crate::token_bucket::{BucketKeys, TakeArgs};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use std::sync::Arc;

const SCAN_BATCH: usize = 500;

pub struct RedisConnector {
    client: Client,
    redis_url: String,
}

impl RedisConnector {
    pub fn new(redis_url: &str) -> Result<Self, QuotaError> {
        let client = Client::open(redis_url)
            .map_err(|e| QuotaError::Connection(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            redis_url: redis_url.to_string(),
        })
    }
}

#[async_trait]
impl StoreConnector for RedisConnector {
    async fn connect(&self) -> QuotaResult<Arc<dyn StoreConnection>> {
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| QuotaError::Connection(format!("Failed to connect to Redis: {}", e)))?;

        Ok(Arc::new(RedisConnection { conn }))
    }

    fn describe(&self) -> String {
        self.redis_url.clone()
    }
}

/// Multiplexed connection; cloning it is cheap and shares the socket.
pub struct RedisConnection {
    conn: MultiplexedConnection,
}

#[async_trait]
impl StoreConnection for RedisConnection {
    async fn ping(&self) -> QuotaResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| QuotaError::Connection(format!("Ping failed: {}", e)))?;
        Ok(())
    }

    async fn server_time(&self) -> QuotaResult<u64> {
        let mut conn = self.conn.clone();
        let (seconds, _micros): (u64, u64) = redis::cmd("TIME")
            .query_async(&mut conn)
            .await
            .map_err(|e| QuotaError::Connection(format!("TIME failed: {}", e)))?;
        Ok(seconds)
    }

    async fn load_script(&self, script: &str) -> QuotaResult<String> {
        let mut conn = self.conn.clone();
        redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(script)
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| QuotaError::Connection(format!("SCRIPT LOAD failed: {}", e)))
    }

    async fn eval_take(&self, script_sha: &str, keys: &BucketKeys, args: &TakeArgs) -> QuotaResult<i64> {
        let mut conn = self.conn.clone();
        let argv = args.to_argv();

        redis::cmd("EVALSHA")
            .arg(script_sha)
            .arg(2)
            .arg(&keys.tokens_next_available)
            .arg(&keys.accumulated_tokens)
            .arg(argv.as_slice())
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| QuotaError::Connection(format!("Script execution failed: {}", e)))
    }

    async fn scan_bucket_keys(&self) -> QuotaResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("*:*:*")
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| QuotaError::Connection(format!("SCAN failed: {}", e)))?;

            found.extend(batch.into_iter().filter(|k| is_bucket_state_key(k)));

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(found)
    }

    async fn delete_keys(&self, keys: &[String]) -> QuotaResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<_, usize>(&mut conn)
            .await
            .map_err(|e| QuotaError::Connection(format!("DEL failed: {}", e)))
    }
}
