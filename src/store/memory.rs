//! In-process store that runs the token bucket procedure under a mutex.
//!
//! All connections opened through one [`MemoryConnector`] share a single
//! [`MemoryStore`], the way every client of one Redis sees the same keyspace.
//! Failure injection hooks let tests exercise reconnect handling.

use super::{is_bucket_state_key, StoreConnection, StoreConnector};
use crate::clock::Clock;
use crate::error::{QuotaError, QuotaResult};
use crate::persister::content_hash;
use crate::token_bucket::{evaluate, BucketKeys, Decision, TakeArgs};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const NANOS_PER_MILLI: i64 = 1_000_000;

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at_nanos: Option<i64>,
}

pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
    scripts: Mutex<HashSet<String>>,
    failing_evals: AtomicUsize,
    failing_connects: AtomicUsize,
    connects: AtomicUsize,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashSet::new()),
            failing_evals: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        }
    }

    fn entries(&self) -> QuotaResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| QuotaError::Internal("Failed to acquire store lock".into()))
    }

    fn live_value(&self, entries: &HashMap<String, Entry>, key: &str, now: i64) -> Option<i64> {
        entries
            .get(key)
            .filter(|e| e.expires_at_nanos.map_or(true, |at| at > now))
            .map(|e| e.value)
    }

    /// Current value of a key, ignoring expired entries.
    pub fn get(&self, key: &str) -> Option<i64> {
        let now = self.clock.now_nanos();
        self.entries().ok().and_then(|entries| self.live_value(&entries, key, now))
    }

    pub fn set(&self, key: &str, value: i64) {
        if let Ok(mut entries) = self.entries() {
            entries.insert(
                key.to_string(),
                Entry {
                    value,
                    expires_at_nanos: None,
                },
            );
        }
    }

    /// All live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now_nanos();
        let mut keys: Vec<String> = match self.entries() {
            Ok(entries) => entries
                .iter()
                .filter(|(_, e)| e.expires_at_nanos.map_or(true, |at| at > now))
                .map(|(k, _)| k.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        keys.sort();
        keys
    }

    /// Makes the next `n` script evaluations fail as if the connection broke.
    pub fn fail_next_evals(&self, n: usize) {
        self.failing_evals.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Number of successful connections opened so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Forgets loaded scripts, like a store restart.
    pub fn flush_scripts(&self) {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.clear();
        }
    }

    fn consume_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn connect(&self) -> QuotaResult<Arc<dyn StoreConnection>> {
        if MemoryStore::consume_failure(&self.store.failing_connects) {
            return Err(QuotaError::Connection("Connection refused".into()));
        }
        self.store.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            store: Arc::clone(&self.store),
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

pub struct MemoryConnection {
    store: Arc<MemoryStore>,
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    async fn ping(&self) -> QuotaResult<()> {
        Ok(())
    }

    async fn server_time(&self) -> QuotaResult<u64> {
        Ok((self.store.clock.now_nanos() / 1_000_000_000).max(0) as u64)
    }

    async fn load_script(&self, script: &str) -> QuotaResult<String> {
        let sha = content_hash(script.as_bytes());
        self.store
            .scripts
            .lock()
            .map_err(|_| QuotaError::Internal("Failed to acquire script lock".into()))?
            .insert(sha.clone());
        Ok(sha)
    }

    async fn eval_take(&self, script_sha: &str, keys: &BucketKeys, args: &TakeArgs) -> QuotaResult<i64> {
        if MemoryStore::consume_failure(&self.store.failing_evals) {
            return Err(QuotaError::Connection("Connection reset by peer".into()));
        }

        let loaded = self
            .store
            .scripts
            .lock()
            .map_err(|_| QuotaError::Internal("Failed to acquire script lock".into()))?
            .contains(script_sha);
        if !loaded {
            return Err(QuotaError::Connection("NOSCRIPT No matching script".into()));
        }

        let now = self.store.clock.now_nanos();
        let mut entries = self.store.entries()?;

        let tna = self.store.live_value(&entries, &keys.tokens_next_available, now);
        let accumulated = self.store.live_value(&entries, &keys.accumulated_tokens, now);
        let decision = evaluate(tna, accumulated, args);

        if let Decision::Admitted { state, .. } = decision {
            let expires_at_nanos = (args.max_idle_millis > 0)
                .then(|| now.saturating_add(args.max_idle_millis.saturating_mul(NANOS_PER_MILLI)));
            entries.insert(
                keys.tokens_next_available.clone(),
                Entry {
                    value: state.tokens_next_available_nanos,
                    expires_at_nanos,
                },
            );
            entries.insert(
                keys.accumulated_tokens.clone(),
                Entry {
                    value: state.accumulated_tokens,
                    expires_at_nanos,
                },
            );
        }

        Ok(decision.script_result())
    }

    async fn scan_bucket_keys(&self) -> QuotaResult<Vec<String>> {
        Ok(self
            .store
            .keys()
            .into_iter()
            .filter(|k| is_bucket_state_key(k))
            .collect())
    }

    async fn delete_keys(&self, keys: &[String]) -> QuotaResult<usize> {
        let mut entries = self.store.entries()?;
        Ok(keys.iter().filter(|k| entries.remove(k.as_str()).is_some()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::service_config::BucketConfig;
    use crate::token_bucket::{BucketParams, TAKE_SCRIPT};
    use std::time::Duration;

    fn setup() -> (Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(1_000_000_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        (clock, store)
    }

    #[tokio::test]
    async fn test_eval_requires_loaded_script() {
        let (clock, store) = setup();
        let conn = MemoryConnector::new(store).connect().await.unwrap();
        let params = BucketParams::from_config(&BucketConfig::new(1, 1));
        let keys = BucketKeys::new("ns", "b");
        let args = params.take_args(clock.now_nanos(), 1, Duration::ZERO);

        assert!(conn.eval_take("unknown", &keys, &args).await.is_err());

        let sha = conn.load_script(TAKE_SCRIPT).await.unwrap();
        assert_eq!(conn.eval_take(&sha, &keys, &args).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_state_expires_after_idle_time() {
        let (clock, store) = setup();
        let conn = MemoryConnector::new(store.clone()).connect().await.unwrap();
        let sha = conn.load_script(TAKE_SCRIPT).await.unwrap();
        let params = BucketParams::from_config(&BucketConfig {
            max_idle_millis: 100,
            ..BucketConfig::new(1, 1)
        });
        let keys = BucketKeys::new("ns", "b");

        let args = params.take_args(clock.now_nanos(), 1, Duration::ZERO);
        conn.eval_take(&sha, &keys, &args).await.unwrap();
        assert_eq!(store.get("ns:b:AT"), Some(0));

        clock.advance(Duration::from_millis(101));
        assert_eq!(store.get("ns:b:AT"), None);
        assert!(store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let (_, store) = setup();
        let connector = MemoryConnector::new(store.clone());

        store.fail_next_connects(1);
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(store.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_scan_and_delete() {
        let (_, store) = setup();
        store.set("ns:a:TNA", 1);
        store.set("ns:a:AT", 1);
        store.set("unrelated", 1);
        let conn = MemoryConnector::new(store.clone()).connect().await.unwrap();

        let mut keys = conn.scan_bucket_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["ns:a:AT".to_string(), "ns:a:TNA".to_string()]);

        assert_eq!(conn.delete_keys(&keys).await.unwrap(), 2);
        assert_eq!(store.keys(), vec!["unrelated".to_string()]);
    }
}
