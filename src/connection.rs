//! Ownership of the single live backing-store connection.
//!
//! Readers load the current handle without locking. Creating or replacing
//! the handle is serialized, and [`ConnectionManager::reconnect`] only
//! replaces the handle the caller actually saw fail, so a burst of failing
//! callers produces one reconnect rather than one each.

use crate::error::{QuotaError, QuotaResult};
use crate::store::{StoreConnection, StoreConnector};
use crate::token_bucket::{BucketKeys, TakeArgs, TAKE_SCRIPT};
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A connection together with the handle of the script loaded on it.
pub struct ConnectionHandle {
    conn: Arc<dyn StoreConnection>,
    script_sha: String,
}

impl ConnectionHandle {
    pub fn connection(&self) -> &Arc<dyn StoreConnection> {
        &self.conn
    }

    pub fn script_sha(&self) -> &str {
        &self.script_sha
    }

    pub async fn eval_take(&self, keys: &BucketKeys, args: &TakeArgs) -> QuotaResult<i64> {
        self.conn.eval_take(&self.script_sha, keys, args).await
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn StoreConnector>,
    current: ArcSwapOption<ConnectionHandle>,
    replace_lock: Mutex<()>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn StoreConnector>) -> Self {
        Self {
            connector,
            current: ArcSwapOption::empty(),
            replace_lock: Mutex::new(()),
        }
    }

    /// The live handle, if one exists.
    pub fn current(&self) -> Option<Arc<ConnectionHandle>> {
        self.current.load_full()
    }

    /// The live handle, connecting first if there is none.
    pub async fn get_or_connect(&self) -> QuotaResult<Arc<ConnectionHandle>> {
        if let Some(handle) = self.current.load_full() {
            return Ok(handle);
        }

        let _guard = self.replace_lock.lock().await;
        if let Some(handle) = self.current.load_full() {
            return Ok(handle);
        }

        let handle = self.open().await?;
        self.current.store(Some(Arc::clone(&handle)));
        Ok(handle)
    }

    /// Replaces `observed` with a fresh connection, unless another caller already did.
    pub async fn reconnect(&self, observed: &Arc<ConnectionHandle>) -> QuotaResult<Arc<ConnectionHandle>> {
        let _guard = self.replace_lock.lock().await;

        if let Some(current) = self.current.load_full() {
            if !Arc::ptr_eq(&current, observed) {
                debug!("Connection already replaced by a concurrent caller");
                return Ok(current);
            }
        }

        // Drop the faulty handle first so nobody picks it up while we reconnect.
        self.current.store(None);
        warn!(store = %self.connector.describe(), "Reconnecting to backing store");

        let handle = self.open().await?;
        self.current.store(Some(Arc::clone(&handle)));
        Ok(handle)
    }

    /// Makes sure a connection exists and the take script is loaded on it.
    pub async fn ensure_script(&self) -> QuotaResult<Arc<ConnectionHandle>> {
        let handle = self.get_or_connect().await?;

        match handle.conn.load_script(TAKE_SCRIPT).await {
            Ok(sha) if sha == handle.script_sha => Ok(handle),
            Ok(sha) => Ok(self.replace_script(&handle, sha).await),
            Err(e) => {
                warn!(error = %e, "Script load failed on live connection");
                self.reconnect(&handle).await
            }
        }
    }

    /// Publishes `observed` with a new script handle, unless it was replaced
    /// or closed in the meantime.
    async fn replace_script(&self, observed: &Arc<ConnectionHandle>, sha: String) -> Arc<ConnectionHandle> {
        let _guard = self.replace_lock.lock().await;
        let refreshed = Arc::new(ConnectionHandle {
            conn: Arc::clone(&observed.conn),
            script_sha: sha,
        });

        match self.current.load_full() {
            Some(current) if Arc::ptr_eq(&current, observed) => {
                debug!(script_sha = %refreshed.script_sha, "Script handle changed");
                self.current.store(Some(Arc::clone(&refreshed)));
                refreshed
            }
            Some(current) => {
                debug!("Connection already replaced by a concurrent caller");
                current
            }
            None => refreshed,
        }
    }

    /// Releases the connection; the next caller reconnects.
    pub async fn close(&self) {
        let _guard = self.replace_lock.lock().await;
        if self.current.swap(None).is_some() {
            info!(store = %self.connector.describe(), "Closed backing store connection");
        }
    }

    async fn open(&self) -> QuotaResult<Arc<ConnectionHandle>> {
        let conn = self.connector.connect().await?;

        match conn.server_time().await {
            Ok(seconds) => info!(
                store = %self.connector.describe(),
                server_time = seconds,
                "Connection established"
            ),
            Err(e) => {
                return Err(QuotaError::Connection(format!(
                    "Cannot talk to {}: {}",
                    self.connector.describe(),
                    e
                )))
            }
        }

        let script_sha = conn.load_script(TAKE_SCRIPT).await?;
        info!(script_sha = %script_sha, "Loaded token bucket script");

        Ok(Arc::new(ConnectionHandle { conn, script_sha }))
    }
}
