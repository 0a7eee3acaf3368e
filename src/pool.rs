//! Reference-counted pool of expensive per-key connections.
//!
//! `acquire` creates the connection on first use and hands out shared
//! references afterwards; `release` tears it down when the last user is
//! gone. Setup and teardown are the expensive part, so the whole pool sits
//! behind one lock and a key is never connected twice concurrently.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Creates and tears down pooled connections.
#[async_trait]
pub trait Connector: Send + Sync {
    type Key: Clone + Eq + Hash + fmt::Display + Send + Sync;
    type Connection: Send + Sync;

    async fn connect(&self, key: &Self::Key) -> anyhow::Result<Self::Connection>;

    /// Called once, when the usage count of `key` drops to zero.
    async fn disconnect(&self, key: &Self::Key, connection: Arc<Self::Connection>);
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("cannot connect to {key}: {reason}")]
    Connect { key: String, reason: String },

    #[error("{0} was released more often than it was acquired")]
    NotAcquired(String),
}

struct PoolEntry<T> {
    connection: Arc<T>,
    usage: usize,
}

/// Connections by key, each with a usage count.
pub struct ConnectionPool<C: Connector> {
    connector: C,
    entries: Mutex<HashMap<C::Key, PoolEntry<C::Connection>>>,
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the connection for `key`, creating it if nobody holds it yet.
    pub async fn acquire(&self, key: &C::Key) -> Result<Arc<C::Connection>, PoolError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.usage += 1;
            debug!(key = %key, usage = entry.usage, "Reusing pooled connection");
            return Ok(Arc::clone(&entry.connection));
        }

        let connection = self
            .connector
            .connect(key)
            .await
            .map_err(|e| PoolError::Connect {
                key: key.to_string(),
                reason: format!("{e:#}"),
            })?;
        let connection = Arc::new(connection);
        entries.insert(
            key.clone(),
            PoolEntry {
                connection: Arc::clone(&connection),
                usage: 1,
            },
        );
        info!(key = %key, "Created pooled connection");
        Ok(connection)
    }

    /// Drop one use of `key`; the last release disconnects.
    pub async fn release(&self, key: &C::Key) -> Result<(), PoolError> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(key)
            .ok_or_else(|| PoolError::NotAcquired(key.to_string()))?;
        entry.usage -= 1;
        debug!(key = %key, usage = entry.usage, "Released pooled connection");

        if entry.usage == 0 {
            if let Some(entry) = entries.remove(key) {
                self.connector.disconnect(key, entry.connection).await;
                info!(key = %key, "Closed pooled connection");
            }
        }
        Ok(())
    }

    /// Current usage count of `key` (0 if not pooled).
    pub async fn usage(&self, key: &C::Key) -> usize {
        self.entries.lock().await.get(key).map_or(0, |e| e.usage)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
