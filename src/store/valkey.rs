//! Redis / Valkey backed counter store.
//!
//! This is what makes quotas cluster-wide: every process talks to the same
//! keys, and the server provides the per-key atomic increment.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::{AsyncCommands, Client, RedisResult};
use tokio::time::timeout;
use tracing::{debug, info};

use super::CounterStore;
use crate::error::{Result, TollgateError};

/// Counter store backed by a Redis-compatible server.
///
/// Production stores use `ConnectionManager`, which reconnects automatically
/// and multiplexes commands over one connection, so the store is cheap to
/// clone. Any async connection can be supplied with
/// [`with_connection`](Self::with_connection).
#[derive(Clone)]
pub struct RedisCounterStore<C = ConnectionManager> {
    connection: C,
    key_prefix: String,
    command_timeout: Duration,
}

impl<C> std::fmt::Debug for RedisCounterStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("key_prefix", &self.key_prefix)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisCounterStore {
    /// Connect to the server at `url`.
    pub async fn connect(url: &str, key_prefix: &str, command_timeout: Duration) -> Result<Self> {
        let client = Client::open(url).map_err(|e| {
            TollgateError::Infrastructure(format!("Failed to create redis client: {e}"))
        })?;

        let connection = timeout(command_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                TollgateError::Infrastructure(format!(
                    "Timed out connecting to redis after {command_timeout:?}"
                ))
            })?
            .map_err(|e| {
                TollgateError::Infrastructure(format!("Failed to connect to redis: {e}"))
            })?;

        info!(key_prefix = %key_prefix, "Connected to redis counter store");

        Ok(Self::with_connection(connection, key_prefix, command_timeout))
    }
}

impl<C> RedisCounterStore<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    /// Wrap an established connection.
    pub fn with_connection(connection: C, key_prefix: &str, command_timeout: Duration) -> Self {
        Self {
            connection,
            key_prefix: key_prefix.to_string(),
            command_timeout,
        }
    }

    /// Check that the server answers.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: String = self
            .run("PING", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    fn key(&self, key: &str) -> String {
        prefixed_key(&self.key_prefix, key)
    }

    /// Await a single command, bounded by the command timeout.
    async fn run<T, F>(&self, command: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>> + Send,
    {
        match timeout(self.command_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                debug!(command = command, error = %e, "Redis command failed");
                Err(e.into())
            }
            Err(_) => Err(TollgateError::Infrastructure(format!(
                "{command} timed out after {:?}",
                self.command_timeout
            ))),
        }
    }
}

fn prefixed_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}:{key}")
    }
}

#[async_trait]
impl<C> CounterStore for RedisCounterStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn incr(&self, key: &str) -> Result<i64> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        self.run("INCR", conn.incr(&key, 1i64)).await
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        self.run("TTL", conn.ttl(&key)).await
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let key = self.key(key);
        let seconds = i64::try_from(seconds)
            .map_err(|_| TollgateError::Config(format!("expiry of {seconds}s is out of range")))?;
        let mut conn = self.connection.clone();
        self.run("EXPIRE", conn.expire(&key, seconds)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        self.run("GET", conn.get(&key)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = self.key(key);
        let mut conn = self.connection.clone();
        self.run("SET", conn.set(&key, value)).await
    }
}
