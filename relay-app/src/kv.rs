//! Key-value store client.
//!
//! Production runs against Redis through a shared connection manager whose
//! concurrent use is bounded by a semaphore; a permit is held for exactly one
//! command. [`MemoryStore`] has the same TTL semantics and backs tests and the
//! development fallback.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;

pub type KvResult<T> = std::result::Result<T, KvError>;

#[derive(Debug, Error)]
pub enum KvError {
    /// The store could not be reached or the command timed out. Worth retrying.
    #[error("kv connection error: {0}")]
    Connection(String),

    #[error("kv command error: {0}")]
    Command(String),
}

impl KvError {
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

impl From<redis::RedisError> for KvError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
        {
            Self::Connection(e.to_string())
        } else {
            Self::Command(e.to_string())
        }
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomic set-if-absent with expiry. `true` when this call stored the value.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool>;

    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()>;

    /// Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> KvResult<()>;

    async fn ping(&self) -> KvResult<()>;

    /// Short backend label for health output.
    fn backend(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

pub struct RedisStore {
    manager: ConnectionManager,
    permits: Semaphore,
    command_timeout: Duration,
}

impl RedisStore {
    #[tracing::instrument(level = "info", skip_all, fields(host = %settings.host, port = settings.port, db = settings.db))]
    pub async fn connect(settings: &RedisSettings) -> KvResult<Self> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(settings.host.clone(), settings.port),
            redis: redis::RedisConnectionInfo {
                db: settings.db,
                password: settings.password.clone(),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)?;
        let manager = tokio::time::timeout(settings.connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| KvError::Connection("connect timed out".to_string()))??;
        Ok(Self {
            manager,
            permits: Semaphore::new(settings.max_connections.max(1)),
            command_timeout: settings.command_timeout,
        })
    }

    async fn run<T, F, Fut>(&self, op: &'static str, f: F) -> KvResult<T>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| KvError::Connection(format!("pool closed: {e}")))?;
        match tokio::time::timeout(self.command_timeout, f(self.manager.clone())).await {
            Ok(result) => result.map_err(KvError::from),
            Err(_) => Err(KvError::Connection(format!("{op} timed out"))),
        }
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("EX").arg(ttl.as_secs());
        self.run("SET NX", |mut conn| async move {
            let reply: Option<String> = cmd.query_async(&mut conn).await?;
            Ok(reply.is_some())
        })
        .await
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run("GET", |mut conn| async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("EX").arg(ttl.as_secs());
        self.run("SET EX", |mut conn| async move { cmd.query_async(&mut conn).await })
            .await
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        self.run("DEL", |mut conn| async move {
            let _removed: i64 = cmd.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> KvResult<()> {
        let cmd = redis::cmd("PING");
        self.run("PING", |mut conn| async move {
            let _pong: String = cmd.query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn new(value: &str, ttl: Duration) -> Self {
        Self {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Writes between full sweeps of expired entries.
const SWEEP_EVERY: usize = 256;

/// Process-local store. Expired entries are dropped on access and by a
/// sweep every [`SWEEP_EVERY`] writes, so write-once keys do not pile up.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must not be called while holding a guard into `entries`.
    fn record_write(&self, now: Instant) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY == 0 {
            let before = self.entries.len();
            self.entries.retain(|_, entry| entry.is_live(now));
            tracing::debug!(before, after = self.entries.len(), "swept expired kv entries");
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool> {
        let now = Instant::now();
        let claimed = match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_live(now) => false,
            Entry::Occupied(mut occupied) => {
                occupied.insert(MemoryEntry::new(value, ttl));
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new(value, ttl));
                true
            }
        };
        if claimed {
            self.record_write(now);
        }
        Ok(claimed)
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let now = Instant::now();
        let live = self
            .entries
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
        match live {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                self.entries.remove_if(key, |_, entry| !entry.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        self.entries
            .insert(key.to_string(), MemoryEntry::new(value, ttl));
        self.record_write(Instant::now());
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn ping(&self) -> KvResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
