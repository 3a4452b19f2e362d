//! One live database engine per `(connection, database)` pair.
//!
//! Engines are created lazily on first use, shared by every request that targets the same key and
//! rebuilt once they outlive the configured TTL. Creation for a key is serialized by a per-key async
//! mutex with a second lookup under the lock, so concurrent first requests build exactly one engine.
//! Every build gets a generation number so a failure seen on an old engine never evicts its
//! replacement.

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::db::connection::{ConnectionDescriptor, DatabaseKind};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const MAX_POOL_CONNECTIONS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Failed to connect to '{key}': {message}")]
    Connect { key: String, message: String },
}

/// Builds and tears down engines. Split out so the pool logic can run without a database.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    type Handle: Clone + Send + Sync + 'static;

    async fn create(&self, descriptor: &ConnectionDescriptor) -> Result<Self::Handle, PoolError>;

    async fn dispose(&self, handle: Self::Handle);
}

/// An engine handed out by the pool, tagged with the build it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct PooledEngine<H> {
    pub handle: H,
    pub generation: u64,
}

struct PoolEntry<H> {
    handle: H,
    generation: u64,
    created_at: Instant,
}

impl<H: Clone> PoolEntry<H> {
    fn lease(&self) -> PooledEngine<H> {
        PooledEngine {
            handle: self.handle.clone(),
            generation: self.generation,
        }
    }
}

pub struct EnginePool<F: EngineFactory> {
    factory: F,
    ttl: Duration,
    entries: RwLock<HashMap<String, PoolEntry<F::Handle>>>,
    creation_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    next_generation: AtomicU64,
}

impl<F: EngineFactory> EnginePool<F> {
    pub fn new(factory: F, ttl: Duration) -> Self {
        Self {
            factory,
            ttl,
            entries: RwLock::new(HashMap::new()),
            creation_locks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Returns the engine for the descriptor's key, building it if absent or expired.
    pub async fn acquire(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<PooledEngine<F::Handle>, PoolError> {
        let key = descriptor.pool_key();

        if let Some(engine) = self.fresh_engine(&key).await {
            return Ok(engine);
        }

        let lock = self.creation_lock(&key);
        let _guard = lock.lock().await;

        // Another request may have built it while we waited
        let expired = {
            let mut entries = self.entries.write().await;
            let fresh = entries
                .get(&key)
                .map(|entry| entry.created_at.elapsed() <= self.ttl);
            match fresh {
                Some(true) => {
                    if let Some(entry) = entries.get(&key) {
                        return Ok(entry.lease());
                    }
                    None
                }
                Some(false) => entries.remove(&key),
                None => None,
            }
        };

        if let Some(entry) = expired {
            info!("Engine for {} exceeded TTL of {:?}, disposing", key, self.ttl);
            self.factory.dispose(entry.handle).await;
        }

        debug!("Creating engine for {}", key);
        let handle = self.factory.create(descriptor).await?;
        let entry = PoolEntry {
            handle,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            created_at: Instant::now(),
        };
        let engine = entry.lease();

        self.entries.write().await.insert(key.clone(), entry);
        info!("Engine created for {} (generation {})", key, engine.generation);

        Ok(engine)
    }

    /// Disposes the descriptor's engine if it is still the given generation. A newer engine
    /// under the same key is left alone.
    pub async fn evict(&self, descriptor: &ConnectionDescriptor, generation: u64) {
        let key = descriptor.pool_key();
        let lock = self.creation_lock(&key);
        let _guard = lock.lock().await;

        let removed = {
            let mut entries = self.entries.write().await;
            match entries.get(&key) {
                Some(entry) if entry.generation == generation => entries.remove(&key),
                _ => None,
            }
        };
        match removed {
            Some(entry) => {
                debug!("Evicting engine for {} (generation {})", key, generation);
                self.factory.dispose(entry.handle).await;
            }
            None => debug!("Engine generation {} for {} already replaced", generation, key),
        }
    }

    /// Disposes every engine. Used on shutdown.
    pub async fn dispose_all(&self) {
        let drained: Vec<(String, PoolEntry<F::Handle>)> =
            self.entries.write().await.drain().collect();

        for (key, entry) in drained {
            debug!("Disposing engine for {}", key);
            self.factory.dispose(entry.handle).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn fresh_engine(&self, key: &str) -> Option<PooledEngine<F::Handle>> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.created_at.elapsed() <= self.ttl)
            .map(PoolEntry::lease)
    }

    fn creation_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.creation_locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(key.to_string()).or_default())
    }
}

/// A live sqlx pool for one of the supported engines.
#[derive(Clone, Debug)]
pub enum EngineHandle {
    Postgres(PgPool),
    MySql(MySqlPool),
}

impl EngineHandle {
    pub fn kind(&self) -> DatabaseKind {
        match self {
            EngineHandle::Postgres(_) => DatabaseKind::Postgresql,
            EngineHandle::MySql(_) => DatabaseKind::Mysql,
        }
    }

    /// True once the engine was disposed, e.g. retired by the TTL while a request held it.
    pub fn is_closed(&self) -> bool {
        match self {
            EngineHandle::Postgres(pool) => pool.is_closed(),
            EngineHandle::MySql(pool) => pool.is_closed(),
        }
    }

    async fn close(&self) {
        match self {
            EngineHandle::Postgres(pool) => pool.close().await,
            EngineHandle::MySql(pool) => pool.close().await,
        }
    }
}

/// Builds sqlx pools: small, no overflow, liveness-checked on checkout, recycled periodically.
pub struct SqlxEngineFactory {
    max_connections: u32,
    recycle: Duration,
    acquire_timeout: Duration,
}

impl SqlxEngineFactory {
    pub fn new(config: &PoolConfig) -> Self {
        let mut max_connections = config.max_connections.max(1);
        if max_connections > MAX_POOL_CONNECTIONS {
            warn!(
                "pool.max_connections={} exceeds {}, clamping",
                max_connections, MAX_POOL_CONNECTIONS
            );
            max_connections = MAX_POOL_CONNECTIONS;
        }

        Self {
            max_connections,
            recycle: Duration::from_secs(config.recycle_secs),
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
        }
    }
}

#[async_trait]
impl EngineFactory for SqlxEngineFactory {
    type Handle = EngineHandle;

    async fn create(&self, descriptor: &ConnectionDescriptor) -> Result<EngineHandle, PoolError> {
        let url = descriptor.connection_url();
        let connect_error = |e: sqlx::Error| PoolError::Connect {
            key: descriptor.pool_key(),
            message: e.to_string(),
        };

        // Reads rely on READ COMMITTED, which MySQL does not default to
        let handle = match descriptor.kind {
            DatabaseKind::Postgresql => {
                let pool = PgPoolOptions::new()
                    .max_connections(self.max_connections)
                    .test_before_acquire(true)
                    .max_lifetime(self.recycle)
                    .acquire_timeout(self.acquire_timeout)
                    .after_connect(|conn, _meta| {
                        Box::pin(async move {
                            conn.execute(
                                "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL READ COMMITTED",
                            )
                            .await?;
                            Ok(())
                        })
                    })
                    .connect(&url)
                    .await
                    .map_err(connect_error)?;
                EngineHandle::Postgres(pool)
            }
            DatabaseKind::Mysql => {
                let pool = MySqlPoolOptions::new()
                    .max_connections(self.max_connections)
                    .test_before_acquire(true)
                    .max_lifetime(self.recycle)
                    .acquire_timeout(self.acquire_timeout)
                    .after_connect(|conn, _meta| {
                        Box::pin(async move {
                            conn.execute("SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED")
                                .await?;
                            Ok(())
                        })
                    })
                    .connect(&url)
                    .await
                    .map_err(connect_error)?;
                EngineHandle::MySql(pool)
            }
        };

        Ok(handle)
    }

    async fn dispose(&self, handle: EngineHandle) {
        handle.close().await;
    }
}
