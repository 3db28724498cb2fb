//! Node Assembly
//!
//! Builds every collaborator named by the [`Settings`] once, registers the
//! task bodies, seals the registry and binds the selected executor backend.
//! Request-side code and the worker loop share the resulting [`AppContext`].

use crate::allocation::{IdentifierAllocator, SingleFlightLock};
use crate::config::{BackendKind, DatabaseKind, Settings, StoreKind};
use crate::executor::distributed::QueueTaskService;
use crate::executor::queue::{Broker, MemoryBroker, ResultBackend};
use crate::executor::thread::ThreadTaskService;
use crate::executor::worker::WorkerPool;
use crate::executor::{TaskBackend, TaskRegistry};
use crate::storage::{CacheService, Database, MemoryCache, MemoryDatabase};
use crate::tasks::{self, TaskCatalog, TaskDeps};
#[cfg(feature = "redis")]
use crate::{executor::redis::RedisBroker, storage::redis::RedisCache};
#[cfg(feature = "sqlite")]
use crate::storage::sqlite::SqliteDatabase;

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct AppContext {
    pub settings: Settings,
    pub cache: Arc<dyn CacheService>,
    pub database: Arc<dyn Database>,
    pub registry: Arc<TaskRegistry>,
    pub catalog: TaskCatalog,
    pub service: TaskBackend,
    pub lock: SingleFlightLock,
    pub identifiers: IdentifierAllocator,
    broker: Option<(Arc<dyn Broker>, Arc<dyn ResultBackend>)>,
    workers: Mutex<Option<Arc<WorkerPool>>>,
}

impl AppContext {
    pub async fn build(settings: Settings) -> Result<Self> {
        settings.validate()?;

        let cache = connect_cache(&settings).await?;
        let database = open_database(&settings).await?;

        let app_name = settings.app.name.as_str();
        let registry = TaskRegistry::new();
        let deps = Arc::new(TaskDeps::new(cache.clone(), database.clone()));
        let catalog = tasks::register_all(&registry, app_name, deps)?;
        registry.seal();

        let (service, broker) = match settings.executor.backend {
            BackendKind::Queue => {
                let (broker, backend) = connect_broker(&settings).await?;
                let service = QueueTaskService::new(
                    app_name,
                    registry.clone(),
                    broker.clone(),
                    backend.clone(),
                    settings.executor.queue_options(),
                );
                (TaskBackend::Queue(service), Some((broker, backend)))
            }
            BackendKind::Thread => (
                TaskBackend::Thread(ThreadTaskService::new(app_name, registry.clone())),
                None,
            ),
        };

        let lock = SingleFlightLock::new(cache.clone(), settings.lock.mode, settings.lock.ttl());
        let identifiers = IdentifierAllocator::new(database.clone());

        tracing::info!(
            "App '{}' ready: {} backend, cache {}, database {}, lock {}",
            app_name,
            service.kind(),
            cache.connection_repr(),
            database.describe(),
            lock.mode()
        );

        Ok(Self {
            settings,
            cache,
            database,
            registry,
            catalog,
            service,
            lock,
            identifiers,
            broker,
            workers: Mutex::new(None),
        })
    }

    /// An in-memory broker is only reachable from this process, so someone
    /// here has to consume it.
    pub fn needs_local_workers(&self) -> bool {
        self.broker.is_some() && self.settings.broker.kind == StoreKind::Memory
    }

    /// Starts the worker pool once. Returns `None` for the thread backend.
    pub fn start_workers(&self) -> Option<Arc<WorkerPool>> {
        let (broker, backend) = self.broker.as_ref()?;

        let mut workers = self.workers.lock();
        if let Some(pool) = workers.as_ref() {
            return Some(pool.clone());
        }

        let pool = WorkerPool::new(
            &self.settings.app.name,
            self.registry.clone(),
            broker.clone(),
            backend.clone(),
            self.settings.worker.worker_options(),
        );
        pool.start();
        *workers = Some(pool.clone());
        Some(pool)
    }

    pub async fn shutdown(&self) {
        let pool = self.workers.lock().take();
        if let Some(pool) = pool {
            pool.shutdown().await;
        }
    }
}

async fn connect_cache(settings: &Settings) -> Result<Arc<dyn CacheService>> {
    match settings.cache.kind {
        StoreKind::Memory => Ok(Arc::new(MemoryCache::new())),
        #[cfg(feature = "redis")]
        StoreKind::Redis => {
            let cache = RedisCache::connect(&settings.cache.url)
                .await
                .context("cache unavailable")?;
            Ok(Arc::new(cache))
        }
        #[cfg(not(feature = "redis"))]
        StoreKind::Redis => bail!("redis cache requested but the `redis` feature is off"),
    }
}

async fn connect_broker(
    settings: &Settings,
) -> Result<(Arc<dyn Broker>, Arc<dyn ResultBackend>)> {
    let result_expires = settings.executor.result_expires();
    match settings.broker.kind {
        StoreKind::Memory => {
            let broker = Arc::new(MemoryBroker::new(result_expires));
            Ok(split(broker))
        }
        #[cfg(feature = "redis")]
        StoreKind::Redis => {
            let broker = RedisBroker::connect(
                &settings.broker.url,
                &settings.broker.namespace,
                result_expires,
            )
            .await
            .context("broker unavailable")?;
            Ok(split(Arc::new(broker)))
        }
        #[cfg(not(feature = "redis"))]
        StoreKind::Redis => bail!("redis broker requested but the `redis` feature is off"),
    }
}

/// The same store serves as broker and result backend.
fn split<B>(broker: Arc<B>) -> (Arc<dyn Broker>, Arc<dyn ResultBackend>)
where
    B: Broker + ResultBackend + 'static,
{
    let backend: Arc<dyn ResultBackend> = broker.clone();
    let broker: Arc<dyn Broker> = broker;
    (broker, backend)
}

async fn open_database(settings: &Settings) -> Result<Arc<dyn Database>> {
    let config = &settings.database;
    let database: Arc<dyn Database> = match config.kind {
        DatabaseKind::Memory => Arc::new(MemoryDatabase::seeded(config.lock_timeout())),
        #[cfg(feature = "sqlite")]
        DatabaseKind::Sqlite => {
            let Some(path) = &config.path else {
                bail!("database.path is required for sqlite");
            };
            let database = SqliteDatabase::open(path, config.lock_timeout())
                .with_context(|| format!("failed to open {}", path.display()))?;
            Arc::new(database)
        }
        #[cfg(not(feature = "sqlite"))]
        DatabaseKind::Sqlite => bail!("sqlite requested but the `sqlite` feature is off"),
    };

    for prefix in &config.identifier_prefixes {
        database.ensure_identifier(prefix, 0).await?;
    }
    Ok(database)
}

#[cfg(test)]
mod tests;
