use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::db::connection::{ConnectionDescriptor, ConnectionRegistry};
use crate::db::engine_pool::{EnginePool, SqlxEngineFactory};
use crate::db::executor::QueryExecutor;
use crate::db::schema_store::SchemaStore;
use crate::generation::pipeline::QueryPipeline;
use crate::llm::LanguageModel;
use crate::web::error::ApiError;

/// Shared application state for the web server
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub engines: Arc<EnginePool<SqlxEngineFactory>>,
    pub executor: Arc<QueryExecutor>,
    pub pipeline: QueryPipeline,
    pub llm_backend: String,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        model: Arc<dyn LanguageModel>,
        llm_backend: String,
        schemas: Arc<dyn SchemaStore>,
    ) -> Self {
        let engines = Arc::new(EnginePool::new(
            SqlxEngineFactory::new(&config.pool),
            Duration::from_secs(config.pool.ttl_secs),
        ));
        let executor = Arc::new(QueryExecutor::new(
            Arc::clone(&engines),
            config.generation.numeric_mode,
        ));
        let pipeline = QueryPipeline::new(
            model,
            executor.clone(),
            schemas,
            config.generation.max_attempts,
        );

        Self {
            registry: ConnectionRegistry::new(config.connections),
            engines,
            executor,
            pipeline,
            llm_backend,
            startup_time: chrono::Utc::now(),
        }
    }

    /// Looks up a configured connection, optionally pointed at another database.
    pub fn resolve(&self, name: &str, database: Option<&str>) -> Result<ConnectionDescriptor, ApiError> {
        self.registry
            .resolve(name, database)
            .ok_or_else(|| ApiError::not_found(format!("Connection '{}' not found", name)))
    }
}
