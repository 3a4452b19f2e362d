use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

mod config;
mod db;
mod generation;
mod llm;
mod util;
mod web;

use crate::config::{AppConfig, CliArgs};
use crate::db::schema_store::FileSchemaStore;
use crate::llm::LlmManager;
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration before logging so the configured level applies
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    init_tracing(&config.logging);

    if config.connections.is_empty() {
        warn!("No [[connections]] configured; every query will return 404");
    }

    info!("Initializing LLM manager with backend: {}", config.llm.backend);
    let llm_manager = LlmManager::new(&config.llm)?;
    let backend = llm_manager.backend().to_string();

    let schema_store = FileSchemaStore::new(PathBuf::from(&config.schema_dir))?;

    let app_state = Arc::new(AppState::new(
        config.clone(),
        Arc::new(llm_manager),
        backend,
        Arc::new(schema_store),
    ));
    info!(
        "Loaded {} connections, engine TTL {}s",
        app_state.registry.len(),
        config.pool.ttl_secs
    );

    // Start the web server
    info!("Starting sqlpilot server on {}:{}", config.web.host, config.web.port);
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
