use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::db::connection::ConnectionDescriptor;
use crate::db::engine_pool::DEFAULT_TTL;
use crate::db::normalize::NumericMode;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub backend: String, // "remote", "ollama" or "anthropic"
    pub model: String,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub temperature: f32,
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    /// Connections per engine. Values above 5 are clamped.
    pub max_connections: u32,
    /// Age after which a pooled engine is disposed and rebuilt.
    pub ttl_secs: u64,
    /// Maximum lifetime of a single connection inside an engine.
    pub recycle_secs: u64,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Total language-model generation calls allowed per request.
    pub max_attempts: u32,
    pub numeric_mode: NumericMode,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub web: WebConfig,
    pub llm: LlmConfig,
    pub pool: PoolConfig,
    pub generation: GenerationConfig,
    pub logging: LoggingConfig,
    pub schema_dir: String,
    #[serde(default)]
    pub connections: Vec<ConnectionDescriptor>,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory for cached schema documents
    #[arg(long)]
    pub schema_dir: Option<String>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        // Defaults first so a partial file is enough
        let mut config_builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            let default_locations = vec![
                "config.toml",
                "config/config.toml",
                "/etc/sqlpilot/config.toml",
            ];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        config_builder = config_builder.add_source(
            Environment::with_prefix("SQLPILOT")
                .prefix_separator("__")
                .separator("__"),
        );

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(host) = &args.host {
            config.web.host = host.clone();
        }
        if let Some(port) = args.port {
            config.web.port = port;
        }
        if let Some(schema_dir) = &args.schema_dir {
            config.schema_dir = schema_dir.clone();
        }
        if let Some(level) = &args.log_level {
            config.logging.level = level.clone();
        }

        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            web: WebConfig {
                host: "127.0.0.1".to_string(),
                port: 9877,
            },
            llm: LlmConfig {
                backend: "anthropic".to_string(),
                model: "claude-3-5-sonnet-20241022".to_string(),
                api_key: None,
                api_url: None,
                temperature: 0.2,
                timeout_secs: 120,
            },
            pool: PoolConfig {
                max_connections: 5,
                ttl_secs: DEFAULT_TTL.as_secs(),
                recycle_secs: 1800,
                acquire_timeout_secs: 30,
            },
            generation: GenerationConfig {
                max_attempts: 3,
                numeric_mode: NumericMode::Float,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
            schema_dir: "schemas".to_string(),
            connections: Vec::new(),
        }
    }
}
