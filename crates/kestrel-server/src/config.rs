//! Server configuration with layered sources.

use crate::error::{ServerError, ServerResult};
use config::{Config, Environment, File};
use kestrel_jobs::JobsConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application name and metadata.
    #[serde(default)]
    pub app: AppMetadata,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Job engine configuration.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Demo job seeding.
    #[serde(default)]
    pub demo: DemoConfig,
}

/// Application metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Application name.
    pub name: String,
    /// Application version.
    pub version: String,
    /// Environment (development, staging, production).
    pub environment: String,
}

impl Default for AppMetadata {
    fn default() -> Self {
        Self {
            name: "kestrel".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment: "development".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives, used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info,kestrel=debug".to_string()
}

/// Demo job seeding, for trying the server without a producer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Number of `process_job` jobs submitted at startup.
    #[serde(default)]
    pub seed_jobs: u32,

    /// Attempts each `process_job` job fails before succeeding.
    #[serde(default)]
    pub simulated_failures: u32,
}

/// Loads [`AppConfig`] from files and the environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a loader reading from `config_dir`.
    ///
    /// Configuration is loaded from multiple sources in order:
    /// 1. `config/default.toml` - Default values
    /// 2. `config/{environment}.toml` - Environment-specific overrides
    /// 3. `config/local.toml` - Local overrides
    /// 4. Environment variables with `KESTREL__` prefix
    pub fn new(config_dir: impl Into<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Creates a loader for the default location (`./config`).
    pub fn from_default_location() -> Self {
        Self::new("./config")
    }

    /// Loads and validates the configuration.
    pub fn load(&self) -> ServerResult<AppConfig> {
        // Load .env file if present
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file found or error loading it: {}", e);
        }

        let environment =
            std::env::var("KESTREL_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        info!("Loading configuration for environment: {}", environment);

        let mut builder = Config::builder();

        for name in ["default", environment.as_str(), "local"] {
            let path = format!("{}/{}.toml", self.config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("KESTREL")
                .separator("__")
                .try_parsing(true),
        );

        let mut app_config: AppConfig = builder.build()?.try_deserialize()?;
        app_config.app.environment = environment;

        Self::validate(&app_config)?;
        Ok(app_config)
    }

    fn validate(config: &AppConfig) -> ServerResult<()> {
        config
            .jobs
            .validate()
            .map_err(|e| ServerError::Configuration(e.to_string()))?;

        if config.app.environment == "production" && config.demo.seed_jobs > 0 {
            warn!("Demo job seeding is enabled in production");
        }

        Ok(())
    }
}
