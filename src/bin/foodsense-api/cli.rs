//! Command-line interface definition.

use clap::{Parser, ValueEnum};
use foodsense::ServiceConfig;
use std::net::IpAddr;
use std::path::PathBuf;

/// Quota-metered image analysis API.
#[derive(Parser, Debug)]
#[command(name = "foodsense-api")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address to listen on.
    #[arg(long, env = "FOODSENSE_LISTEN_ADDR")]
    pub listen_addr: Option<IpAddr>,

    /// Listening port (0 for auto-select).
    #[arg(long, short, env = "FOODSENSE_PORT")]
    pub port: Option<u16>,

    /// Identity provider project id (token audience).
    #[arg(long, env = "FOODSENSE_PROJECT_ID")]
    pub project_id: Option<String>,

    /// Redis URL for quota and scan records.
    #[arg(long, env = "FOODSENSE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Directory for stored uploads.
    #[arg(long, env = "FOODSENSE_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Inference models, in fallback order (comma separated).
    #[arg(long, env = "FOODSENSE_MODELS", value_delimiter = ',')]
    pub models: Vec<String>,

    /// Include per-backend messages in inference failure responses.
    #[arg(long, env = "FOODSENSE_EXPOSE_DIAGNOSTICS")]
    pub expose_diagnostics: bool,

    /// Log level.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "pretty", env = "FOODSENSE_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Path to configuration file.
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

/// Log format CLI enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Pretty,
    /// One JSON object per line.
    Json,
}

impl Cli {
    /// Convert CLI arguments into a `ServiceConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is specified but cannot be loaded.
    pub fn into_config(self) -> color_eyre::Result<ServiceConfig> {
        // Start with default config or load from file
        let mut config = if let Some(ref path) = self.config {
            ServiceConfig::from_file(path)?
        } else {
            ServiceConfig::default()
        };

        // Override with CLI arguments
        if let Some(listen_addr) = self.listen_addr {
            config.listen_addr = listen_addr;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(project_id) = self.project_id {
            config.auth.project_id = project_id;
        }
        if let Some(redis_url) = self.redis_url {
            config.quota.redis_url = redis_url;
        }
        if let Some(storage_dir) = self.storage_dir {
            config.storage.root_dir = storage_dir;
        }
        if !self.models.is_empty() {
            config.inference.models = self.models;
        }
        config.inference.expose_diagnostics |= self.expose_diagnostics;
        config.log_level = self.log_level;

        if config.auth.project_id.is_empty() {
            color_eyre::eyre::bail!("a project id is required (--project-id or config file)");
        }

        Ok(config)
    }
}
