use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub video: VideoConfig,
    #[serde(default)]
    pub engine: booking_core::Config,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VideoProviderKind {
    /// Remote meeting API over HTTP
    Http,
    /// Local links, no external calls (development)
    Loopback,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VideoConfig {
    pub provider: VideoProviderKind,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            // Start with default configuration
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8085)?
            .set_default("server.workers", 4)?
            .set_default("video.provider", "loopback")?
            .set_default("video.base_url", "http://localhost:8090")?
            .set_default("video.timeout_secs", 10)?;

        // Add environment-specific config file if it exists
        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder.add_source(
                File::with_name(&format!("config/{}", environment)).required(false),
            );
        }

        // Override with environment variables
        builder = builder.add_source(
            Environment::with_prefix("BOOKING_API")
                .separator("__")
                .try_parsing(true),
        );

        // Special handling for common env vars
        if let Ok(port) = env::var("BOOKING_API_PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        if let Ok(video_url) = env::var("VIDEO_PROVIDER_URL") {
            builder = builder
                .set_override("video.provider", "http")?
                .set_override("video.base_url", video_url)?;
        }

        if let Ok(api_key) = env::var("VIDEO_PROVIDER_API_KEY") {
            builder = builder.set_override("video.api_key", api_key)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.server.workers == 0 {
            return Err("At least one worker is required".to_string());
        }

        if self.video.provider == VideoProviderKind::Http && self.video.base_url.is_empty() {
            return Err("Video provider URL is required".to_string());
        }

        if self.video.timeout_secs == 0 {
            return Err("Video provider timeout cannot be 0".to_string());
        }

        self.engine.validate().map_err(|e| e.to_string())
    }
}
