use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the upload service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Upload envelope and staging configuration
    #[serde(default)]
    pub upload: UploadConfig,
    /// External media tool configuration
    #[serde(default)]
    pub tools: ToolsConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Database configuration
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Accepted upload envelope
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// The single accepted container MIME type
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Maximum accepted video size in bytes (1 GiB default)
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
    /// Directory for scratch files; system temp dir when unset
    pub staging_dir: Option<PathBuf>,
}

/// External media tools (ffprobe / ffmpeg)
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Upper bound on concurrently running external processes
    #[serde(default = "default_max_concurrent_processes")]
    pub max_concurrent_processes: usize,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket name for published videos
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "video-upload-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_content_type() -> String {
    "video/mp4".to_string()
}

fn default_max_upload_bytes() -> u64 {
    1 << 30 // 1 GiB
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_max_concurrent_processes() -> usize {
    4
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    15 * 60
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "video-upload-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/upload").required(false))
            .add_source(config::File::with_name("/etc/video-upload/upload").required(false))
            // UPLOAD__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("UPLOAD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }

    /// Directory used for scratch files
    pub fn staging_dir(&self) -> PathBuf {
        self.upload
            .staging_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            content_type: default_content_type(),
            max_upload_bytes: default_max_upload_bytes(),
            staging_dir: None,
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: default_ffprobe_path(),
            ffmpeg_path: default_ffmpeg_path(),
            max_concurrent_processes: default_max_concurrent_processes(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_upload_bytes(), 1_073_741_824);
        assert_eq!(default_presigned_url_expiry_secs(), 900);
        assert_eq!(default_content_type(), "video/mp4");
    }

    #[test]
    fn test_deserialize_minimal_config() {
        let config: Config = config::Config::builder()
            .set_override("s3.bucket", "videos")
            .unwrap()
            .set_override("database.url", "postgres://localhost/videos")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.s3.bucket, "videos");
        assert_eq!(config.upload.max_upload_bytes, 1 << 30);
        assert_eq!(config.tools.max_concurrent_processes, 4);
        assert_eq!(config.presigned_url_expiry(), Duration::from_secs(900));
        assert_eq!(config.staging_dir(), std::env::temp_dir());
    }
}
