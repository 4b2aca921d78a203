//! Configuration for the rating service
//!
//! CLI arguments with environment variable fallbacks using clap.

use std::time::Duration;

use clap::Parser;

use crate::manager::ManagerConfig;
use crate::model::ModelVersion;
use crate::rating::CalculatorConfig;

/// Incremental reputation aggregation over workspace change records
#[derive(Parser, Debug, Clone)]
#[command(name = "rating-service")]
#[command(about = "Per-workspace reputation aggregation driven by NATS JetStream")]
pub struct Args {
    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// Prefix of per-workspace database names
    #[arg(long, env = "MONGODB_DB_PREFIX", default_value = "ws")]
    pub mongodb_db_prefix: String,

    /// Account service URL (JSON-RPC)
    #[arg(long, env = "ACCOUNTS_URL", default_value = "http://localhost:3000")]
    pub accounts_url: String,

    /// Transactor URL for live rating broadcasts; empty disables them
    #[arg(long, env = "TRANSACTOR_URL")]
    pub transactor_url: Option<String>,

    /// Secret used to sign service tokens (required in production)
    #[arg(long, env = "SERVER_SECRET")]
    pub server_secret: Option<String>,

    /// Supported workspace model version (defaults to the content model's)
    #[arg(long, env = "MODEL_VERSION")]
    pub model_version: Option<String>,

    /// Path to a JSON content model (built-in model when unset)
    #[arg(long, env = "CONTENT_MODEL")]
    pub content_model: Option<String>,

    /// Durable consumer group shared by all instances
    #[arg(long, env = "CONSUMER_GROUP", default_value = "rating")]
    pub consumer_group: String,

    /// Messages fetched per consumer batch
    #[arg(long, env = "CONSUMER_BATCH", default_value = "100")]
    pub consumer_batch: usize,

    /// Enable development mode (in-memory storage fallback, insecure default secret)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Idle time before a workspace calculator is closed, in seconds
    #[arg(long, env = "CLOSE_TIMEOUT_SECS", default_value = "300")]
    pub close_timeout_secs: u64,

    /// Background flush period in milliseconds
    #[arg(long, env = "FLUSH_INTERVAL_MS", default_value = "5000")]
    pub flush_interval_ms: u64,

    /// Pending aggregates that trigger an early flush
    #[arg(long, env = "FLUSH_BATCH_SIZE", default_value = "1000")]
    pub flush_batch_size: usize,

    /// Change records per migration page
    #[arg(long, env = "MIGRATION_PAGE_SIZE", default_value = "250")]
    pub migration_page_size: usize,

    /// Burst debounce window in milliseconds
    #[arg(long, env = "BURST_WINDOW_MS", default_value = "1000")]
    pub burst_window_ms: i64,

    /// Accounts tracked by the burst limiter
    #[arg(long, env = "BURST_CACHE_SIZE", default_value = "10000")]
    pub burst_cache_size: usize,

    /// Aggregates kept in memory per workspace
    #[arg(long, env = "AGGREGATE_CACHE_SIZE", default_value = "1000")]
    pub aggregate_cache_size: usize,

    /// Version gate attempts before a workspace is marked unavailable
    #[arg(long, env = "VERSION_ATTEMPTS", default_value = "4")]
    pub version_attempts: u32,

    /// Delay between version gate attempts in seconds
    #[arg(long, env = "VERSION_DELAY_SECS", default_value = "10")]
    pub version_delay_secs: u64,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

impl Args {
    /// Effective signing secret (uses a default in dev mode)
    pub fn server_secret(&self) -> String {
        match &self.server_secret {
            Some(secret) => secret.clone(),
            None if self.dev_mode => "dev-only-insecure-secret".to_string(),
            None => String::new(),
        }
    }

    /// Transactor URL if live broadcasts are enabled
    pub fn transactor_url(&self) -> Option<String> {
        self.transactor_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(str::to_string)
    }

    pub fn supported_version(&self) -> Result<Option<ModelVersion>, String> {
        self.model_version
            .as_deref()
            .map(|v| v.parse::<ModelVersion>().map_err(|e| e.to_string()))
            .transpose()
    }

    pub fn calculator_config(&self) -> CalculatorConfig {
        CalculatorConfig {
            migration_page_size: self.migration_page_size,
            flush_batch_size: self.flush_batch_size,
            flush_interval: Duration::from_millis(self.flush_interval_ms),
            burst_window_ms: self.burst_window_ms,
            burst_cache_size: self.burst_cache_size,
            aggregate_cache_size: self.aggregate_cache_size,
            ..CalculatorConfig::default()
        }
    }

    pub fn manager_config(&self) -> Result<ManagerConfig, String> {
        let close_timeout = Duration::from_secs(self.close_timeout_secs);
        Ok(ManagerConfig {
            close_timeout,
            eviction_interval: (close_timeout / 10).max(Duration::from_secs(1)),
            version_attempts: self.version_attempts,
            version_delay: Duration::from_secs(self.version_delay_secs),
            supported_version: self.supported_version()?,
            consumer_group: self.consumer_group.clone(),
            consumer_batch: self.consumer_batch,
            calculator: self.calculator_config(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode && self.server_secret.as_deref().map_or(true, str::is_empty) {
            return Err("SERVER_SECRET is required in production mode".to_string());
        }

        if self.consumer_group.trim().is_empty() {
            return Err("CONSUMER_GROUP must not be empty".to_string());
        }

        let sizes = [
            ("CONSUMER_BATCH", self.consumer_batch),
            ("FLUSH_BATCH_SIZE", self.flush_batch_size),
            ("MIGRATION_PAGE_SIZE", self.migration_page_size),
            ("BURST_CACHE_SIZE", self.burst_cache_size),
            ("AGGREGATE_CACHE_SIZE", self.aggregate_cache_size),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, size)| *size == 0) {
            return Err(format!("{} must be greater than zero", name));
        }

        if self.flush_interval_ms == 0 {
            return Err("FLUSH_INTERVAL_MS must be greater than zero".to_string());
        }

        if self.burst_window_ms < 0 {
            return Err("BURST_WINDOW_MS must not be negative".to_string());
        }

        if self.version_attempts == 0 {
            return Err("VERSION_ATTEMPTS must be at least 1".to_string());
        }

        self.supported_version()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["rating-service"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_production_requires_secret() {
        let args = parse(&[]);
        assert!(args.validate().is_err());

        let args = parse(&["--server-secret", "s3cret"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.server_secret(), "s3cret");
    }

    #[test]
    fn test_dev_mode_secret_fallback() {
        let args = parse(&["--dev-mode"]);
        assert!(args.validate().is_ok());
        assert!(!args.server_secret().is_empty());
    }

    #[test]
    fn test_rejects_zero_sizes_and_bad_version() {
        let args = parse(&["--server-secret", "x", "--flush-batch-size", "0"]);
        assert!(args.validate().unwrap_err().contains("FLUSH_BATCH_SIZE"));

        let args = parse(&["--server-secret", "x", "--model-version", "0.7"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_derived_configs() {
        let args = parse(&[
            "--server-secret",
            "x",
            "--close-timeout-secs",
            "60",
            "--model-version",
            "0.7.1",
            "--transactor-url",
            "  ",
        ]);

        let manager = args.manager_config().unwrap();
        assert_eq!(manager.close_timeout, Duration::from_secs(60));
        assert_eq!(manager.eviction_interval, Duration::from_secs(6));
        assert_eq!(manager.supported_version, Some(ModelVersion::new(0, 7, 1)));
        assert_eq!(manager.calculator.migration_page_size, 250);
        assert_eq!(manager.calculator.flush_interval, Duration::from_secs(5));
        assert_eq!(args.transactor_url(), None);
    }
}
