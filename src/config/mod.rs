use serde::Deserialize;
use std::time::Duration;

use crate::services::dispatcher::DispatcherConfig;
use crate::services::notifier::{NotifierConfig, OutcomePolicy};
use crate::services::sweeper::RetentionConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the capture task queue
    pub redis_url: String,

    /// R2 bucket name
    pub r2_bucket: String,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: String,

    /// R2 endpoint URL
    pub r2_endpoint: String,

    /// Optional AES-256-GCM key (base64, 32 bytes). When set, blobs are sealed at rest.
    #[serde(default)]
    pub encryption_key: Option<String>,

    /// Endpoint of the headless-browser capture service
    pub capture_service_url: String,

    #[serde(default)]
    pub capture_api_token: Option<String>,

    /// HTTP mail relay accepting `{to, subject, body}`
    #[serde(default)]
    pub mail_relay_url: Option<String>,

    #[serde(default)]
    pub mail_relay_token: Option<String>,

    /// Token required by the build administration endpoint. Unset disables it.
    #[serde(default)]
    pub admin_token: Option<String>,

    /// Base URL used in results links
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_per_host_concurrency")]
    pub per_host_concurrency: usize,

    /// Total capture attempts per task
    #[serde(default = "default_max_capture_retries")]
    pub max_capture_retries: u32,

    #[serde(default = "default_capture_timeout_secs")]
    pub capture_timeout_secs: u64,

    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,

    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,

    #[serde(default = "default_notify_max_attempts")]
    pub notify_max_attempts: u32,

    #[serde(default = "default_retry_backoff_base_ms")]
    pub notify_backoff_base_ms: u64,

    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Keep comparison rows after the retention sweep removes their images
    #[serde(default = "default_true")]
    pub retain_comparison_metadata: bool,

    /// Fraction of unmasked pixels allowed to differ while still "same"
    #[serde(default)]
    pub comparison_tolerance: f64,

    #[serde(default)]
    pub outcome_policy: OutcomePolicy,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_per_host_concurrency() -> usize {
    2
}

fn default_max_capture_retries() -> u32 {
    3
}

fn default_capture_timeout_secs() -> u64 {
    60
}

fn default_retry_backoff_base_ms() -> u64 {
    1000
}

fn default_retry_backoff_max_ms() -> u64 {
    60_000
}

fn default_notify_max_attempts() -> u32 {
    5
}

fn default_retention_days() -> u64 {
    3
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn dispatcher(&self) -> DispatcherConfig {
        DispatcherConfig {
            worker_concurrency: self.worker_concurrency,
            per_host_concurrency: self.per_host_concurrency,
            max_retries: self.max_capture_retries,
            capture_timeout: self.capture_timeout(),
            backoff_base: Duration::from_millis(self.retry_backoff_base_ms),
            backoff_max: Duration::from_millis(self.retry_backoff_max_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..DispatcherConfig::default()
        }
    }

    pub fn notifier(&self) -> NotifierConfig {
        NotifierConfig {
            outcome_policy: self.outcome_policy,
            max_attempts: self.notify_max_attempts,
            backoff_base: Duration::from_millis(self.notify_backoff_base_ms),
            backoff_max: Duration::from_millis(self.retry_backoff_max_ms),
            public_base_url: self.public_base_url.clone(),
        }
    }

    pub fn retention(&self) -> RetentionConfig {
        RetentionConfig {
            ttl: Duration::from_secs(self.retention_days * 24 * 60 * 60),
            interval: Duration::from_secs(self.sweep_interval_secs),
            retain_comparison_metadata: self.retain_comparison_metadata,
        }
    }
}
