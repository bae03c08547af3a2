//! Orchestrator configuration.
//!
//! This module provides configuration options for the reconstruction
//! orchestrator, including worker slots, working directory and toolkit paths,
//! process termination timing, event delivery, and store retry behaviour.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::stage::{StageRunner, VariantRegistry, DEFAULT_TAIL_LINES, DEFAULT_VARIANT};
use crate::storage::RetryPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// A submission or setting names a variant that is not configured.
    #[error("Unknown algorithm variant '{0}'")]
    UnknownVariant(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The variants file is not valid YAML for the expected shape.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for the reconstruction orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Admission settings
    /// Number of tasks allowed to hold the GPU at once.
    pub slots: usize,
    /// Variant used when a submission does not name one.
    pub default_variant: String,

    // Filesystem settings
    /// Directory under which per-task working directories are created.
    pub work_root: PathBuf,
    /// Checkout of the reconstruction toolkit (`convert.py`, `train.py`).
    pub toolkit_dir: PathBuf,
    /// Optional YAML file with extra algorithm variants.
    pub variants_file: Option<PathBuf>,

    // Storage settings
    /// SQLite connection URL for the task store.
    pub database_url: String,
    /// Attempts per store or lookup call before giving up.
    pub store_retry_attempts: u32,
    /// Pause between store retry attempts.
    pub store_retry_backoff: Duration,
    /// How long the single-instance lease survives without a heartbeat.
    pub lease_ttl: Duration,

    // Process settings
    /// Time between SIGTERM and SIGKILL when cancelling a stage.
    pub grace_period: Duration,
    /// Optional watchdog limit for a single stage.
    pub stage_timeout: Option<Duration>,
    /// Lines of stage output kept for failure reports.
    pub output_tail_lines: usize,
    /// How often a running stage re-reads the persisted task status.
    pub status_poll_interval: Duration,

    // Event settings
    /// Queue capacity of each event subscriber.
    pub subscriber_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            // Admission defaults
            slots: 1,
            default_variant: DEFAULT_VARIANT.to_string(),

            // Filesystem defaults
            work_root: PathBuf::from("uploads"),
            toolkit_dir: PathBuf::from("/workspace/gaussian-splatting"),
            variants_file: None,

            // Storage defaults
            database_url: "sqlite://recon.db".to_string(),
            store_retry_attempts: 3,
            store_retry_backoff: Duration::from_millis(200),
            lease_ttl: Duration::from_secs(30),

            // Process defaults
            grace_period: Duration::from_secs(10),
            stage_timeout: None,
            output_tail_lines: DEFAULT_TAIL_LINES,
            status_poll_interval: Duration::from_secs(2),

            // Event defaults
            subscriber_buffer: 64,
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RECON_SLOTS`: Concurrent GPU tasks (default: 1)
    /// - `RECON_DEFAULT_VARIANT`: Variant for submissions without one (default: 3dgs)
    /// - `RECON_WORK_ROOT`: Root of task working directories (default: uploads)
    /// - `RECON_TOOLKIT_DIR`: Toolkit checkout (default: /workspace/gaussian-splatting)
    /// - `RECON_VARIANTS_FILE`: YAML file with extra variants
    /// - `RECON_DATABASE_URL`: Task store URL (default: sqlite://recon.db)
    /// - `RECON_STORE_RETRY_ATTEMPTS`: Store attempts per call (default: 3)
    /// - `RECON_STORE_RETRY_BACKOFF_MS`: Pause between attempts (default: 200)
    /// - `RECON_LEASE_TTL_SECS`: Instance lease lifetime without heartbeat (default: 30)
    /// - `RECON_GRACE_PERIOD_SECS`: SIGTERM to SIGKILL delay (default: 10)
    /// - `RECON_STAGE_TIMEOUT_SECS`: Per-stage watchdog, 0 disables (default: off)
    /// - `RECON_OUTPUT_TAIL_LINES`: Output lines kept per stage (default: 200)
    /// - `RECON_STATUS_POLL_MS`: Persisted status poll interval (default: 2000)
    /// - `RECON_SUBSCRIBER_BUFFER`: Event queue per subscriber (default: 64)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Admission settings
        if let Some(val) = lookup("RECON_SLOTS") {
            config.slots = parse_env_value(&val, "RECON_SLOTS")?;
        }

        if let Some(val) = lookup("RECON_DEFAULT_VARIANT") {
            config.default_variant = val.trim().to_string();
        }

        // Filesystem settings
        if let Some(val) = lookup("RECON_WORK_ROOT") {
            config.work_root = PathBuf::from(val);
        }

        if let Some(val) = lookup("RECON_TOOLKIT_DIR") {
            config.toolkit_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("RECON_VARIANTS_FILE") {
            config.variants_file = Some(PathBuf::from(val)).filter(|p| !p.as_os_str().is_empty());
        }

        // Storage settings
        if let Some(val) = lookup("RECON_DATABASE_URL") {
            config.database_url = val;
        }

        if let Some(val) = lookup("RECON_STORE_RETRY_ATTEMPTS") {
            config.store_retry_attempts = parse_env_value(&val, "RECON_STORE_RETRY_ATTEMPTS")?;
        }

        if let Some(val) = lookup("RECON_STORE_RETRY_BACKOFF_MS") {
            let ms: u64 = parse_env_value(&val, "RECON_STORE_RETRY_BACKOFF_MS")?;
            config.store_retry_backoff = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("RECON_LEASE_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "RECON_LEASE_TTL_SECS")?;
            config.lease_ttl = Duration::from_secs(secs);
        }

        // Process settings
        if let Some(val) = lookup("RECON_GRACE_PERIOD_SECS") {
            let secs: u64 = parse_env_value(&val, "RECON_GRACE_PERIOD_SECS")?;
            config.grace_period = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("RECON_STAGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "RECON_STAGE_TIMEOUT_SECS")?;
            config.stage_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }

        if let Some(val) = lookup("RECON_OUTPUT_TAIL_LINES") {
            config.output_tail_lines = parse_env_value(&val, "RECON_OUTPUT_TAIL_LINES")?;
        }

        if let Some(val) = lookup("RECON_STATUS_POLL_MS") {
            let ms: u64 = parse_env_value(&val, "RECON_STATUS_POLL_MS")?;
            config.status_poll_interval = Duration::from_millis(ms);
        }

        // Event settings
        if let Some(val) = lookup("RECON_SUBSCRIBER_BUFFER") {
            config.subscriber_buffer = parse_env_value(&val, "RECON_SUBSCRIBER_BUFFER")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots == 0 {
            return Err(ConfigError::ValidationFailed(
                "slots must be greater than 0".to_string(),
            ));
        }

        if self.default_variant.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "default_variant cannot be empty".to_string(),
            ));
        }

        if self.work_root.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "work_root cannot be empty".to_string(),
            ));
        }

        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url cannot be empty".to_string(),
            ));
        }

        if self.store_retry_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "store_retry_attempts must be greater than 0".to_string(),
            ));
        }

        if self.lease_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "lease_ttl must be greater than 0".to_string(),
            ));
        }

        if self.stage_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "stage_timeout must be greater than 0 when set".to_string(),
            ));
        }

        if self.status_poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "status_poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.subscriber_buffer == 0 {
            return Err(ConfigError::ValidationFailed(
                "subscriber_buffer must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolves `work_root` and `toolkit_dir` against the current directory.
    ///
    /// Stages run with different working directories, so the paths rendered
    /// into their commands must not be relative.
    pub fn with_absolute_paths(mut self) -> Result<Self, ConfigError> {
        self.work_root = std::path::absolute(&self.work_root)?;
        self.toolkit_dir = std::path::absolute(&self.toolkit_dir)?;
        Ok(self)
    }

    /// Loads the variant registry: built-ins plus the variants file, if any.
    /// Fails if the default variant is not among them.
    pub fn load_variants(&self) -> Result<VariantRegistry, ConfigError> {
        let registry = match &self.variants_file {
            Some(path) => VariantRegistry::load(path)?,
            None => VariantRegistry::builtin(),
        };
        registry.resolve(&self.default_variant)?;
        Ok(registry)
    }

    /// Retry policy for store writes and dependent lookups.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.store_retry_attempts, self.store_retry_backoff)
    }

    /// Stage runner configured with the output tail, grace period and watchdog.
    pub fn stage_runner(&self) -> StageRunner {
        StageRunner::new(self.output_tail_lines, self.grace_period).with_timeout(self.stage_timeout)
    }

    /// Builder method to set the number of worker slots.
    pub fn with_slots(mut self, slots: usize) -> Self {
        self.slots = slots;
        self
    }

    /// Builder method to set the default variant.
    pub fn with_default_variant(mut self, variant: impl Into<String>) -> Self {
        self.default_variant = variant.into();
        self
    }

    /// Builder method to set the working directory root.
    pub fn with_work_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.work_root = path.into();
        self
    }

    /// Builder method to set the toolkit directory.
    pub fn with_toolkit_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.toolkit_dir = path.into();
        self
    }

    /// Builder method to set the variants file.
    pub fn with_variants_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.variants_file = Some(path.into());
        self
    }

    /// Builder method to set database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the store retry policy.
    pub fn with_store_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.store_retry_attempts = attempts;
        self.store_retry_backoff = backoff;
        self
    }

    /// Builder method to set the termination grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Builder method to set the per-stage watchdog.
    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Builder method to set the instance lease lifetime.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Builder method to set the output tail size.
    pub fn with_output_tail_lines(mut self, lines: usize) -> Self {
        self.output_tail_lines = lines;
        self
    }

    /// Builder method to set the persisted status poll interval.
    pub fn with_status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = interval;
        self
    }

    /// Builder method to set the subscriber queue capacity.
    pub fn with_subscriber_buffer(mut self, capacity: usize) -> Self {
        self.subscriber_buffer = capacity;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
