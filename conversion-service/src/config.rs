use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::OutputFormat;
use crate::engine::augmentation::AugmentationRegistry;
use crate::error::{ServiceError, ServiceResult};

/// Service configuration, read once at startup
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default = "default_limits")]
    pub limits: LimitsConfig,

    #[serde(default = "default_jobs")]
    pub jobs: JobsConfig,

    #[serde(default = "default_engine")]
    pub engine: EngineConfig,

    #[serde(default)]
    pub augmentation: AugmentationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Expose internal error details in API responses
    #[serde(default)]
    pub debug: bool,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the job database (result store and task queue)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("jobs.db")
    }
}

/// Upload limits
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,
}

impl LimitsConfig {
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }
}

/// Backoff shape between automatic retries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
    #[default]
    Fixed,
    Exponential,
}

/// Job orchestration settings
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// How long terminal job records stay queryable
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default)]
    pub retry_backoff: RetryBackoff,

    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,

    /// Number of worker tasks to run
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Number of scarce execution resources (e.g. accelerators)
    #[serde(default = "default_resource_units")]
    pub resource_units: usize,

    #[serde(default = "default_soft_time_limit_secs")]
    pub soft_time_limit_secs: u64,

    #[serde(default = "default_hard_time_limit_secs")]
    pub hard_time_limit_secs: u64,

    /// Executions after which a worker replaces its engine handle
    #[serde(default = "default_max_jobs_per_worker")]
    pub max_jobs_per_worker: u32,

    /// How long a revoked call may take to yield before it is dropped
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl JobsConfig {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_secs)
    }

    pub fn soft_time_limit(&self) -> Duration {
        Duration::from_secs(self.soft_time_limit_secs)
    }

    pub fn hard_time_limit(&self) -> Duration {
        Duration::from_secs(self.hard_time_limit_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Lease taken on a queue message; outlives the hard limit so a live
    /// worker is never raced by a redelivery of its own job.
    pub fn lease_duration(&self) -> Duration {
        self.hard_time_limit() + self.cancel_grace() + Duration::from_secs(30)
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        default_jobs()
    }
}

/// Delegated conversion engine settings
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Converter executable invoked per job
    #[serde(default = "default_engine_command")]
    pub command: String,

    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Force OCR regardless of per-job options
    #[serde(default)]
    pub force_ocr: bool,

    #[serde(default)]
    pub default_output_format: OutputFormat,
}

/// External augmentation (LLM post-processing) settings
#[derive(Debug, Clone, Deserialize)]
pub struct AugmentationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default)]
    pub google_api_key: Option<String>,

    #[serde(default)]
    pub openai_api_key: Option<String>,

    #[serde(default)]
    pub anthropic_api_key: Option<String>,

    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,

    #[serde(default = "default_ollama_model")]
    pub ollama_model: String,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            google_api_key: None,
            openai_api_key: None,
            anthropic_api_key: None,
            ollama_base_url: default_ollama_base_url(),
            ollama_model: default_ollama_model(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the compact format
    #[serde(default)]
    pub json: bool,
}

impl ServiceConfig {
    /// Load configuration from `config.*` and `CONVERTER__*` environment variables
    pub fn load() -> ServiceResult<Self> {
        let config: ServiceConfig = Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("CONVERTER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("engine.extra_args")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to build config: {}", e),
            })?
            .try_deserialize()
            .map_err(|e| ServiceError::Config {
                message: format!("Failed to deserialize config: {}", e),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the orchestration core cannot honor
    pub fn validate(&self) -> ServiceResult<()> {
        let jobs = &self.jobs;
        if jobs.resource_units == 0 {
            return Err(ServiceError::Config {
                message: "jobs.resource_units must be at least 1".to_string(),
            });
        }
        if jobs.concurrency == 0 {
            return Err(ServiceError::Config {
                message: "jobs.concurrency must be at least 1".to_string(),
            });
        }
        if jobs.hard_time_limit_secs <= jobs.soft_time_limit_secs {
            return Err(ServiceError::Config {
                message: format!(
                    "jobs.hard_time_limit_secs ({}) must exceed jobs.soft_time_limit_secs ({})",
                    jobs.hard_time_limit_secs, jobs.soft_time_limit_secs
                ),
            });
        }
        if jobs.max_jobs_per_worker == 0 {
            return Err(ServiceError::Config {
                message: "jobs.max_jobs_per_worker must be at least 1".to_string(),
            });
        }
        if self.limits.max_file_size_mb == 0 {
            return Err(ServiceError::Config {
                message: "limits.max_file_size_mb must be at least 1".to_string(),
            });
        }
        AugmentationRegistry::resolve(&self.augmentation)?;
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            storage: default_storage(),
            limits: default_limits(),
            jobs: default_jobs(),
            engine: default_engine(),
            augmentation: AugmentationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ==================== Default Value Functions ====================

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
        debug: false,
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_storage() -> StorageConfig {
    StorageConfig {
        data_dir: default_data_dir(),
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_limits() -> LimitsConfig {
    LimitsConfig {
        max_file_size_mb: default_max_file_size_mb(),
    }
}

fn default_max_file_size_mb() -> u64 {
    100
}

fn default_jobs() -> JobsConfig {
    JobsConfig {
        result_ttl_secs: default_result_ttl_secs(),
        max_retries: default_max_retries(),
        retry_delay_secs: default_retry_delay_secs(),
        retry_backoff: RetryBackoff::default(),
        retry_max_delay_secs: default_retry_max_delay_secs(),
        concurrency: default_concurrency(),
        resource_units: default_resource_units(),
        soft_time_limit_secs: default_soft_time_limit_secs(),
        hard_time_limit_secs: default_hard_time_limit_secs(),
        max_jobs_per_worker: default_max_jobs_per_worker(),
        cancel_grace_secs: default_cancel_grace_secs(),
        sweep_interval_secs: default_sweep_interval_secs(),
        poll_interval_ms: default_poll_interval_ms(),
    }
}

fn default_result_ttl_secs() -> u64 {
    60 * 60 // 1 hour
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    30
}

fn default_retry_max_delay_secs() -> u64 {
    600
}

fn default_concurrency() -> usize {
    1
}

fn default_resource_units() -> usize {
    1
}

fn default_soft_time_limit_secs() -> u64 {
    10 * 60
}

fn default_hard_time_limit_secs() -> u64 {
    15 * 60
}

fn default_max_jobs_per_worker() -> u32 {
    50
}

fn default_cancel_grace_secs() -> u64 {
    10
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_engine() -> EngineConfig {
    EngineConfig {
        command: default_engine_command(),
        extra_args: Vec::new(),
        force_ocr: false,
        default_output_format: OutputFormat::default(),
    }
}

fn default_engine_command() -> String {
    "marker_single".to_string()
}

fn default_provider() -> String {
    "gemini".to_string()
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_ollama_model() -> String {
    "qwen3:4b".to_string()
}
