use crate::util::{patch::RetryPolicy, wait::PollConfig};
use envconfig::Envconfig;
use tokio::time::Duration;

/// Operator settings, read once from the environment at startup.
#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    /// Headless service shared by all databases of a namespace
    #[envconfig(from = "GOVERNING_SERVICE", default = "kubedb")]
    pub governing_service: String,

    /// Repository owner of the database, util and exporter images
    #[envconfig(from = "DOCKER_REGISTRY", default = "kubedb")]
    pub docker_registry: String,

    #[envconfig(from = "EXPORTER_TAG", default = "0.6.0")]
    pub exporter_tag: String,

    #[envconfig(from = "ENABLE_RBAC", default = "false")]
    pub enable_rbac: bool,

    /// Verify image tags against the registry while validating
    #[envconfig(from = "CHECK_IMAGES", default = "true")]
    pub check_images: bool,

    #[envconfig(from = "DATABASE_PORT", default = "5432")]
    pub database_port: i32,

    #[envconfig(from = "HTTP_ADDRESS", default = "0.0.0.0:8080")]
    pub http_address: String,

    #[envconfig(from = "LOG_FORMAT")]
    pub log_format: Option<String>,

    #[envconfig(from = "POLL_INTERVAL_MS", default = "10000")]
    pub poll_interval_ms: u64,

    #[envconfig(from = "READINESS_TIMEOUT_SECS", default = "1800")]
    pub readiness_timeout_secs: u64,

    #[envconfig(from = "JOB_TIMEOUT_SECS", default = "1800")]
    pub job_timeout_secs: u64,

    #[envconfig(from = "PAUSE_TIMEOUT_SECS", default = "600")]
    pub pause_timeout_secs: u64,

    #[envconfig(from = "PATCH_RETRY_INITIAL_MS", default = "50")]
    pub patch_retry_initial_ms: u64,

    #[envconfig(from = "PATCH_RETRY_MAX_MS", default = "2000")]
    pub patch_retry_max_ms: u64,

    #[envconfig(from = "PATCH_RETRY_TIMEOUT_MS", default = "10000")]
    pub patch_retry_timeout_ms: u64,
}

impl Config {
    pub fn xdb_image(&self, version: &str) -> String {
        format!("{}/xdb:{}", self.docker_registry, version)
    }

    pub fn util_image(&self, version: &str) -> String {
        format!("{}/xdb:{}-util", self.docker_registry, version)
    }

    pub fn exporter_image(&self) -> String {
        format!("{}/operator:{}", self.docker_registry, self.exporter_tag)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::from_millis(self.patch_retry_initial_ms),
            max: Duration::from_millis(self.patch_retry_max_ms),
            timeout: Duration::from_millis(self.patch_retry_timeout_ms),
        }
    }

    pub fn readiness_poll(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.readiness_timeout_secs),
        )
    }

    pub fn job_poll(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.job_timeout_secs),
        )
    }

    pub fn pause_poll(&self) -> PollConfig {
        PollConfig::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_secs(self.pause_timeout_secs),
        )
    }
}
