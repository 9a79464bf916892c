use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::coordinator::CoordinatorConfig;
use crate::relay::RelayConfig;
use prover_client::ProverClientConfig;

pub const APP_HOME: &str = ".proof-gateway";
pub const CONFIG_DIR: &str = "config";
pub const CONFIG_FILE: &str = "config.yaml";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Defaults to `~/.proof-gateway/data` when unset.
    #[serde(default)]
    pub data_dir: Option<String>,
    /// When set, gateway API routes require this key (`x-api-key` or
    /// `Authorization: Bearer`).
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub cors_allowed_origin: Option<String>,
    #[serde(default = "default_max_tape_bytes")]
    pub max_tape_bytes: usize,
    #[serde(default)]
    pub prover: ProverSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub jobs: JobSection,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProverSection {
    #[serde(default = "default_prover_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub access_client_id: Option<String>,
    #[serde(default)]
    pub access_client_secret: Option<String>,
    /// Pin the prover image; health checks fail on any other image id.
    #[serde(default)]
    pub expected_image_id: Option<String>,
    #[serde(default = "default_receipt_kind")]
    pub receipt_kind: String,
    #[serde(default = "default_segment_limit_po2")]
    pub segment_limit_po2: u32,
    #[serde(default = "default_min_segment_limit_po2")]
    pub min_segment_limit_po2: u32,
    #[serde(default = "default_oom_fallback_po2")]
    pub oom_fallback_po2: u32,
    #[serde(default = "default_max_frames")]
    pub max_frames: u32,
    #[serde(default = "default_verify_receipt")]
    pub verify_receipt: bool,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_health_cache_ttl_secs")]
    pub health_cache_ttl_secs: u64,
    #[serde(default = "default_retryable_error_codes")]
    pub retryable_error_codes: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_relay_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSection {
    #[serde(default = "default_max_job_wall_time_secs")]
    pub max_job_wall_time_secs: u64,
    #[serde(default = "default_poll_deadline_secs")]
    pub poll_deadline_secs: u64,
    #[serde(default = "default_poll_budget_secs")]
    pub poll_budget_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
    #[serde(default = "default_max_queue_retries")]
    pub max_queue_retries: u32,
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    #[serde(default = "default_max_claim_attempts")]
    pub max_claim_attempts: u32,
    #[serde(default = "default_max_completed_jobs")]
    pub max_completed_jobs: usize,
    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_tape_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_prover_base_url() -> String {
    "http://127.0.0.1:8081".to_string()
}
fn default_receipt_kind() -> String {
    "groth16".to_string()
}
fn default_segment_limit_po2() -> u32 {
    20
}
fn default_min_segment_limit_po2() -> u32 {
    13
}
fn default_oom_fallback_po2() -> u32 {
    18
}
fn default_max_frames() -> u32 {
    100_000
}
fn default_verify_receipt() -> bool {
    true
}
fn default_http_timeout_secs() -> u64 {
    30
}
fn default_health_cache_ttl_secs() -> u64 {
    30
}
fn default_retryable_error_codes() -> Vec<String> {
    vec!["job_not_found".to_string(), "job_evicted".to_string()]
}
fn default_relay_endpoint() -> String {
    "http://127.0.0.1:8787/relay".to_string()
}
fn default_max_job_wall_time_secs() -> u64 {
    660
}
fn default_poll_deadline_secs() -> u64 {
    600
}
fn default_poll_budget_secs() -> u64 {
    45
}
fn default_poll_interval_secs() -> u64 {
    3
}
fn default_max_retry_delay_secs() -> u64 {
    30
}
fn default_max_queue_retries() -> u32 {
    5
}
fn default_max_recovery_attempts() -> u32 {
    3
}
fn default_max_claim_attempts() -> u32 {
    5
}
fn default_max_completed_jobs() -> usize {
    200
}
fn default_completed_retention_secs() -> u64 {
    24 * 60 * 60
}

impl Default for Config {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config deserializes")
    }
}

impl Default for ProverSection {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty prover section deserializes")
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty relay section deserializes")
    }
}

impl Default for JobSection {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty jobs section deserializes")
    }
}

impl Config {
    /// Read the YAML config file, then let the environment override it.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let mut config: Config = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus environment, for running without a config file.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        read_env_string("GATEWAY_BIND_ADDR", &mut self.bind_addr);
        read_env_optional("DATA_DIR", &mut self.data_dir);
        read_env_optional("API_KEY", &mut self.api_key);
        read_env_optional("CORS_ALLOWED_ORIGIN", &mut self.cors_allowed_origin);
        read_env_usize("MAX_TAPE_BYTES", &mut self.max_tape_bytes);

        read_env_string("PROVER_BASE_URL", &mut self.prover.base_url);
        read_env_optional("PROVER_API_KEY", &mut self.prover.api_key);
        read_env_optional("PROVER_ACCESS_CLIENT_ID", &mut self.prover.access_client_id);
        read_env_optional(
            "PROVER_ACCESS_CLIENT_SECRET",
            &mut self.prover.access_client_secret,
        );
        read_env_optional("PROVER_IMAGE_ID", &mut self.prover.expected_image_id);
        read_env_string("PROVER_RECEIPT_KIND", &mut self.prover.receipt_kind);
        read_env_u32("PROVER_SEGMENT_LIMIT_PO2", &mut self.prover.segment_limit_po2);
        read_env_u32("PROVER_MAX_FRAMES", &mut self.prover.max_frames);
        read_env_u64("PROVER_HTTP_TIMEOUT_SECS", &mut self.prover.http_timeout_secs);
        read_env_u64(
            "PROVER_HEALTH_CACHE_TTL_SECS",
            &mut self.prover.health_cache_ttl_secs,
        );

        read_env_string("RELAY_ENDPOINT", &mut self.relay.endpoint);
        read_env_optional("RELAY_API_KEY", &mut self.relay.api_key);
        read_env_u64("RELAY_HTTP_TIMEOUT_SECS", &mut self.relay.http_timeout_secs);

        read_env_u64(
            "MAX_JOB_WALL_TIME_SECS",
            &mut self.jobs.max_job_wall_time_secs,
        );
        read_env_u64("POLL_DEADLINE_SECS", &mut self.jobs.poll_deadline_secs);
        read_env_u64("POLL_BUDGET_SECS", &mut self.jobs.poll_budget_secs);
        read_env_u64("POLL_INTERVAL_SECS", &mut self.jobs.poll_interval_secs);
        read_env_u64("MAX_RETRY_DELAY_SECS", &mut self.jobs.max_retry_delay_secs);
        read_env_u32("MAX_QUEUE_RETRIES", &mut self.jobs.max_queue_retries);
        read_env_u32(
            "MAX_RECOVERY_ATTEMPTS",
            &mut self.jobs.max_recovery_attempts,
        );
        read_env_u32("MAX_CLAIM_ATTEMPTS", &mut self.jobs.max_claim_attempts);
        read_env_usize("MAX_COMPLETED_JOBS", &mut self.jobs.max_completed_jobs);
        read_env_u64(
            "COMPLETED_RETENTION_SECS",
            &mut self.jobs.completed_retention_secs,
        );
    }

    pub fn data_dir(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()
                .expect("cannot find home directory")
                .join(APP_HOME)
                .join("data"),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_job_wall_time: Duration::from_secs(self.jobs.max_job_wall_time_secs),
            poll_deadline: Duration::from_secs(self.jobs.poll_deadline_secs),
            poll_budget: Duration::from_secs(self.jobs.poll_budget_secs),
            poll_interval: Duration::from_secs(self.jobs.poll_interval_secs),
            max_retry_delay_secs: self.jobs.max_retry_delay_secs,
            max_recovery_attempts: self.jobs.max_recovery_attempts,
            max_completed_jobs: self.jobs.max_completed_jobs,
            completed_retention: Duration::from_secs(self.jobs.completed_retention_secs),
            default_segment_limit_po2: self.prover.segment_limit_po2,
            min_segment_limit_po2: self.prover.min_segment_limit_po2,
            oom_fallback_po2: self.prover.oom_fallback_po2,
        }
    }

    pub fn prover_client_config(&self) -> Result<ProverClientConfig> {
        let base_url = Url::parse(&self.prover.base_url)
            .with_context(|| format!("bad prover base URL {:?}", self.prover.base_url))?;
        let mut config = ProverClientConfig::new(base_url);
        config.api_key = self.prover.api_key.clone();
        config.access_client_id = self.prover.access_client_id.clone();
        config.access_client_secret = self.prover.access_client_secret.clone();
        config.timeout = Duration::from_secs(self.prover.http_timeout_secs);
        config.receipt_kind = self.prover.receipt_kind.clone();
        config.segment_limit_po2 = self.prover.segment_limit_po2;
        config.max_frames = self.prover.max_frames;
        config.verify_receipt = self.prover.verify_receipt;
        config.expected_image_id = self.prover.expected_image_id.clone();
        config.health_cache_ttl = Duration::from_secs(self.prover.health_cache_ttl_secs);
        config.retryable_error_codes = self.prover.retryable_error_codes.clone();
        Ok(config)
    }

    pub fn relay_config(&self) -> Result<RelayConfig> {
        let endpoint = Url::parse(&self.relay.endpoint)
            .with_context(|| format!("bad relay endpoint {:?}", self.relay.endpoint))?;
        Ok(RelayConfig {
            endpoint,
            api_key: self.relay.api_key.clone(),
            timeout: Duration::from_secs(self.relay.http_timeout_secs),
        })
    }
}

fn read_env_string(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name) {
        let value = value.trim();
        if !value.is_empty() {
            *target = value.to_string();
        }
    }
}

fn read_env_optional(name: &str, target: &mut Option<String>) {
    if let Ok(value) = std::env::var(name) {
        let value = value.trim();
        if !value.is_empty() {
            *target = Some(value.to_string());
        }
    }
}

fn read_env_u64(name: &str, target: &mut u64) {
    if let Ok(value) = std::env::var(name) {
        match value.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!("ignoring unparseable {name}={value:?}"),
        }
    }
}

fn read_env_u32(name: &str, target: &mut u32) {
    if let Ok(value) = std::env::var(name) {
        match value.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!("ignoring unparseable {name}={value:?}"),
        }
    }
}

fn read_env_usize(name: &str, target: &mut usize) {
    if let Ok(value) = std::env::var(name) {
        match value.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!("ignoring unparseable {name}={value:?}"),
        }
    }
}
