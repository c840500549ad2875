//! Orchestrator configuration.
//!
//! Configuration is resolved once at startup, in this order: built-in
//! defaults, an optional YAML file, then environment variables. The resulting
//! `OrchestratorConfig` is shared by `Arc` with every component.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::Stage;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The YAML configuration file could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a stage invocation is realized as a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPolicy {
    /// One container per invocation, started and stopped by the orchestrator.
    #[default]
    Ephemeral,
    /// Long-lived pool workers consume the stage queue and reply via the broker.
    Pooled,
}

impl FromStr for ExecutionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ephemeral" => Ok(ExecutionPolicy::Ephemeral),
            "pooled" | "pool" => Ok(ExecutionPolicy::Pooled),
            other => Err(format!("expected 'ephemeral' or 'pooled', got '{}'", other)),
        }
    }
}

/// Bounded exponential backoff for the startup broker connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectRetry {
    /// Total connection attempts before giving up.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl ConnectRetry {
    /// Delay to sleep after the given (zero-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Per-stage worker and retry settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSettings {
    /// Worker image.
    pub image: String,
    /// Command run inside the container; `None` keeps the image entrypoint.
    pub command: Option<Vec<String>>,
    /// Deadline for one stage invocation, covering every attempt.
    pub timeout: Duration,
    /// Total attempts for retryable failures.
    pub max_attempts: u32,
    /// Autoscaler lower bound.
    pub min_workers: usize,
    /// Autoscaler upper bound.
    pub max_workers: usize,
}

impl StageSettings {
    /// Default settings for a stage.
    pub fn for_stage(stage: Stage) -> Self {
        let command = match stage {
            Stage::Llm => None,
            _ => Some(vec!["python".to_string(), "main.py".to_string()]),
        };

        Self {
            image: stage.as_str().to_string(),
            command,
            timeout: Duration::from_secs(240),
            max_attempts: 3,
            min_workers: 1,
            max_workers: 10,
        }
    }

    /// Builder method to set the worker image.
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Builder method to set the container command.
    pub fn with_command(mut self, command: Option<Vec<String>>) -> Self {
        self.command = command;
        self
    }

    /// Builder method to set the stage timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Builder method to set total attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Builder method to set the autoscaler clamp.
    pub fn with_worker_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }
}

/// Configuration for the orchestrator process.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Broker settings
    /// Broker connection URL (Redis).
    pub broker_url: String,
    /// Key prefix for every queue, reply list and inbox in the broker.
    pub namespace: String,
    /// Startup connection retry policy.
    pub connect_retry: ConnectRetry,

    // Ledger settings
    /// Result ledger URL, `sqlite://<path>` or `redis://...`.
    pub result_backend: String,

    // Execution settings
    /// How stage invocations become workers.
    pub execution_policy: ExecutionPolicy,
    /// Exponential backoff base between collector attempts.
    pub backoff_base: u32,
    /// Unit multiplied by `backoff_base^attempt`.
    pub backoff_unit: Duration,
    /// Requests processed concurrently by `serve`.
    pub max_concurrent_requests: usize,

    // Autoscaler settings
    /// Autoscaler tick interval.
    pub autoscale_interval: Duration,
    /// Stages whose pool the autoscaler manages.
    pub autoscale_stages: Vec<Stage>,
    /// Queue backlog one worker is expected to absorb.
    pub max_tasks_per_worker: usize,

    /// Per-stage settings, one entry per stage.
    pub stages: BTreeMap<Stage, StageSettings>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            broker_url: "redis://localhost:6379".to_string(),
            namespace: "gaia".to_string(),
            connect_retry: ConnectRetry::default(),

            result_backend: "sqlite://data/results.sqlite".to_string(),

            execution_policy: ExecutionPolicy::Ephemeral,
            backoff_base: 2,
            backoff_unit: Duration::from_secs(1),
            max_concurrent_requests: 4,

            autoscale_interval: Duration::from_secs(10),
            autoscale_stages: vec![Stage::Llm],
            max_tasks_per_worker: 5,

            stages: Stage::ALL
                .into_iter()
                .map(|stage| (stage, StageSettings::for_stage(stage)))
                .collect(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves defaults, then the optional YAML file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(path) = path {
            let text = std::fs::read_to_string(path)?;
            config.apply_yaml(&text)?;
        }
        config.apply_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `GAIA_BROKER_URL` (fallback `CELERY_BROKER_URL`): broker URL
    /// - `GAIA_RESULT_BACKEND`: ledger URL (default: sqlite://data/results.sqlite)
    /// - `GAIA_NAMESPACE`: broker key prefix (default: gaia)
    /// - `GAIA_EXECUTION_POLICY`: `ephemeral` or `pooled`
    /// - `GAIA_BROKER_MAX_ATTEMPTS`: startup connection attempts (default: 30)
    /// - `GAIA_AUTOSCALE_INTERVAL_SECS`: autoscaler tick (default: 10)
    /// - `GAIA_AUTOSCALE_STAGES`: comma-separated stages (default: llm)
    /// - `GAIA_MAX_CONCURRENT_REQUESTS`: serve parallelism (default: 4)
    /// - `MAX_TASKS_PER_CONTAINER`: backlog per worker (default: 5)
    /// - `DOCKER_IMAGE_<STAGE>`: worker image (default: stage name)
    /// - `GAIA_<STAGE>_TIMEOUT_SECS`: stage timeout (default: 240)
    /// - `GAIA_<STAGE>_MAX_ATTEMPTS`: stage attempts (default: 3)
    /// - `GAIA_<STAGE>_MIN_WORKERS` / `GAIA_<STAGE>_MAX_WORKERS` (default: 1 / 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_lookup(lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_lookup<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Broker settings
        if let Some(val) = lookup("GAIA_BROKER_URL").or_else(|| lookup("CELERY_BROKER_URL")) {
            self.broker_url = val;
        }

        if let Some(val) = lookup("GAIA_NAMESPACE") {
            self.namespace = val;
        }

        if let Some(val) = lookup("GAIA_BROKER_MAX_ATTEMPTS") {
            self.connect_retry.max_attempts = parse_env_value(&val, "GAIA_BROKER_MAX_ATTEMPTS")?;
        }

        // Ledger settings
        if let Some(val) = lookup("GAIA_RESULT_BACKEND") {
            self.result_backend = val;
        }

        // Execution settings
        if let Some(val) = lookup("GAIA_EXECUTION_POLICY") {
            self.execution_policy =
                val.parse().map_err(|message| ConfigError::InvalidValue {
                    key: "GAIA_EXECUTION_POLICY".to_string(),
                    message,
                })?;
        }

        if let Some(val) = lookup("GAIA_MAX_CONCURRENT_REQUESTS") {
            self.max_concurrent_requests = parse_env_value(&val, "GAIA_MAX_CONCURRENT_REQUESTS")?;
        }

        // Autoscaler settings
        if let Some(val) = lookup("GAIA_AUTOSCALE_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "GAIA_AUTOSCALE_INTERVAL_SECS")?;
            self.autoscale_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("GAIA_AUTOSCALE_STAGES") {
            self.autoscale_stages = parse_stage_list(&val, "GAIA_AUTOSCALE_STAGES")?;
        }

        if let Some(val) = lookup("MAX_TASKS_PER_CONTAINER") {
            self.max_tasks_per_worker = parse_env_value(&val, "MAX_TASKS_PER_CONTAINER")?;
        }

        // Per-stage settings
        for stage in Stage::ALL {
            let key = stage.env_key();
            let settings = self
                .stages
                .entry(stage)
                .or_insert_with(|| StageSettings::for_stage(stage));

            if let Some(val) = lookup(&format!("DOCKER_IMAGE_{}", key)) {
                settings.image = val;
            }

            let timeout_key = format!("GAIA_{}_TIMEOUT_SECS", key);
            if let Some(val) = lookup(&timeout_key) {
                let secs: u64 = parse_env_value(&val, &timeout_key)?;
                settings.timeout = Duration::from_secs(secs);
            }

            let attempts_key = format!("GAIA_{}_MAX_ATTEMPTS", key);
            if let Some(val) = lookup(&attempts_key) {
                settings.max_attempts = parse_env_value(&val, &attempts_key)?;
            }

            let min_key = format!("GAIA_{}_MIN_WORKERS", key);
            if let Some(val) = lookup(&min_key) {
                settings.min_workers = parse_env_value(&val, &min_key)?;
            }

            let max_key = format!("GAIA_{}_MAX_WORKERS", key);
            if let Some(val) = lookup(&max_key) {
                settings.max_workers = parse_env_value(&val, &max_key)?;
            }
        }

        Ok(())
    }

    /// Overlays values from a YAML document onto this configuration.
    pub fn apply_yaml(&mut self, text: &str) -> Result<(), ConfigError> {
        let overlay: ConfigOverlay = serde_yaml::from_str(text)?;

        if let Some(url) = overlay.broker_url {
            self.broker_url = url;
        }
        if let Some(namespace) = overlay.namespace {
            self.namespace = namespace;
        }
        if let Some(attempts) = overlay.broker_max_attempts {
            self.connect_retry.max_attempts = attempts;
        }
        if let Some(backend) = overlay.result_backend {
            self.result_backend = backend;
        }
        if let Some(policy) = overlay.execution_policy {
            self.execution_policy = policy;
        }
        if let Some(max) = overlay.max_concurrent_requests {
            self.max_concurrent_requests = max;
        }
        if let Some(secs) = overlay.autoscale_interval_secs {
            self.autoscale_interval = Duration::from_secs(secs);
        }
        if let Some(stages) = overlay.autoscale_stages {
            self.autoscale_stages = stages;
        }
        if let Some(per) = overlay.max_tasks_per_worker {
            self.max_tasks_per_worker = per;
        }

        for (stage, stage_overlay) in overlay.stages {
            let settings = self
                .stages
                .entry(stage)
                .or_insert_with(|| StageSettings::for_stage(stage));

            if let Some(image) = stage_overlay.image {
                settings.image = image;
            }
            if let Some(command) = stage_overlay.command {
                settings.command = if command.is_empty() { None } else { Some(command) };
            }
            if let Some(secs) = stage_overlay.timeout_secs {
                settings.timeout = Duration::from_secs(secs);
            }
            if let Some(attempts) = stage_overlay.max_attempts {
                settings.max_attempts = attempts;
            }
            if let Some(min) = stage_overlay.min_workers {
                settings.min_workers = min;
            }
            if let Some(max) = stage_overlay.max_workers {
                settings.max_workers = max;
            }
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.broker_url.starts_with("redis://") || self.broker_url.starts_with("rediss://")) {
            return Err(ConfigError::ValidationFailed(format!(
                "broker_url must be a redis:// URL, got '{}'",
                self.broker_url
            )));
        }

        if self.namespace.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "namespace cannot be empty".to_string(),
            ));
        }

        if self.connect_retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "broker max_attempts must be greater than 0".to_string(),
            ));
        }

        if !(self.result_backend.starts_with("sqlite:") || self.result_backend.starts_with("redis"))
        {
            return Err(ConfigError::ValidationFailed(format!(
                "result_backend must be a sqlite:// or redis:// URL, got '{}'",
                self.result_backend
            )));
        }

        if self.backoff_base == 0 {
            return Err(ConfigError::ValidationFailed(
                "backoff_base must be greater than 0".to_string(),
            ));
        }

        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_requests must be greater than 0".to_string(),
            ));
        }

        if self.autoscale_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "autoscale_interval must be greater than 0".to_string(),
            ));
        }

        if self.max_tasks_per_worker == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_tasks_per_worker must be greater than 0".to_string(),
            ));
        }

        for (stage, settings) in &self.stages {
            if settings.image.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{}: image cannot be empty",
                    stage
                )));
            }
            if settings.timeout.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{}: timeout must be greater than 0",
                    stage
                )));
            }
            if settings.max_attempts == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{}: max_attempts must be at least 1",
                    stage
                )));
            }
            if settings.min_workers > settings.max_workers {
                return Err(ConfigError::ValidationFailed(format!(
                    "{}: min_workers ({}) cannot exceed max_workers ({})",
                    stage, settings.min_workers, settings.max_workers
                )));
            }
        }

        Ok(())
    }

    /// Settings for one stage.
    pub fn stage(&self, stage: Stage) -> StageSettings {
        self.stages
            .get(&stage)
            .cloned()
            .unwrap_or_else(|| StageSettings::for_stage(stage))
    }

    /// Builder method to set the broker URL.
    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    /// Builder method to set the broker namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Builder method to set the startup connection policy.
    pub fn with_connect_retry(mut self, retry: ConnectRetry) -> Self {
        self.connect_retry = retry;
        self
    }

    /// Builder method to set the result backend URL.
    pub fn with_result_backend(mut self, backend: impl Into<String>) -> Self {
        self.result_backend = backend.into();
        self
    }

    /// Builder method to set the execution policy.
    pub fn with_execution_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.execution_policy = policy;
        self
    }

    /// Builder method to set the collector backoff.
    pub fn with_retry_backoff(mut self, base: u32, unit: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_unit = unit;
        self
    }

    /// Builder method to set serve parallelism.
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Builder method to set the autoscaler tick.
    pub fn with_autoscale_interval(mut self, interval: Duration) -> Self {
        self.autoscale_interval = interval;
        self
    }

    /// Builder method to set the autoscaled stages.
    pub fn with_autoscale_stages(mut self, stages: Vec<Stage>) -> Self {
        self.autoscale_stages = stages;
        self
    }

    /// Builder method to set the backlog per worker.
    pub fn with_max_tasks_per_worker(mut self, per: usize) -> Self {
        self.max_tasks_per_worker = per;
        self
    }

    /// Builder method to replace one stage's settings.
    pub fn with_stage(mut self, stage: Stage, settings: StageSettings) -> Self {
        self.stages.insert(stage, settings);
        self
    }

    /// Builder method to set every stage's timeout.
    pub fn with_stage_timeouts(mut self, timeout: Duration) -> Self {
        for settings in self.stages.values_mut() {
            settings.timeout = timeout;
        }
        self
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigOverlay {
    broker_url: Option<String>,
    namespace: Option<String>,
    broker_max_attempts: Option<u32>,
    result_backend: Option<String>,
    execution_policy: Option<ExecutionPolicy>,
    max_concurrent_requests: Option<usize>,
    autoscale_interval_secs: Option<u64>,
    autoscale_stages: Option<Vec<Stage>>,
    max_tasks_per_worker: Option<usize>,
    stages: BTreeMap<Stage, StageOverlay>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StageOverlay {
    image: Option<String>,
    command: Option<Vec<String>>,
    timeout_secs: Option<u64>,
    max_attempts: Option<u32>,
    min_workers: Option<usize>,
    max_workers: Option<usize>,
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse a comma-separated list of stage names.
fn parse_stage_list(value: &str, key: &str) -> Result<Vec<Stage>, ConfigError> {
    let mut stages = Vec::new();
    for part in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let stage: Stage = part.parse().map_err(|message| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        })?;
        if !stages.contains(&stage) {
            stages.push(stage);
        }
    }
    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.broker_url, "redis://localhost:6379");
        assert_eq!(config.namespace, "gaia");
        assert_eq!(config.connect_retry.max_attempts, 30);
        assert_eq!(config.execution_policy, ExecutionPolicy::Ephemeral);
        assert_eq!(config.autoscale_interval, Duration::from_secs(10));
        assert_eq!(config.autoscale_stages, vec![Stage::Llm]);
        assert_eq!(config.max_tasks_per_worker, 5);
        assert_eq!(config.stages.len(), Stage::ALL.len());

        let chunker = config.stage(Stage::Chunker);
        assert_eq!(chunker.image, "chunker");
        assert_eq!(chunker.timeout, Duration::from_secs(240));
        assert_eq!(chunker.max_attempts, 3);
        assert_eq!(
            chunker.command,
            Some(vec!["python".to_string(), "main.py".to_string()])
        );
        assert_eq!(config.stage(Stage::Llm).command, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup_from(&[
            ("CELERY_BROKER_URL", "redis://broker:6379/0"),
            ("GAIA_EXECUTION_POLICY", "pooled"),
            ("GAIA_AUTOSCALE_STAGES", "llm, prompt,llm"),
            ("MAX_TASKS_PER_CONTAINER", "8"),
            ("DOCKER_IMAGE_LLM", "registry/llm:2"),
            ("GAIA_GRAPH_DB_TIMEOUT_SECS", "30"),
            ("GAIA_LLM_MAX_WORKERS", "4"),
        ]))
        .expect("config should load");

        assert_eq!(config.broker_url, "redis://broker:6379/0");
        assert_eq!(config.execution_policy, ExecutionPolicy::Pooled);
        assert_eq!(config.autoscale_stages, vec![Stage::Llm, Stage::Prompt]);
        assert_eq!(config.max_tasks_per_worker, 8);
        assert_eq!(config.stage(Stage::Llm).image, "registry/llm:2");
        assert_eq!(config.stage(Stage::Llm).max_workers, 4);
        assert_eq!(
            config.stage(Stage::GraphDb).timeout,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_gaia_broker_url_wins_over_celery() {
        let config = OrchestratorConfig::from_lookup(lookup_from(&[
            ("GAIA_BROKER_URL", "redis://primary:6379"),
            ("CELERY_BROKER_URL", "redis://legacy:6379"),
        ]))
        .expect("config should load");
        assert_eq!(config.broker_url, "redis://primary:6379");
    }

    #[test]
    fn test_from_lookup_invalid_values() {
        let err = OrchestratorConfig::from_lookup(lookup_from(&[(
            "GAIA_LLM_TIMEOUT_SECS",
            "soon",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("GAIA_LLM_TIMEOUT_SECS"));

        let err = OrchestratorConfig::from_lookup(lookup_from(&[(
            "GAIA_AUTOSCALE_STAGES",
            "llm,ocr",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("ocr"));

        let err = OrchestratorConfig::from_lookup(lookup_from(&[(
            "GAIA_EXECUTION_POLICY",
            "forever",
        )]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_yaml_overlay() {
        let mut config = OrchestratorConfig::default();
        config
            .apply_yaml(
                r#"
namespace: staging
execution_policy: pooled
autoscale_interval_secs: 3
stages:
  llm:
    image: llm:gpu
    min_workers: 2
    max_workers: 6
  chunker:
    command: []
    timeout_secs: 60
"#,
            )
            .expect("yaml should apply");

        assert_eq!(config.namespace, "staging");
        assert_eq!(config.execution_policy, ExecutionPolicy::Pooled);
        assert_eq!(config.autoscale_interval, Duration::from_secs(3));
        let llm = config.stage(Stage::Llm);
        assert_eq!(llm.image, "llm:gpu");
        assert_eq!((llm.min_workers, llm.max_workers), (2, 6));
        let chunker = config.stage(Stage::Chunker);
        assert_eq!(chunker.command, None);
        assert_eq!(chunker.timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_rejects_unknown_keys() {
        let mut config = OrchestratorConfig::default();
        let err = config.apply_yaml("brokr_url: redis://x\n").unwrap_err();
        assert!(matches!(err, ConfigError::Yaml(_)));
    }

    #[test]
    fn test_validation_failures() {
        let config = OrchestratorConfig::default().with_broker_url("amqp://rabbit");
        assert!(config.validate().unwrap_err().to_string().contains("broker_url"));

        let config = OrchestratorConfig::default().with_namespace(" ");
        assert!(config.validate().unwrap_err().to_string().contains("namespace"));

        let config = OrchestratorConfig::default().with_result_backend("postgres://db");
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("result_backend"));

        let config = OrchestratorConfig::default().with_max_concurrent_requests(0);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("max_concurrent_requests"));

        let config = OrchestratorConfig::default().with_stage(
            Stage::Llm,
            StageSettings::for_stage(Stage::Llm).with_worker_bounds(5, 2),
        );
        assert!(config.validate().unwrap_err().to_string().contains("min_workers"));

        let config = OrchestratorConfig::default().with_stage(
            Stage::Prompt,
            StageSettings::for_stage(Stage::Prompt).with_max_attempts(0),
        );
        assert!(config.validate().unwrap_err().to_string().contains("prompt"));
    }

    #[test]
    fn test_builder_methods() {
        let config = OrchestratorConfig::new()
            .with_connect_retry(ConnectRetry {
                max_attempts: 5,
                ..ConnectRetry::default()
            })
            .with_max_tasks_per_worker(2)
            .with_stage_timeouts(Duration::from_secs(15))
            .with_stage(
                Stage::Llm,
                StageSettings::for_stage(Stage::Llm).with_image("llm:cpu"),
            );

        assert_eq!(config.connect_retry.max_attempts, 5);
        assert_eq!(config.max_tasks_per_worker, 2);
        assert_eq!(config.stage(Stage::Chunker).timeout, Duration::from_secs(15));
        assert_eq!(config.stage(Stage::Llm).image, "llm:cpu");
        assert_eq!(config.stage(Stage::Llm).timeout, Duration::from_secs(240));
    }

    #[test]
    fn test_connect_retry_delay_is_bounded() {
        let retry = ConnectRetry::default();
        assert_eq!(retry.delay_for(0), Duration::from_secs(1));
        assert_eq!(retry.delay_for(2), Duration::from_secs(4));
        assert_eq!(retry.delay_for(10), Duration::from_secs(10));
        assert_eq!(retry.delay_for(u32::MAX), Duration::from_secs(10));
    }
}
