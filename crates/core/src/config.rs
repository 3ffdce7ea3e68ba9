use serde::Deserialize;
use std::path::Path;

use crate::error::{CampaignError, CampaignResult};

/// Root dispatch configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `CAMPAIGN_DISPATCH__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Enrollments acted on per cycle: jobs created, sequences completed or
    /// configuration errors parked.
    #[serde(default = "default_scheduler_batch_size")]
    pub batch_size: usize,
    /// Upper bound on due enrollments examined per cycle, including those
    /// skipped for lack of a free mailbox.
    #[serde(default = "default_max_scan")]
    pub max_scan: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_worker_batch_size")]
    pub batch_size: usize,
    /// How far a capacity refusal pushes `next_attempt_at`.
    #[serde(default = "default_deferral_secs")]
    pub deferral_secs: u64,
    /// How far a provider failure pushes `next_attempt_at`.
    #[serde(default = "default_failure_backoff_secs")]
    pub failure_backoff_secs: u64,
    /// Total send attempts (first try included) before a failed job is left
    /// for an operator. `1` disables automatic retries.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_on_exhausted")]
    pub on_exhausted: ExhaustionPolicy,
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Lease held by a `Sending` job; must exceed `send_timeout_secs`.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

/// What happens to an enrollment once its current job used up every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// The step is given up on and the next step follows on its own delay.
    SkipStep,
    /// The enrollment waits on the failed job until an operator re-queues it.
    Hold,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_cold_daily_ceiling")]
    pub cold_daily_ceiling: u32,
    #[serde(default)]
    pub warming_daily_ceiling: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Weighted random order, first eligible mailbox wins.
    Shuffle,
    /// Per-profile rotating cursor, first eligible mailbox from the cursor wins.
    RoundRobin,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_selection")]
    pub selection: SelectionStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "dispatch-01".to_string()
}
fn default_enabled() -> bool {
    true
}
fn default_interval_secs() -> u64 {
    60
}
fn default_scheduler_batch_size() -> usize {
    50
}
fn default_max_scan() -> usize {
    1000
}
fn default_worker_batch_size() -> usize {
    10
}
fn default_deferral_secs() -> u64 {
    15 * 60
}
fn default_failure_backoff_secs() -> u64 {
    60 * 60
}
fn default_max_attempts() -> u32 {
    3
}
fn default_on_exhausted() -> ExhaustionPolicy {
    ExhaustionPolicy::SkipStep
}
fn default_send_timeout_secs() -> u64 {
    60
}
fn default_lease_secs() -> u64 {
    300
}
fn default_cold_daily_ceiling() -> u32 {
    10
}
fn default_selection() -> SelectionStrategy {
    SelectionStrategy::Shuffle
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            batch_size: default_scheduler_batch_size(),
            max_scan: default_max_scan(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            batch_size: default_worker_batch_size(),
            deferral_secs: default_deferral_secs(),
            failure_backoff_secs: default_failure_backoff_secs(),
            max_attempts: default_max_attempts(),
            on_exhausted: default_on_exhausted(),
            send_timeout_secs: default_send_timeout_secs(),
            lease_secs: default_lease_secs(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            cold_daily_ceiling: default_cold_daily_ceiling(),
            warming_daily_ceiling: None,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            selection: default_selection(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            delivery: DeliveryConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Longest interval, backoff, deferral, timeout or lease accepted.
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

impl AppConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(path: Option<&Path>) -> CampaignResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("CAMPAIGN_DISPATCH")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CampaignResult<()> {
        if self.scheduler.batch_size == 0 || self.worker.batch_size == 0 {
            return Err(CampaignError::Config("batch_size must be at least 1".into()));
        }
        if self.scheduler.interval_secs == 0 || self.worker.interval_secs == 0 {
            return Err(CampaignError::Config("interval_secs must be at least 1".into()));
        }
        if self.scheduler.max_scan < self.scheduler.batch_size {
            return Err(CampaignError::Config(
                "scheduler.max_scan must be at least scheduler.batch_size".into(),
            ));
        }
        let durations = [
            ("scheduler.interval_secs", self.scheduler.interval_secs),
            ("worker.interval_secs", self.worker.interval_secs),
            ("worker.deferral_secs", self.worker.deferral_secs),
            ("worker.failure_backoff_secs", self.worker.failure_backoff_secs),
            ("worker.send_timeout_secs", self.worker.send_timeout_secs),
            ("worker.lease_secs", self.worker.lease_secs),
        ];
        if let Some((name, value)) = durations.iter().find(|(_, v)| *v > MAX_DURATION_SECS) {
            return Err(CampaignError::Config(format!(
                "{name} ({value}) exceeds {MAX_DURATION_SECS} seconds"
            )));
        }
        if self.worker.max_attempts == 0 {
            return Err(CampaignError::Config("worker.max_attempts must be at least 1".into()));
        }
        if self.worker.lease_secs <= self.worker.send_timeout_secs {
            return Err(CampaignError::Config(format!(
                "worker.lease_secs ({}) must exceed worker.send_timeout_secs ({})",
                self.worker.lease_secs, self.worker.send_timeout_secs
            )));
        }
        Ok(())
    }
}
