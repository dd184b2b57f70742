//! # DCP Configuration
//!
//! Layered configuration for the engine's loops (§4.9), modeled on the
//! reference `tasker_shared::config` split between a canonical TOML-backed
//! struct tree and `DCP_`-prefixed environment overrides.
//!
//! Loading layers a base TOML file, an optional environment-specific TOML
//! file, and environment variables, in that order, via the `config` crate.

use std::collections::HashMap;
use std::time::Duration;

use dcp_types::TaskType;
use serde::{Deserialize, Serialize};

/// Shared retry policy for the batcher, queuer, and cleaner loops, named
/// after the reference `tasker_shared::config::tasker::BackoffConfig`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_millis: u64,
    pub max_millis: u64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_millis: 200,
            max_millis: 30_000,
            max_attempts: 8,
        }
    }
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_millis)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_millis)
    }

    /// Exponential backoff with no jitter beyond what the caller adds:
    /// `initial * 2^attempt`, capped at `max`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial().saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        scaled.min(self.max())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub dsn: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: "postgres://localhost/dcp".to_string(),
            max_connections: 10,
        }
    }
}

/// Which concrete `MessageBus` the process constructs, plus the
/// `TaskType → topic` routing table the queuer and handlers both consult.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// `"postgres"` (pgmq-backed) or `"memory"` (dev/test only).
    pub provider: String,
    pub routing: HashMap<String, String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        let mut routing = HashMap::new();
        routing.insert(TaskType::List.to_string(), "dcp-list".to_string());
        routing.insert(TaskType::ProcessList.to_string(), "dcp-process-list".to_string());
        routing.insert(TaskType::Copy.to_string(), "dcp-copy".to_string());
        Self {
            provider: "postgres".to_string(),
            routing,
        }
    }
}

impl BusConfig {
    /// The routing table keyed by `TaskType`, dropping any unrecognized
    /// entries a stale config file might still carry.
    pub fn routing_table(&self) -> HashMap<TaskType, String> {
        self.routing
            .iter()
            .filter_map(|(k, v)| k.parse::<TaskType>().ok().map(|t| (t, v.clone())))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    pub flush_interval_millis: u64,
    pub backoff: BackoffConfig,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            flush_interval_millis: 1_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl BatcherConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_millis)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueuerConfig {
    pub batch_size: usize,
    pub poll_interval_millis: u64,
    pub backoff: BackoffConfig,
}

impl Default for QueuerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_interval_millis: 2_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl QueuerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CleanerConfig {
    pub page_size: usize,
    pub poll_interval_millis: u64,
    pub backoff: BackoffConfig,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            poll_interval_millis: 60_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl CleanerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogExportConfig {
    pub batch_size: usize,
    pub poll_interval_millis: u64,
    pub max_no_progress_ticks: u32,
    pub working_space_prefix: String,
}

impl Default for LogExportConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            poll_interval_millis: 60_000,
            max_no_progress_ticks: 60,
            working_space_prefix: "_dcp_working_space".to_string(),
        }
    }
}

impl LogExportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverMode {
    Single,
    RoundRobin,
}

impl Default for ReceiverMode {
    fn default() -> Self {
        ReceiverMode::Single
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub mode: ReceiverMode,
    /// Subscription name used in single-subscription mode.
    pub subscription: String,
    pub job_spec_cache_capacity: usize,
    pub project_discovery_interval_millis: u64,
    pub max_messages_per_poll: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            mode: ReceiverMode::Single,
            subscription: "dcp-completions".to_string(),
            job_spec_cache_capacity: 1_000,
            project_discovery_interval_millis: 30_000,
            max_messages_per_poll: 20,
        }
    }
}

impl ReceiverConfig {
    pub fn project_discovery_interval(&self) -> Duration {
        Duration::from_millis(self.project_discovery_interval_millis)
    }
}

/// Top-level engine configuration (§4.9). `project_id` has no default: a
/// config missing it fails to load rather than silently running against an
/// empty project.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DcpConfig {
    pub project_id: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub batcher: BatcherConfig,
    #[serde(default)]
    pub queuer: QueuerConfig,
    #[serde(default)]
    pub cleaner: CleanerConfig,
    #[serde(default)]
    pub log_export: LogExportConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
}

impl DcpConfig {
    /// Load `base.toml`, an optional `<env>.toml` override, then
    /// `DCP_`-prefixed environment variables (`DCP_DATABASE__DSN`, …),
    /// matching the reference's layered-source pattern.
    pub fn load(config_dir: &str, env: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("{config_dir}/base")).required(false))
            .add_source(
                config::File::with_name(&format!("{config_dir}/{env}")).required(false),
            )
            .add_source(config::Environment::with_prefix("DCP").separator("__"))
            .build()?;
        settings.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_grows_exponentially_and_caps() {
        let backoff = BackoffConfig {
            initial_millis: 100,
            max_millis: 1_000,
            max_attempts: 10,
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(10), backoff.max());
    }

    #[test]
    fn bus_config_default_routes_every_known_task_type() {
        let bus = BusConfig::default();
        let table = bus.routing_table();
        assert_eq!(table.len(), 3);
        assert!(table.contains_key(&TaskType::List));
        assert!(table.contains_key(&TaskType::ProcessList));
        assert!(table.contains_key(&TaskType::Copy));
    }

    #[test]
    fn loading_without_project_id_fails() {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&serde_json::json!({})).unwrap())
            .build()
            .unwrap();
        let result: Result<DcpConfig, _> = settings.try_deserialize();
        assert!(result.is_err());
    }
}
