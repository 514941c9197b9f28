//! Runtime configuration surface (spec §6), following the teacher's
//! CLI-arg > env-var > default precedence (`parse_database_url`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPolicyKind {
    Fifo,
    Locality,
    Data,
    FullGraph,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub policy: SchedulerPolicyKind,
    pub max_retries: u32,
    pub cancel_timeout_ms: u64,
    pub starvation_wait_ms: u64,
    pub starvation_bump_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: SchedulerPolicyKind::Fifo,
            max_retries: 3,
            cancel_timeout_ms: 30_000,
            starvation_wait_ms: 60_000,
            starvation_bump_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub parallelism: usize,
    pub allow_non_atomic_move: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            parallelism: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4).min(8),
            allow_non_atomic_move: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the PSCO backend's config file; empty disables PSCO support.
    pub config: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub transfer: TransferConfig,
    pub storage: StorageConfig,
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            transfer: TransferConfig::default(),
            storage: StorageConfig::default(),
            bind_addr: "0.0.0.0:50051".into(),
        }
    }
}

impl RuntimeConfig {
    /// Loads from an optional TOML file, then overlays `RUNTIME_*`
    /// environment variables, matching the precedence the teacher's
    /// `parse_database_url` establishes (CLI arg > env var > default);
    /// here the "CLI arg" is the explicit `path` argument itself.
    pub fn load(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)?;
                toml::from_str(&text)?
            }
            None => RuntimeConfig::default(),
        };

        if let Ok(addr) = std::env::var("RUNTIME_BIND_ADDR") {
            cfg.bind_addr = addr;
        }
        if let Ok(policy) = std::env::var("RUNTIME_SCHEDULER_POLICY") {
            cfg.scheduler.policy = match policy.as_str() {
                "fifo" => SchedulerPolicyKind::Fifo,
                "locality" => SchedulerPolicyKind::Locality,
                "data" => SchedulerPolicyKind::Data,
                "full_graph" => SchedulerPolicyKind::FullGraph,
                other => {
                    tracing::warn!(%other, "unknown RUNTIME_SCHEDULER_POLICY, keeping configured value");
                    cfg.scheduler.policy
                }
            };
        }
        if let Ok(retries) = std::env::var("RUNTIME_SCHEDULER_MAX_RETRIES") {
            if let Ok(n) = retries.parse() {
                cfg.scheduler.max_retries = n;
            }
        }
        if let Ok(storage_config) = std::env::var("RUNTIME_STORAGE_CONFIG") {
            cfg.storage.config = Some(PathBuf::from(storage_config));
        }

        Ok(cfg)
    }
}

/// Mirrors the teacher's `parse_database_url`: CLI `--bind <addr>` wins
/// over `RUNTIME_BIND_ADDR`, which wins over the config file default.
pub fn parse_bind_addr_arg() -> Option<String> {
    let args: Vec<String> = std::env::args().collect();
    args.iter().position(|a| a == "--bind").and_then(|i| args.get(i + 1)).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.scheduler.max_retries, 3);
        assert_eq!(cfg.scheduler.cancel_timeout_ms, 30_000);
        assert_eq!(cfg.scheduler.starvation_wait_ms, 60_000);
        assert_eq!(cfg.scheduler.starvation_bump_ms, 30_000);
        assert!(cfg.transfer.allow_non_atomic_move);
        assert!(cfg.storage.config.is_none());
    }

    #[test]
    fn load_with_no_file_is_defaults() {
        let cfg = RuntimeConfig::load(None).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:50051");
    }
}
