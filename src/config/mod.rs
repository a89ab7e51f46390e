//! Configuration for the client proxy, the worker and the spawner.
//!
//! Every value has a built-in default and an environment override. A `.env`
//! file in the working directory is loaded via dotenvy before resolution;
//! it never overwrites variables that are already set.

mod helpers;

use std::path::PathBuf;
use std::time::Duration;

pub use helpers::{EnvLookup, process_env};

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env, parse_string_env};
use crate::error::ConfigError;

/// Client-side discovery timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Registry polls before giving up.
    pub attempts: u32,
    /// Sleep between polls.
    pub interval: Duration,
    /// Sleep after spawning a worker, before the first poll.
    pub settle_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            attempts: 8,
            interval: Duration::from_millis(250),
            settle_delay: Duration::from_millis(250),
        }
    }
}

impl DiscoveryConfig {
    pub fn resolve_with(env: EnvLookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let attempts = parse_optional_env(env, "ROOTSERVICE_DISCOVERY_ATTEMPTS", defaults.attempts)?;
        if attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ROOTSERVICE_DISCOVERY_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            attempts,
            interval: Duration::from_millis(parse_optional_env(
                env,
                "ROOTSERVICE_DISCOVERY_INTERVAL_MS",
                250u64,
            )?),
            settle_delay: Duration::from_millis(parse_optional_env(
                env,
                "ROOTSERVICE_SETTLE_DELAY_MS",
                250u64,
            )?),
        })
    }

    /// Upper bound on the polling window, settle delay excluded.
    pub fn window(&self) -> Duration {
        self.interval * self.attempts
    }
}

/// Worker-side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Delay between the winning `die()` and the shutdown signal, so the
    /// reply to the call that triggered it is delivered first.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_millis(100),
        }
    }
}

impl WorkerConfig {
    pub fn resolve_with(env: EnvLookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            shutdown_grace: Duration::from_millis(parse_optional_env(
                env,
                "ROOTSERVICE_SHUTDOWN_GRACE_MS",
                100u64,
            )?),
        })
    }
}

/// How [`CommandSpawner`](crate::spawner::CommandSpawner) launches workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnerConfig {
    /// Program that switches identity, e.g. `sudo`.
    pub escalation_program: String,
    /// Pass `-n` so the escalation program never prompts.
    pub non_interactive: bool,
    /// Worker binary. `None` means the current executable.
    pub worker_executable: Option<PathBuf>,
    /// Subcommand that enters the worker.
    pub worker_subcommand: String,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        Self {
            escalation_program: "sudo".to_string(),
            non_interactive: true,
            worker_executable: None,
            worker_subcommand: "worker".to_string(),
        }
    }
}

impl SpawnerConfig {
    pub fn resolve_with(env: EnvLookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            escalation_program: parse_string_env(env, "ROOTSERVICE_ESCALATION_PROGRAM", "sudo")?,
            non_interactive: parse_bool_env(env, "ROOTSERVICE_ESCALATION_NON_INTERACTIVE", true)?,
            worker_executable: optional_env(env, "ROOTSERVICE_WORKER_EXECUTABLE")?.map(PathBuf::from),
            worker_subcommand: parse_string_env(env, "ROOTSERVICE_WORKER_SUBCOMMAND", "worker")?,
        })
    }
}

/// Everything a host needs to run proxied services.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub discovery: DiscoveryConfig,
    pub worker: WorkerConfig,
    pub spawner: SpawnerConfig,
}

impl ProxyConfig {
    /// Load `.env`, then resolve from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::resolve_with(&process_env)
    }

    pub fn resolve_with(env: EnvLookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            discovery: DiscoveryConfig::resolve_with(env)?,
            worker: WorkerConfig::resolve_with(env)?,
            spawner: SpawnerConfig::resolve_with(env)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn resolve(pairs: &[(&str, &str)]) -> Result<ProxyConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ProxyConfig::resolve_with(&move |k: &str| map.get(k).cloned())
    }

    #[test]
    fn test_defaults_when_env_empty() {
        let config = resolve(&[]).unwrap();
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.discovery.attempts, 8);
        assert_eq!(config.discovery.window(), Duration::from_secs(2));
        assert_eq!(config.worker.shutdown_grace, Duration::from_millis(100));
        assert_eq!(config.spawner.escalation_program, "sudo");
        assert!(config.spawner.non_interactive);
        assert!(config.spawner.worker_executable.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = resolve(&[
            ("ROOTSERVICE_DISCOVERY_ATTEMPTS", "3"),
            ("ROOTSERVICE_DISCOVERY_INTERVAL_MS", "10"),
            ("ROOTSERVICE_SETTLE_DELAY_MS", "0"),
            ("ROOTSERVICE_SHUTDOWN_GRACE_MS", "5"),
            ("ROOTSERVICE_ESCALATION_PROGRAM", "doas"),
            ("ROOTSERVICE_ESCALATION_NON_INTERACTIVE", "false"),
            ("ROOTSERVICE_WORKER_EXECUTABLE", "/usr/libexec/rootservice"),
        ])
        .unwrap();
        assert_eq!(config.discovery.attempts, 3);
        assert_eq!(config.discovery.interval, Duration::from_millis(10));
        assert_eq!(config.discovery.settle_delay, Duration::ZERO);
        assert_eq!(config.worker.shutdown_grace, Duration::from_millis(5));
        assert_eq!(config.spawner.escalation_program, "doas");
        assert!(!config.spawner.non_interactive);
        assert_eq!(
            config.spawner.worker_executable,
            Some(PathBuf::from("/usr/libexec/rootservice"))
        );
        assert_eq!(config.spawner.worker_subcommand, "worker");
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let err = resolve(&[("ROOTSERVICE_DISCOVERY_ATTEMPTS", "0")]).unwrap_err();
        assert!(err.to_string().contains("ROOTSERVICE_DISCOVERY_ATTEMPTS"));
    }

    #[test]
    fn test_malformed_number_rejected() {
        assert!(resolve(&[("ROOTSERVICE_SHUTDOWN_GRACE_MS", "soon")]).is_err());
    }
}
