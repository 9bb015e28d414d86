//! Configuration types.
//!
//! Everything is read from `RELAY_*` environment variables. Operator values
//! below a safety floor are raised to the floor with a warning.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use tracing::warn;

use crate::error::ConfigError;

/// Minimum failed attempts before a message stops being retried.
pub const MIN_MAX_ERROR_COUNT: u32 = 3;
/// Minimum age in days before a message may be archived.
pub const MIN_MAX_DAYS_TO_LIVE: u32 = 7;
/// Minimum pause between sweeps.
pub const MIN_THROTTLE: Duration = Duration::from_secs(5);
/// Minimum startup delay for the processing-only loop.
pub const MIN_PROCESS_ONLY_STARTUP_DELAY: Duration = Duration::from_secs(1);
/// Minimum startup delay for the full process/retry/archive loop.
pub const MIN_PIPELINE_STARTUP_DELAY: Duration = Duration::from_secs(5);

/// Which sweep the scheduling loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopVariant {
    /// Dispatch ready-to-process messages only.
    ProcessOnly,
    /// Process, retry, then archive.
    Pipeline,
}

impl LoopVariant {
    pub fn min_startup_delay(&self) -> Duration {
        match self {
            Self::ProcessOnly => MIN_PROCESS_ONLY_STARTUP_DELAY,
            Self::Pipeline => MIN_PIPELINE_STARTUP_DELAY,
        }
    }
}

/// Dispatch policy used by the director.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// A `Failed` message is retried while `error_count` is below this.
    pub max_error_count: u32,
    /// Messages older than this many days are archived.
    pub max_days_to_live: u32,
    /// Upper bound on dispatches running at once within one phase.
    pub max_concurrent_dispatches: usize,
    /// TTL of the per-channel provider list cache. Zero disables caching.
    pub provider_cache_ttl: Duration,
    /// Audit user stamped on pipeline writes.
    pub system_user: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_error_count: 5,
            max_days_to_live: 30,
            max_concurrent_dispatches: 1,
            provider_cache_ttl: Duration::from_secs(60),
            system_user: "relay-pipeline".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Raise operator values to their floors.
    pub fn with_floors(mut self) -> Self {
        if self.max_error_count < MIN_MAX_ERROR_COUNT {
            warn!(
                configured = self.max_error_count,
                floor = MIN_MAX_ERROR_COUNT,
                "max_error_count below floor, using floor"
            );
            self.max_error_count = MIN_MAX_ERROR_COUNT;
        }
        if self.max_days_to_live < MIN_MAX_DAYS_TO_LIVE {
            warn!(
                configured = self.max_days_to_live,
                floor = MIN_MAX_DAYS_TO_LIVE,
                "max_days_to_live below floor, using floor"
            );
            self.max_days_to_live = MIN_MAX_DAYS_TO_LIVE;
        }
        self.max_concurrent_dispatches = self.max_concurrent_dispatches.max(1);
        self
    }
}

/// Timing of the scheduling loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub variant: LoopVariant,
    pub startup_delay: Duration,
    pub throttle: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            variant: LoopVariant::Pipeline,
            startup_delay: Duration::from_secs(10),
            throttle: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Raise the startup delay and throttle to their floors.
    pub fn with_floors(mut self) -> Self {
        let min_delay = self.variant.min_startup_delay();
        if self.startup_delay < min_delay {
            warn!(
                configured_ms = self.startup_delay.as_millis() as u64,
                floor_ms = min_delay.as_millis() as u64,
                "startup delay below floor, using floor"
            );
            self.startup_delay = min_delay;
        }
        if self.throttle < MIN_THROTTLE {
            warn!(
                configured_ms = self.throttle.as_millis() as u64,
                floor_ms = MIN_THROTTLE.as_millis() as u64,
                "throttle below floor, using floor"
            );
            self.throttle = MIN_THROTTLE;
        }
        self
    }
}

/// Full relay configuration.
#[derive(Debug)]
pub struct RelayConfig {
    pub db_path: PathBuf,
    /// Base64 AES-256 key for provider parameter encryption.
    pub encryption_key: Option<SecretString>,
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl RelayConfig {
    /// Build config from environment variables, applying floors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup (environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pipeline_defaults = PipelineConfig::default();
        let scheduler_defaults = SchedulerConfig::default();

        let process_only: bool = parse_or(&lookup, "RELAY_PROCESS_ONLY", false)?;

        let pipeline = PipelineConfig {
            max_error_count: parse_or(
                &lookup,
                "RELAY_MAX_ERROR_COUNT",
                pipeline_defaults.max_error_count,
            )?,
            max_days_to_live: parse_or(
                &lookup,
                "RELAY_MAX_DAYS_TO_LIVE",
                pipeline_defaults.max_days_to_live,
            )?,
            max_concurrent_dispatches: parse_or(
                &lookup,
                "RELAY_MAX_CONCURRENT_DISPATCHES",
                pipeline_defaults.max_concurrent_dispatches,
            )?,
            provider_cache_ttl: Duration::from_secs(parse_or(
                &lookup,
                "RELAY_PROVIDER_CACHE_TTL_SECS",
                pipeline_defaults.provider_cache_ttl.as_secs(),
            )?),
            system_user: lookup("RELAY_SYSTEM_USER")
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(pipeline_defaults.system_user),
        }
        .with_floors();

        let scheduler = SchedulerConfig {
            variant: if process_only {
                LoopVariant::ProcessOnly
            } else {
                LoopVariant::Pipeline
            },
            startup_delay: Duration::from_secs(parse_or(
                &lookup,
                "RELAY_STARTUP_DELAY_SECS",
                scheduler_defaults.startup_delay.as_secs(),
            )?),
            throttle: Duration::from_secs(parse_or(
                &lookup,
                "RELAY_THROTTLE_SECS",
                scheduler_defaults.throttle.as_secs(),
            )?),
        }
        .with_floors();

        Ok(Self {
            db_path: lookup("RELAY_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/relay.db")),
            encryption_key: lookup("RELAY_ENCRYPTION_KEY").map(SecretString::from),
            pipeline,
            scheduler,
            log_dir: lookup("RELAY_LOG_DIR").map(PathBuf::from),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<RelayConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.pipeline.max_error_count, 5);
        assert_eq!(cfg.pipeline.max_days_to_live, 30);
        assert_eq!(cfg.pipeline.max_concurrent_dispatches, 1);
        assert_eq!(cfg.scheduler.variant, LoopVariant::Pipeline);
        assert_eq!(cfg.scheduler.startup_delay, Duration::from_secs(10));
        assert_eq!(cfg.scheduler.throttle, Duration::from_secs(30));
        assert_eq!(cfg.db_path, PathBuf::from("./data/relay.db"));
        assert!(cfg.encryption_key.is_none());
    }

    #[test]
    fn floors_are_enforced() {
        let cfg = config_from(&[
            ("RELAY_MAX_ERROR_COUNT", "1"),
            ("RELAY_MAX_DAYS_TO_LIVE", "2"),
            ("RELAY_STARTUP_DELAY_SECS", "0"),
            ("RELAY_THROTTLE_SECS", "1"),
            ("RELAY_MAX_CONCURRENT_DISPATCHES", "0"),
        ])
        .unwrap();
        assert_eq!(cfg.pipeline.max_error_count, MIN_MAX_ERROR_COUNT);
        assert_eq!(cfg.pipeline.max_days_to_live, MIN_MAX_DAYS_TO_LIVE);
        assert_eq!(cfg.pipeline.max_concurrent_dispatches, 1);
        assert_eq!(cfg.scheduler.startup_delay, MIN_PIPELINE_STARTUP_DELAY);
        assert_eq!(cfg.scheduler.throttle, MIN_THROTTLE);
    }

    #[test]
    fn process_only_variant_has_lower_startup_floor() {
        let cfg = config_from(&[
            ("RELAY_PROCESS_ONLY", "true"),
            ("RELAY_STARTUP_DELAY_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(cfg.scheduler.variant, LoopVariant::ProcessOnly);
        assert_eq!(cfg.scheduler.startup_delay, MIN_PROCESS_ONLY_STARTUP_DELAY);
    }

    #[test]
    fn values_above_floor_are_kept() {
        let cfg = config_from(&[
            ("RELAY_MAX_ERROR_COUNT", "10"),
            ("RELAY_MAX_DAYS_TO_LIVE", "90"),
            ("RELAY_THROTTLE_SECS", "12"),
            ("RELAY_SYSTEM_USER", " ops "),
        ])
        .unwrap();
        assert_eq!(cfg.pipeline.max_error_count, 10);
        assert_eq!(cfg.pipeline.max_days_to_live, 90);
        assert_eq!(cfg.scheduler.throttle, Duration::from_secs(12));
        assert_eq!(cfg.pipeline.system_user, "ops");
    }

    #[test]
    fn unparsable_value_is_an_error() {
        let err = config_from(&[("RELAY_THROTTLE_SECS", "soon")]).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "RELAY_THROTTLE_SECS"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
