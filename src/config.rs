//! Stage configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/vxm.toml`)
//! 2. environment variables prefixed with `VXM_`, sections separated by `__`
//!    (e.g. `VXM_CONNECTION__PORT=/dev/ttyUSB1`)
//!
//! Every field has a default, so an empty file describes the stock rig:
//!
//! ```toml
//! [application]
//! log_level = "info"
//! log_format = "pretty"
//!
//! [connection]
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! read_timeout = "100ms"
//!
//! [motion]
//! default_velocity = 2000
//! settle_delay = "1s"
//! poll_interval = "100ms"
//! # poll_max_attempts = 600
//! # poll_deadline = "2min"
//! ```

use crate::axis::{PollPolicy, DEFAULT_POLL_INTERVAL, DEFAULT_READ_TIMEOUT};
use crate::error::{StageError, StageResult};
use crate::logging::OutputFormat;
use crate::protocol::{Velocity, DEFAULT_VELOCITY, MAX_VELOCITY};
use crate::stage::{StageSettings, DEFAULT_SETTLE_DELAY};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/vxm.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "VXM_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Logging settings
    pub application: ApplicationConfig,
    /// Serial link settings
    pub connection: ConnectionConfig,
    /// Motion timing settings
    pub motion: MotionConfig,
}

/// Application-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: OutputFormat::Pretty,
        }
    }
}

/// Serial link configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM4")
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Per-read timeout
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Motion configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Velocity applied to every axis at start-up, steps/second
    pub default_velocity: u32,
    /// Pause between homing consecutive axes
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Delay between readiness polls
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Give up waiting for readiness after this many polls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_max_attempts: Option<u32>,
    /// Give up waiting for readiness after this long
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub poll_deadline: Option<Duration>,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            default_velocity: DEFAULT_VELOCITY,
            settle_delay: DEFAULT_SETTLE_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_max_attempts: None,
            poll_deadline: None,
        }
    }
}

impl StageConfig {
    /// Load from `config/vxm.toml` and the environment.
    pub fn load() -> StageResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> StageResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> StageResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(StageError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.connection.port.trim().is_empty() {
            return Err(StageError::Configuration(
                "connection.port must not be empty".into(),
            ));
        }

        if self.connection.baud_rate == 0 {
            return Err(StageError::Configuration(
                "connection.baud_rate must be positive".into(),
            ));
        }

        if self.connection.read_timeout.is_zero() {
            return Err(StageError::Configuration(
                "connection.read_timeout must be positive".into(),
            ));
        }

        if self.motion.default_velocity == 0 || self.motion.default_velocity > MAX_VELOCITY {
            return Err(StageError::Configuration(format!(
                "Invalid motion.default_velocity {}. Must be 1-{}",
                self.motion.default_velocity, MAX_VELOCITY
            )));
        }

        if self.motion.poll_interval.is_zero() {
            return Err(StageError::Configuration(
                "motion.poll_interval must be positive".into(),
            ));
        }

        if self.motion.poll_max_attempts == Some(0) {
            return Err(StageError::Configuration(
                "motion.poll_max_attempts must be at least 1".into(),
            ));
        }

        if self.motion.poll_deadline.is_some_and(|d| d.is_zero()) {
            return Err(StageError::Configuration(
                "motion.poll_deadline must be positive".into(),
            ));
        }

        Ok(())
    }

    /// Readiness policy described by the motion section.
    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.motion.poll_interval,
            max_attempts: self.motion.poll_max_attempts,
            deadline: self.motion.poll_deadline,
        }
    }

    /// Runtime settings for a [`crate::stage::StageController`].
    pub fn to_settings(&self) -> StageResult<StageSettings> {
        Ok(StageSettings {
            read_timeout: self.connection.read_timeout,
            settle_delay: self.motion.settle_delay,
            poll: self.poll_policy(),
            default_velocity: Velocity::new(i64::from(self.motion.default_velocity))?,
        })
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> StageResult<String> {
        toml::to_string_pretty(self).map_err(|e| StageError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = StageConfig::default();
        assert!(config.validate().is_ok());

        let settings = config.to_settings().unwrap();
        assert_eq!(settings.read_timeout, Duration::from_millis(100));
        assert_eq!(settings.settle_delay, Duration::from_secs(1));
        assert_eq!(settings.poll, PollPolicy::default());
        assert_eq!(settings.default_velocity.get(), 2000);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = StageConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(StageError::Configuration(_))));
    }

    #[test]
    fn test_default_velocity_range() {
        let mut config = StageConfig::default();
        config.motion.default_velocity = 6001;
        assert!(config.validate().is_err());

        config.motion.default_velocity = 0;
        assert!(config.validate().is_err());

        config.motion.default_velocity = 6000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timings_rejected() {
        let mut config = StageConfig::default();
        config.connection.read_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = StageConfig::default();
        config.motion.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = StageConfig::default();
        config.motion.poll_max_attempts = Some(0);
        assert!(config.validate().is_err());

        let mut config = StageConfig::default();
        config.motion.poll_deadline = Some(Duration::ZERO);
        assert!(matches!(config.validate(), Err(StageError::Configuration(_))));
    }

    #[test]
    fn bounded_poll_policy_from_config() {
        let mut config = StageConfig::default();
        config.motion.poll_max_attempts = Some(50);
        config.motion.poll_deadline = Some(Duration::from_secs(30));

        let policy = config.poll_policy();
        assert_eq!(policy.max_attempts, Some(50));
        assert_eq!(policy.deadline, Some(Duration::from_secs(30)));
    }

    #[test]
    fn toml_rendering_parses_back() {
        let config = StageConfig::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("read_timeout = \"100ms\""));

        let parsed: StageConfig = Figment::from(Toml::string(&rendered)).extract().unwrap();
        assert_eq!(parsed, config);
    }
}
