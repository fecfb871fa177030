//! Configuration structures.
//!
//! Configuration is loaded from JSON or YAML files; every section falls back
//! to its defaults when absent.

use crate::types::{Error, Result};
use crate::validation::{validate_non_empty, validate_positive};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Walk budget and tracing.
    #[serde(default)]
    pub walker: WalkerConfig,

    /// Crew runtime configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Timer subsystem configuration.
    #[serde(default)]
    pub timers: TimersConfig,
}

impl Config {
    /// Load configuration from a file. `.yaml`/`.yml` files are read as YAML,
    /// everything else as JSON.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Config = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text)?,
            _ => serde_json::from_str(&text)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_non_empty(&self.observability.log_level, "observability.log_level")?;
        validate_positive(self.walker.limit, "walker.limit")?;
        validate_positive(
            u32::try_from(self.runtime.max_concurrent_messages).unwrap_or(u32::MAX),
            "runtime.max_concurrent_messages",
        )?;
        validate_non_empty(&self.runtime.default_node, "runtime.default_node")?;
        validate_positive(
            u32::try_from(self.runtime.spec_cache_capacity).unwrap_or(u32::MAX),
            "runtime.spec_cache_capacity",
        )?;
        if self.runtime.crew_cache_ttl.is_zero() {
            return Err(Error::validation("runtime.crew_cache_ttl must be positive"));
        }
        Ok(())
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Walker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkerConfig {
    /// Maximum strides per walk.
    pub limit: u32,

    /// Record trace events in strides.
    pub traces: bool,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            traces: true,
        }
    }
}

/// Crew runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Width of the worker pool processing queued messages.
    pub max_concurrent_messages: usize,

    /// Crews idle longer than this are dropped from memory and reloaded
    /// from storage on next use.
    #[serde(with = "humantime_serde")]
    pub crew_cache_ttl: Duration,

    /// Node a machine starts at when none is given.
    pub default_node: String,

    /// Log a warning when the work queue grows past this depth.
    pub queue_warn_depth: usize,

    /// Specs loaded from text, URLs or inline bodies kept compiled at once.
    pub spec_cache_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_messages: 64,
            crew_cache_ttl: Duration::from_secs(600),
            default_node: "start".to_string(),
            queue_warn_depth: 10_000,
            spec_cache_capacity: 256,
        }
    }
}

/// Timer subsystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    /// Maximum pending timers per crew.
    pub max_timers_per_crew: usize,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            max_timers_per_crew: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.walker.limit, 100);
        assert_eq!(config.runtime.default_node, "start");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"runtime":{"crew_cache_ttl":"30s"}}"#).unwrap();
        assert_eq!(config.runtime.crew_cache_ttl, Duration::from_secs(30));
        assert_eq!(config.runtime.max_concurrent_messages, 64);
        assert_eq!(config.walker.limit, 100);
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "walker:\n  limit: 7\ntimers:\n  max_timers_per_crew: 3").unwrap();
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.walker.limit, 7);
        assert_eq!(config.timers.max_timers_per_crew, 3);
    }

    #[test]
    fn test_zero_limit_rejected() {
        let mut config = Config::default();
        config.walker.limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_spec_cache_rejected() {
        let mut config = Config::default();
        assert_eq!(config.runtime.spec_cache_capacity, 256);
        config.runtime.spec_cache_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("runtime.spec_cache_capacity"));
    }
}
