//! Observability configuration loaded from the environment.
//!
//! - `RUST_LOG`: `EnvFilter` directives (default `info`)
//! - `BISTRO_LOG_FORMAT`: `json` (default) or `pretty`

use std::str::FromStr;

use thiserror::Error;

pub const FILTER_VAR: &str = "RUST_LOG";
pub const FORMAT_VAR: &str = "BISTRO_LOG_FORMAT";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: unknown log format '{value}' (expected 'json' or 'pretty')")]
    InvalidLogFormat { var: &'static str, value: String },
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(ConfigError::InvalidLogFormat {
                var: FORMAT_VAR,
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservabilityConfig {
    pub filter: String,
    pub format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

impl ObservabilityConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source; unset or blank variables take
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let set = |var: &str| lookup(var).filter(|v: &String| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            filter: set(FILTER_VAR).unwrap_or(defaults.filter),
            format: match set(FORMAT_VAR) {
                Some(value) => value.parse()?,
                None => defaults.format,
            },
        })
    }
}
