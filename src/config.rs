use crate::streaming::reducer::{ReductionMode, FULL_SCALE_16BIT};
use crate::streaming::sink::SerialEncoding;
use crate::streaming::types::StreamError;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Pipeline configuration, fixed once the pipeline is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Poller interval in milliseconds
    pub cadence_ms: u64,
    /// Amplitude mapped to intensity 1.0 (32768 = 16-bit full scale, 30000 also common)
    pub clamp_ceiling: f32,
    /// Frame reduction rule
    pub mode: ReductionMode,
    /// Bound of the queue between the source pump and the drain task
    pub queue_capacity: usize,
    /// How levels are written to the serial port
    pub serial_encoding: SerialEncoding,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cadence_ms: 50,
            clamp_ceiling: FULL_SCALE_16BIT,
            mode: ReductionMode::AbsAverage,
            queue_capacity: 100,
            serial_encoding: SerialEncoding::Line,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables (and a `.env` file if present)
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            cadence_ms: parse_var(&lookup, "INTENSITY_CADENCE_MS")?.unwrap_or(defaults.cadence_ms),
            clamp_ceiling: parse_var(&lookup, "INTENSITY_CLAMP_CEILING")?
                .unwrap_or(defaults.clamp_ceiling),
            mode: parse_var(&lookup, "INTENSITY_MODE")?.unwrap_or(defaults.mode),
            queue_capacity: parse_var(&lookup, "INTENSITY_QUEUE_CAPACITY")?
                .unwrap_or(defaults.queue_capacity),
            serial_encoding: parse_var(&lookup, "INTENSITY_SERIAL_ENCODING")?
                .unwrap_or(defaults.serial_encoding),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cadence_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "cadence_ms must be at least 1".to_string(),
            ));
        }
        if !self.clamp_ceiling.is_finite() || self.clamp_ceiling <= 0.0 {
            return Err(ConfigError::InvalidValue(format!(
                "clamp_ceiling must be a positive number, got {}",
                self.clamp_ceiling
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidEnvVar {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        _ => Ok(None),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {reason}")]
    InvalidEnvVar { key: String, reason: String },
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl From<ConfigError> for StreamError {
    fn from(e: ConfigError) -> Self {
        StreamError::InvalidConfig(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.cadence(), Duration::from_millis(50));
        assert_eq!(config.clamp_ceiling, 32768.0);
        assert_eq!(config.mode, ReductionMode::AbsAverage);
    }

    #[test]
    fn test_overrides() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("INTENSITY_CADENCE_MS", "20"),
            ("INTENSITY_CLAMP_CEILING", "30000"),
            ("INTENSITY_MODE", "rms"),
            ("INTENSITY_QUEUE_CAPACITY", "16"),
            ("INTENSITY_SERIAL_ENCODING", "byte"),
        ]))
        .unwrap();

        assert_eq!(config.cadence_ms, 20);
        assert_eq!(config.clamp_ceiling, 30000.0);
        assert_eq!(config.mode, ReductionMode::Rms);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.serial_encoding, SerialEncoding::Byte);
    }

    #[test]
    fn test_bad_values_are_reported() {
        let err = PipelineConfig::from_lookup(lookup(&[("INTENSITY_CADENCE_MS", "fast")]))
            .unwrap_err();
        assert!(err.to_string().contains("INTENSITY_CADENCE_MS"));

        assert!(PipelineConfig::from_lookup(lookup(&[("INTENSITY_CADENCE_MS", "0")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("INTENSITY_CLAMP_CEILING", "-1")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("INTENSITY_CLAMP_CEILING", "NaN")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[("INTENSITY_MODE", "loudest")])).is_err());
    }

    #[test]
    fn test_unparseable_number_names_key_and_reason() {
        let err = PipelineConfig::from_lookup(lookup(&[("INTENSITY_QUEUE_CAPACITY", " many ")]))
            .unwrap_err();
        match err {
            ConfigError::InvalidEnvVar { key, reason } => {
                assert_eq!(key, "INTENSITY_QUEUE_CAPACITY");
                assert!(reason.contains("invalid digit"), "reason: {}", reason);
            }
            other => panic!("unexpected error: {}", other),
        }

        let config =
            PipelineConfig::from_lookup(lookup(&[("INTENSITY_QUEUE_CAPACITY", " 42 ")])).unwrap();
        assert_eq!(config.queue_capacity, 42);
    }

    #[test]
    fn test_partial_json() {
        let config: PipelineConfig = serde_json::from_str(r#"{"cadence_ms": 100}"#).unwrap();
        assert_eq!(config.cadence_ms, 100);
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.mode, ReductionMode::AbsAverage);
    }
}
