//! Bridge core configuration
//!
//! Loaded from TOML or built in code. Every field has a default so partial
//! files are accepted.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Logging section of the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level name (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON formatted records
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Configuration for a [`BridgingCore`](crate::context::BridgingCore)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Energy a talker must exceed the current video source's running
    /// average by before it is promoted
    pub talker_hysteresis_margin: u32,
    /// Divisor of the running talker energy average
    pub talker_energy_smoothing: u32,
    /// Inter-digit timeout while collecting a DTMF feature sequence
    pub feature_digit_timeout_ms: u64,
    /// Longest DTMF feature sequence collected before giving up
    pub max_feature_digits: usize,
    /// Internal sample rate hint for new bridges, 0 lets the technology decide
    pub default_internal_sample_rate: u32,
    /// Mixing interval hint for new bridges, 0 lets the technology decide
    pub default_mixing_interval_ms: u32,
    /// Queue depth above which a bridge channel logs a warning
    pub channel_queue_capacity: usize,
    pub logging: LoggingSection,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            talker_hysteresis_margin: 200,
            talker_energy_smoothing: 4,
            feature_digit_timeout_ms: 3000,
            max_feature_digits: 11,
            default_internal_sample_rate: 0,
            default_mixing_interval_ms: 0,
            channel_queue_capacity: 1024,
            logging: LoggingSection::default(),
        }
    }
}

impl BridgeConfig {
    /// Parse a configuration from TOML text and validate it
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: BridgeConfig =
            toml::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| BridgeError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.talker_energy_smoothing == 0 {
            return Err(BridgeError::Config(
                "talker_energy_smoothing must be at least 1".to_string(),
            ));
        }
        if self.max_feature_digits == 0 {
            return Err(BridgeError::Config(
                "max_feature_digits must be at least 1".to_string(),
            ));
        }
        if self.feature_digit_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "feature_digit_timeout_ms must be non-zero".to_string(),
            ));
        }
        crate::logging::parse_log_level(&self.logging.level)?;
        Ok(())
    }

    pub fn feature_digit_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.feature_digit_timeout_ms)
    }

    pub fn with_talker_hysteresis_margin(mut self, margin: u32) -> Self {
        self.talker_hysteresis_margin = margin;
        self
    }

    pub fn with_feature_digit_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.feature_digit_timeout_ms = timeout_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
            talker_hysteresis_margin = 50

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.talker_hysteresis_margin, 50);
        assert_eq!(config.feature_digit_timeout_ms, 3000);
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = BridgeConfig::from_toml_str("talker_energy_smoothing = 0").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));

        let err = BridgeConfig::from_toml_str("[logging]\nlevel = \"loud\"").unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_round_trip_through_file() {
        let config = BridgeConfig::default().with_talker_hysteresis_margin(75);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_toml_string().unwrap().as_bytes())
            .unwrap();

        let loaded = BridgeConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
