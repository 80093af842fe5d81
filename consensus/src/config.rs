//! Chain configuration

use forkledger_core::{CUT_OFF_AGE, MAX_BLOCKS_IN_MEMORY};
use serde::{Deserialize, Serialize};

/// Order in which pending transactions are offered to the batch handler
/// when a block is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Order of admission into the pending pool
    #[default]
    InsertionOrder,
    /// Highest fee first; ties keep admission order
    FeeDescending,
}

/// Configuration for the block tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// How far (in height) a new block may trail the current leader
    pub cut_off_age: u64,
    /// Size of the insertion-order FIFO of indexed blocks
    pub max_blocks_in_memory: usize,
    /// Pending transaction order at block assembly
    pub selection: SelectionPolicy,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            cut_off_age: CUT_OFF_AGE,
            max_blocks_in_memory: MAX_BLOCKS_IN_MEMORY,
            selection: SelectionPolicy::default(),
        }
    }
}

impl ChainConfig {
    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_blocks_in_memory == 0 {
            return Err(ConfigError::InvalidValue(
                "max_blocks_in_memory must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for chain configuration
pub struct ChainConfigBuilder {
    config: ChainConfig,
}

impl ChainConfigBuilder {
    /// Create new builder with default config
    pub fn new() -> Self {
        Self {
            config: ChainConfig::default(),
        }
    }

    pub fn cut_off_age(mut self, age: u64) -> Self {
        self.config.cut_off_age = age;
        self
    }

    pub fn max_blocks_in_memory(mut self, max: usize) -> Self {
        self.config.max_blocks_in_memory = max;
        self
    }

    pub fn selection(mut self, selection: SelectionPolicy) -> Self {
        self.config.selection = selection;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> Result<ChainConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ChainConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChainConfig::default();

        assert_eq!(config.cut_off_age, 12);
        assert_eq!(config.max_blocks_in_memory, 100);
        assert_eq!(config.selection, SelectionPolicy::InsertionOrder);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ChainConfigBuilder::new()
            .cut_off_age(4)
            .max_blocks_in_memory(10)
            .selection(SelectionPolicy::FeeDescending)
            .build()
            .unwrap();

        assert_eq!(config.cut_off_age, 4);
        assert_eq!(config.max_blocks_in_memory, 10);
        assert_eq!(config.selection, SelectionPolicy::FeeDescending);
    }

    #[test]
    fn test_builder_rejects_empty_fifo() {
        let result = ChainConfigBuilder::new().max_blocks_in_memory(0).build();
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_partial_json() {
        let config = ChainConfig::from_json_str(r#"{ "selection": "fee_descending" }"#).unwrap();

        assert_eq!(config.selection, SelectionPolicy::FeeDescending);
        assert_eq!(config.cut_off_age, CUT_OFF_AGE);
        assert_eq!(config.max_blocks_in_memory, MAX_BLOCKS_IN_MEMORY);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            ChainConfig::from_json_str("{ cut_off_age: "),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ChainConfig::from_json_str(r#"{ "max_blocks_in_memory": 0 }"#),
            Err(ConfigError::InvalidValue(_))
        ));
    }
}
