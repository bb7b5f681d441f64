use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::errors::{DeployError, Result};

/// Deployment tuning parameters shared by every graph a scheduler builds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Delay between two readiness checks of the same node
    pub poll_interval: Duration,
    /// Maximum time a node may spend in readiness polling (None = unbounded)
    pub readiness_timeout: Option<Duration>,
    /// Maximum number of `create` calls in flight at once
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
}

fn default_max_parallel_nodes() -> usize {
    16
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            readiness_timeout: Some(Duration::from_secs(600)), // 10 minutes
            max_parallel_nodes: default_max_parallel_nodes(),
        }
    }
}

impl DeployConfig {
    /// Create a new builder for DeployConfig
    pub fn builder() -> DeployConfigBuilder {
        DeployConfigBuilder::new()
    }

    /// Fast polling, short deadlines
    pub fn development() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            readiness_timeout: Some(Duration::from_secs(5)),
            max_parallel_nodes: 4,
        }
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(DeployError::configuration_field(
                "poll_interval must be greater than 0",
                "poll_interval",
            ));
        }

        if let Some(timeout) = self.readiness_timeout {
            if timeout < self.poll_interval {
                return Err(DeployError::configuration_field(
                    "readiness_timeout cannot be shorter than poll_interval",
                    "readiness_timeout",
                ));
            }
        }

        if self.max_parallel_nodes == 0 {
            return Err(DeployError::configuration_field(
                "max_parallel_nodes must be greater than 0",
                "max_parallel_nodes",
            ));
        }

        Ok(())
    }
}

/// Builder for DeployConfig
pub struct DeployConfigBuilder {
    config: DeployConfig,
}

impl DeployConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DeployConfig::default(),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn readiness_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.readiness_timeout = timeout;
        self
    }

    pub fn max_parallel_nodes(mut self, count: usize) -> Self {
        self.config.max_parallel_nodes = count;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<DeployConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for DeployConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        assert!(DeployConfig::default().validate().is_ok());
        assert!(DeployConfig::development().validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = DeployConfig::default();

        config.max_parallel_nodes = 0;
        assert!(config.validate().is_err());
        config.max_parallel_nodes = 4;

        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.poll_interval = Duration::from_secs(5);

        config.readiness_timeout = Some(Duration::from_secs(1));
        assert!(config.validate().is_err());

        config.readiness_timeout = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = DeployConfig::builder()
            .poll_interval(Duration::from_millis(250))
            .readiness_timeout(Some(Duration::from_secs(30)))
            .max_parallel_nodes(2)
            .build()
            .unwrap();

        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.readiness_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.max_parallel_nodes, 2);

        assert!(DeployConfig::builder().max_parallel_nodes(0).build().is_err());
    }
}
