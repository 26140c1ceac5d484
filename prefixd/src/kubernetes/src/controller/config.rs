use std::{fs, time::Duration};

use serde::{Deserialize, Serialize};

use super::error::{ConfigError, Error};

pub const DEFAULT_HTTP_PORT: u32 = 8080;
pub const DEFAULT_REQUEUE_INTERVAL: u64 = 30 * 60;
pub const DEFAULT_ALLOCATION_TIMEOUT: u64 = 60;
pub const DEFAULT_BACKOFF_INITIAL: u64 = 1;
pub const DEFAULT_BACKOFF_MAX: u64 = 5 * 60;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub http_port: u32,
    pub requeue_interval: u64,
    /// Seconds a bound allocation may stay pending before its requester gives up on it.
    /// Zero disables the timeout.
    pub allocation_timeout: u64,
    pub backoff_initial: u64,
    pub backoff_max: u64,
    pub enable_cluster_prefix: bool,
}

impl Config {
    pub fn load(file: &str) -> Result<Self, Error> {
        let contents = fs::read_to_string(file)
            .map_err(|e| Error::Config(ConfigError::FailedToRead(file.to_string(), e)))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(ConfigError::FailedToLoad(e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.backoff_initial == 0 {
            return Err(Error::Config(ConfigError::InvalidArgument(
                "backoff_initial must be positive".to_string(),
            )));
        }
        if self.backoff_max < self.backoff_initial {
            return Err(Error::Config(ConfigError::InvalidArgument(
                "backoff_max must not be smaller than backoff_initial".to_string(),
            )));
        }
        Ok(())
    }

    pub fn allocation_timeout(&self) -> Option<Duration> {
        match self.allocation_timeout {
            0 => None,
            t => Some(Duration::from_secs(t)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            allocation_timeout: DEFAULT_ALLOCATION_TIMEOUT,
            backoff_initial: DEFAULT_BACKOFF_INITIAL,
            backoff_max: DEFAULT_BACKOFF_MAX,
            enable_cluster_prefix: true,
        }
    }
}
