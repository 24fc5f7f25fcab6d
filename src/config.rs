use std::{fs, num::NonZero, path::Path};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error reading config file")]
    Io(#[from] std::io::Error),

    #[error("Error parsing config from toml")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid value for '{0}': {1}")]
    Invalid(&'static str, String),
}

/// Workload of the fan-in demo: `producers` tasks each put `items_per_producer`
/// items on a shared channel, and every item is resolved under a semaphore
/// admitting `concurrency` resolvers at a time.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FanInConfig {
    pub producers: usize,
    pub items_per_producer: usize,
    pub concurrency: usize,

    #[serde(default = "default_resolve_delay_ms")]
    pub resolve_delay_ms: u64,
}

fn default_resolve_delay_ms() -> u64 {
    100
}

impl FanInConfig {
    pub fn from_toml(toml: &str) -> Result<Self, Error> {
        let config: FanInConfig = toml::from_str(toml)?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        Self::from_toml(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.producers == 0 {
            return Err(Error::Invalid(
                "producers",
                "at least one producer is required".to_string(),
            ));
        }

        self.concurrency()?;
        self.total_items()?;

        Ok(())
    }

    pub fn concurrency(&self) -> Result<NonZero<usize>, Error> {
        NonZero::new(self.concurrency).ok_or_else(|| {
            Error::Invalid("concurrency", "must be greater than zero".to_string())
        })
    }

    pub fn total_items(&self) -> Result<usize, Error> {
        self.producers
            .checked_mul(self.items_per_producer)
            .ok_or_else(|| {
                Error::Invalid(
                    "items_per_producer",
                    format!("overflows when multiplied by {} producer(s)", self.producers),
                )
            })
    }
}
