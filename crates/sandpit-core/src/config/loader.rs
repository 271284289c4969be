//! Configuration loader for YAML files and environment overrides

use crate::config::types::*;
use crate::errors::SandpitError;
use std::env;
use std::path::Path;
use tokio::fs;

pub const ENV_POOL_MIN_SIZE: &str = "SANDPIT_POOL_MIN_SIZE";
pub const ENV_POOL_MAX_SIZE: &str = "SANDPIT_POOL_MAX_SIZE";
pub const ENV_POOL_IMAGE: &str = "SANDPIT_POOL_IMAGE";
pub const ENV_NETWORK_ALLOWED: &str = "SANDPIT_NETWORK_ALLOWED";

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<EngineConfig, SandpitError> {
        let path = path.as_ref();

        let content = fs::read_to_string(path).await.map_err(|e| {
            SandpitError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_str(content: &str) -> Result<EngineConfig, SandpitError> {
        // An empty document deserializes to unit, not to an empty mapping.
        let mut config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| SandpitError::Config(format!("Failed to parse YAML config: {}", e)))?
        };

        Self::resolve_environment(&mut config)?;

        config.validate()?;

        Ok(config)
    }

    /// Apply `SANDPIT_*` overrides on top of the parsed file
    fn resolve_environment(config: &mut EngineConfig) -> Result<(), SandpitError> {
        if let Ok(value) = env::var(ENV_POOL_MIN_SIZE) {
            config.pool.min_size = parse_env(ENV_POOL_MIN_SIZE, &value)?;
        }
        if let Ok(value) = env::var(ENV_POOL_MAX_SIZE) {
            config.pool.max_size = parse_env(ENV_POOL_MAX_SIZE, &value)?;
        }
        if let Ok(value) = env::var(ENV_POOL_IMAGE) {
            if !value.trim().is_empty() {
                config.pool.image = value;
            }
        }
        if let Ok(value) = env::var(ENV_NETWORK_ALLOWED) {
            config.limits.network_allowed = parse_env(ENV_NETWORK_ALLOWED, &value)?;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, SandpitError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| {
        SandpitError::Config(format!("Invalid value '{}' for {}: {}", value, name, e))
    })
}
