//! Configuration module for the execution engine
//!
//! YAML configuration with serde defaults for every field, plus a small set of
//! environment overrides for deployment-time tuning of the pool.

pub mod types;
pub mod loader;

pub use types::*;
pub use loader::*;


use crate::errors::SandpitError;
use std::path::Path;

/// Load a configuration from a YAML file
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<EngineConfig, SandpitError> {
    ConfigLoader::from_file(path).await
}
