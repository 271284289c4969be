//! Constraint compiler
//!
//! Resolves the resource and isolation policy for one execution. Each field is
//! taken from the request if present, then from the language, then from the
//! system defaults, and the result must lie inside the configured window.
//! Out-of-range values are rejected, never clamped.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;

use crate::config::LimitsConfig;
use crate::errors::SandpitError;
use crate::language::LanguageDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSystemAccess {
    #[default]
    ReadOnly,
    ReadWrite,
}

/// Per-request overrides; `None` means "use the next default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintOverrides {
    #[serde(default)]
    pub cpu_time_limit: Option<f64>,
    #[serde(default)]
    pub cpu_extra_time: Option<f64>,
    #[serde(default)]
    pub wall_time_limit: Option<f64>,
    #[serde(default)]
    pub memory_limit: Option<u64>,
    #[serde(default)]
    pub stack_limit: Option<u64>,
    #[serde(default)]
    pub max_processes_and_or_threads: Option<u32>,
    #[serde(default)]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub enable_network: Option<bool>,
    #[serde(default)]
    pub filesystem: Option<FileSystemAccess>,
}

/// Times are in seconds, sizes in kilobytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSet {
    pub cpu_time_limit: f64,
    pub cpu_extra_time: f64,
    pub wall_time_limit: f64,
    pub memory_limit: u64,
    pub stack_limit: u64,
    pub max_processes_and_or_threads: u32,
    pub max_file_size: u64,
    pub network_enabled: bool,
    pub filesystem: FileSystemAccess,
}

impl ConstraintSet {
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs_f64(self.cpu_time_limit)
    }

    pub fn extra_time(&self) -> Duration {
        Duration::from_secs_f64(self.cpu_extra_time)
    }

    pub fn memory_bytes(&self) -> i64 {
        (self.memory_limit as i64).saturating_mul(1024)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size.saturating_mul(1024)
    }
}

pub struct ConstraintCompiler {
    limits: LimitsConfig,
}

impl ConstraintCompiler {
    pub fn new(limits: LimitsConfig) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    pub fn compile(
        &self,
        language: &LanguageDescriptor,
        overrides: &ConstraintOverrides,
    ) -> Result<ConstraintSet, SandpitError> {
        let limits = &self.limits;

        let cpu_time_limit = overrides
            .cpu_time_limit
            .or(language.default_time_limit)
            .unwrap_or(limits.cpu_time_limit);
        check_time("cpu_time_limit", cpu_time_limit, limits.max_cpu_time_limit)?;
        if cpu_time_limit <= 0.0 {
            return Err(SandpitError::validation(
                "cpu_time_limit must be greater than 0",
            ));
        }

        let cpu_extra_time = overrides.cpu_extra_time.unwrap_or(limits.cpu_extra_time);
        check_time("cpu_extra_time", cpu_extra_time, limits.max_cpu_extra_time)?;

        let wall_time_limit = overrides.wall_time_limit.unwrap_or(limits.wall_time_limit);
        check_time("wall_time_limit", wall_time_limit, limits.max_wall_time_limit)?;
        check_range("wall_time_limit", wall_time_limit, 1.0, limits.max_wall_time_limit)?;

        let memory_limit = overrides
            .memory_limit
            .or(language.default_memory_limit)
            .unwrap_or(limits.memory_limit);
        check_range(
            "memory_limit",
            memory_limit,
            limits.min_memory_limit,
            limits.max_memory_limit,
        )?;

        let stack_limit = overrides.stack_limit.unwrap_or(limits.stack_limit);
        check_range("stack_limit", stack_limit, 0, limits.max_stack_limit)?;

        let max_processes_and_or_threads = overrides
            .max_processes_and_or_threads
            .unwrap_or(limits.max_processes_and_or_threads);
        check_range(
            "max_processes_and_or_threads",
            max_processes_and_or_threads,
            1,
            limits.max_max_processes_and_or_threads,
        )?;

        let max_file_size = overrides.max_file_size.unwrap_or(limits.max_file_size);
        check_range("max_file_size", max_file_size, 0, limits.max_max_file_size)?;

        let network_enabled = overrides.enable_network.unwrap_or(false);
        if network_enabled && !limits.network_allowed {
            return Err(SandpitError::validation(
                "enable_network is not permitted on this system",
            ));
        }

        Ok(ConstraintSet {
            cpu_time_limit,
            cpu_extra_time,
            wall_time_limit,
            memory_limit,
            stack_limit,
            max_processes_and_or_threads,
            max_file_size,
            network_enabled,
            filesystem: overrides.filesystem.unwrap_or_default(),
        })
    }
}

fn check_time(field: &str, value: f64, max: f64) -> Result<(), SandpitError> {
    if !value.is_finite() {
        return Err(SandpitError::validation(format!("{} must be a finite number", field)));
    }
    check_range(field, value, 0.0, max)
}

fn check_range<T: PartialOrd + Display>(
    field: &str,
    value: T,
    min: T,
    max: T,
) -> Result<(), SandpitError> {
    if value < min || value > max {
        return Err(SandpitError::validation(format!(
            "{} must be between {} and {} (got {})",
            field, min, max, value
        )));
    }
    Ok(())
}
