//! Configuration type definitions for the execution engine
//!
//! Every section has serde defaults so a minimal (even empty) YAML document
//! yields a working configuration. Durations are stored as milliseconds and
//! exposed through `Duration` accessors; resource limits use the units of the
//! public submission API (seconds and kilobytes).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::SandpitError;
use crate::language::LanguageDescriptor;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub callbacks: CallbackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Replaces the built-in language registry when present.
    #[serde(default)]
    pub languages: Option<Vec<LanguageDescriptor>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_min_size")]
    pub min_size: usize,
    #[serde(default = "default_pool_max_size")]
    pub max_size: usize,
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
    #[serde(default = "default_max_uses")]
    pub max_uses: u32,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_scale_interval_ms")]
    pub scale_interval_ms: u64,
    #[serde(default = "default_expiry_interval_ms")]
    pub expiry_interval_ms: u64,
    #[serde(default = "default_acquire_poll_ms")]
    pub acquire_poll_ms: u64,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_work_root")]
    pub work_root: PathBuf,
    #[serde(default = "default_instance_workdir")]
    pub instance_workdir: String,
    #[serde(default = "default_instance_memory_bytes")]
    pub instance_memory_bytes: i64,
    #[serde(default = "default_instance_pids_limit")]
    pub instance_pids_limit: i64,
    #[serde(default = "default_warmup_timeout_ms")]
    pub warmup_timeout_ms: u64,
}

impl PoolConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn scale_interval(&self) -> Duration {
        Duration::from_millis(self.scale_interval_ms)
    }

    pub fn expiry_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_interval_ms)
    }

    pub fn acquire_poll(&self) -> Duration {
        Duration::from_millis(self.acquire_poll_ms)
    }

    pub fn warmup_timeout(&self) -> Duration {
        Duration::from_millis(self.warmup_timeout_ms)
    }
}

/// System-wide defaults and the `[min, max]` window for every constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_cpu_time_limit")]
    pub cpu_time_limit: f64,
    #[serde(default = "default_max_cpu_time_limit")]
    pub max_cpu_time_limit: f64,
    #[serde(default = "default_cpu_extra_time")]
    pub cpu_extra_time: f64,
    #[serde(default = "default_max_cpu_extra_time")]
    pub max_cpu_extra_time: f64,
    #[serde(default = "default_wall_time_limit")]
    pub wall_time_limit: f64,
    #[serde(default = "default_max_wall_time_limit")]
    pub max_wall_time_limit: f64,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u64,
    #[serde(default = "default_min_memory_limit")]
    pub min_memory_limit: u64,
    #[serde(default = "default_max_memory_limit")]
    pub max_memory_limit: u64,
    #[serde(default = "default_stack_limit")]
    pub stack_limit: u64,
    #[serde(default = "default_max_stack_limit")]
    pub max_stack_limit: u64,
    #[serde(default = "default_max_processes")]
    pub max_processes_and_or_threads: u32,
    #[serde(default = "default_max_max_processes")]
    pub max_max_processes_and_or_threads: u32,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_max_max_file_size")]
    pub max_max_file_size: u64,
    #[serde(default)]
    pub network_allowed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    #[serde(default = "default_compile_timeout_ms")]
    pub compile_timeout_ms: u64,
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_true")]
    pub async_cleanup: bool,
    #[serde(default = "default_run_user")]
    pub run_user: String,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,
    #[serde(default = "default_max_extract_bytes")]
    pub max_extract_bytes: u64,
}

impl ExecutionConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_callback_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_callback_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_pool_min_size() -> usize { 5 }
fn default_pool_max_size() -> usize { 20 }
fn default_max_idle_ms() -> u64 { 300_000 }
fn default_max_uses() -> u32 { 100 }
fn default_health_check_interval_ms() -> u64 { 30_000 }
fn default_scale_interval_ms() -> u64 { 30_000 }
fn default_expiry_interval_ms() -> u64 { 60_000 }
fn default_acquire_poll_ms() -> u64 { 50 }
fn default_image() -> String { "judge0/compilers".to_string() }
fn default_work_root() -> PathBuf { std::env::temp_dir().join("sandpit") }
fn default_instance_workdir() -> String { "/tmp/judge".to_string() }
fn default_instance_memory_bytes() -> i64 { 512 * 1024 * 1024 }
fn default_instance_pids_limit() -> i64 { 256 }
fn default_warmup_timeout_ms() -> u64 { 60_000 }
fn default_cpu_time_limit() -> f64 { 5.0 }
fn default_max_cpu_time_limit() -> f64 { 15.0 }
fn default_cpu_extra_time() -> f64 { 1.0 }
fn default_max_cpu_extra_time() -> f64 { 5.0 }
fn default_wall_time_limit() -> f64 { 10.0 }
fn default_max_wall_time_limit() -> f64 { 20.0 }
fn default_memory_limit() -> u64 { 128_000 }
fn default_min_memory_limit() -> u64 { 2_048 }
fn default_max_memory_limit() -> u64 { 512_000 }
fn default_stack_limit() -> u64 { 64_000 }
fn default_max_stack_limit() -> u64 { 128_000 }
fn default_max_processes() -> u32 { 60 }
fn default_max_max_processes() -> u32 { 120 }
fn default_max_file_size() -> u64 { 1_024 }
fn default_max_max_file_size() -> u64 { 4_096 }
fn default_acquire_timeout_ms() -> u64 { 30_000 }
fn default_compile_timeout_ms() -> u64 { 30_000 }
fn default_grace_ms() -> u64 { 1_000 }
fn default_true() -> bool { true }
fn default_run_user() -> String { "nobody:nogroup".to_string() }
fn default_max_output_bytes() -> u64 { 10 * 1024 * 1024 }
fn default_max_extract_bytes() -> u64 { 10 * 1024 * 1024 }
fn default_workers() -> usize { 4 }
fn default_queue_capacity() -> usize { 1024 }
fn default_callback_max_tries() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 1_000 }
fn default_callback_timeout_ms() -> u64 { 5_000 }
fn default_log_level() -> String { "info".to_string() }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_pool_min_size(),
            max_size: default_pool_max_size(),
            max_idle_ms: default_max_idle_ms(),
            max_uses: default_max_uses(),
            health_check_interval_ms: default_health_check_interval_ms(),
            scale_interval_ms: default_scale_interval_ms(),
            expiry_interval_ms: default_expiry_interval_ms(),
            acquire_poll_ms: default_acquire_poll_ms(),
            image: default_image(),
            work_root: default_work_root(),
            instance_workdir: default_instance_workdir(),
            instance_memory_bytes: default_instance_memory_bytes(),
            instance_pids_limit: default_instance_pids_limit(),
            warmup_timeout_ms: default_warmup_timeout_ms(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            cpu_time_limit: default_cpu_time_limit(),
            max_cpu_time_limit: default_max_cpu_time_limit(),
            cpu_extra_time: default_cpu_extra_time(),
            max_cpu_extra_time: default_max_cpu_extra_time(),
            wall_time_limit: default_wall_time_limit(),
            max_wall_time_limit: default_max_wall_time_limit(),
            memory_limit: default_memory_limit(),
            min_memory_limit: default_min_memory_limit(),
            max_memory_limit: default_max_memory_limit(),
            stack_limit: default_stack_limit(),
            max_stack_limit: default_max_stack_limit(),
            max_processes_and_or_threads: default_max_processes(),
            max_max_processes_and_or_threads: default_max_max_processes(),
            max_file_size: default_max_file_size(),
            max_max_file_size: default_max_max_file_size(),
            network_allowed: false,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: default_acquire_timeout_ms(),
            compile_timeout_ms: default_compile_timeout_ms(),
            grace_ms: default_grace_ms(),
            async_cleanup: true,
            run_user: default_run_user(),
            max_output_bytes: default_max_output_bytes(),
            max_extract_bytes: default_max_extract_bytes(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tries: default_callback_max_tries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            timeout_ms: default_callback_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SandpitError> {
        let pool = &self.pool;
        if pool.max_size == 0 {
            return Err(SandpitError::Config("pool.max_size must be greater than 0".to_string()));
        }
        if pool.min_size > pool.max_size {
            return Err(SandpitError::Config(format!(
                "pool.min_size ({}) cannot exceed pool.max_size ({})",
                pool.min_size, pool.max_size
            )));
        }
        if pool.max_uses == 0 {
            return Err(SandpitError::Config("pool.max_uses must be greater than 0".to_string()));
        }
        if pool.health_check_interval_ms == 0
            || pool.scale_interval_ms == 0
            || pool.expiry_interval_ms == 0
            || pool.acquire_poll_ms == 0
        {
            return Err(SandpitError::Config("pool intervals must be greater than 0".to_string()));
        }
        if pool.image.trim().is_empty() {
            return Err(SandpitError::Config("pool.image cannot be empty".to_string()));
        }
        if !pool.instance_workdir.starts_with('/') {
            return Err(SandpitError::Config(format!(
                "pool.instance_workdir must be an absolute path, got '{}'",
                pool.instance_workdir
            )));
        }

        self.limits.validate()?;

        if self.scheduler.workers == 0 {
            return Err(SandpitError::Config("scheduler.workers must be greater than 0".to_string()));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(SandpitError::Config(
                "scheduler.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.execution.run_user.trim().is_empty() {
            return Err(SandpitError::Config("execution.run_user cannot be empty".to_string()));
        }
        if self.callbacks.enabled && self.callbacks.max_tries == 0 {
            return Err(SandpitError::Config("callbacks.max_tries must be greater than 0".to_string()));
        }

        if let Some(languages) = &self.languages {
            if languages.is_empty() {
                return Err(SandpitError::Config("languages cannot be an empty list".to_string()));
            }
            for language in languages {
                language.validate()?;
            }
        }

        Ok(())
    }
}

impl LimitsConfig {
    /// The system defaults must themselves lie inside the configured windows.
    pub fn validate(&self) -> Result<(), SandpitError> {
        fn check<T: PartialOrd + std::fmt::Display>(
            name: &str,
            value: T,
            min: T,
            max: T,
        ) -> Result<(), SandpitError> {
            if value < min || value > max {
                return Err(SandpitError::Config(format!(
                    "limits.{} default {} is outside [{}, {}]",
                    name, value, min, max
                )));
            }
            Ok(())
        }

        check("cpu_time_limit", self.cpu_time_limit, 0.0, self.max_cpu_time_limit)?;
        check("cpu_extra_time", self.cpu_extra_time, 0.0, self.max_cpu_extra_time)?;
        check("wall_time_limit", self.wall_time_limit, 1.0, self.max_wall_time_limit)?;
        check(
            "memory_limit",
            self.memory_limit,
            self.min_memory_limit,
            self.max_memory_limit,
        )?;
        check("stack_limit", self.stack_limit, 0, self.max_stack_limit)?;
        check(
            "max_processes_and_or_threads",
            self.max_processes_and_or_threads,
            1,
            self.max_max_processes_and_or_threads,
        )?;
        check("max_file_size", self.max_file_size, 0, self.max_max_file_size)?;
        Ok(())
    }
}
