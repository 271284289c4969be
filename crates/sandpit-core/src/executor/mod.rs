//! Execution orchestrator
//!
//! Drives one submission through an instance: acquire, stage, compile, run,
//! collect, classify, release. Failures never escape as errors; they become an
//! `ExecutionResult` with an internal-error status so the instance is always
//! handed back to the pool.

pub mod classify;
pub mod staging;


use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ExecutionConfig;
use crate::constraints::{ConstraintSet, FileSystemAccess};
use crate::errors::SandpitError;
use crate::language::LanguageDescriptor;
use crate::pool::{InstanceProfile, Pool, RuntimeInstance};
use crate::runtime::{ContainerRuntime, ExecCommand, ResourceUpdate};
use crate::status::Status;
use crate::submission::Payload;

use classify::{classify, compilation_failed, RunReport};
use staging::{
    parse_exit_code, parse_memory, parse_timing, read_capped, EXIT_CODE_FILE, MEMORY_FILE,
    STDERR_FILE, STDOUT_FILE, TIMING_FILE,
};

/// Processes the runtime itself needs on top of the user's limit.
const PID_HEADROOM: i64 = 16;

/// Everything the orchestrator needs to run one submission.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Submission token, used for log context only.
    pub token: String,
    pub language: LanguageDescriptor,
    pub payload: Payload,
    pub stdin: Option<String>,
    pub expected_output: Option<String>,
    pub constraints: ConstraintSet,
    pub compiler_options: Vec<String>,
    pub command_line_arguments: Vec<String>,
    pub redirect_stderr_to_stdout: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: Status,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    /// CPU seconds.
    pub time: Option<f64>,
    pub wall_time: Option<f64>,
    /// Peak memory, kilobytes.
    pub memory: Option<u64>,
    pub message: Option<String>,
    pub container_acquire_time_ms: Option<u64>,
    pub total_execution_time_ms: Option<u64>,
    /// Set when the caller should try again later.
    #[serde(default)]
    pub retryable: bool,
}

impl ExecutionResult {
    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            stdout: None,
            stderr: None,
            compile_output: None,
            exit_code: None,
            exit_signal: None,
            time: None,
            wall_time: None,
            memory: None,
            message: None,
            container_acquire_time_ms: None,
            total_execution_time_ms: None,
            retryable: false,
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        let mut result = Self::with_status(Status::InternalError);
        result.message = Some(message.into());
        result
    }

    /// Resource exhaustion: terminal for this attempt, but retryable.
    pub fn unavailable(error: &SandpitError) -> Self {
        let mut result = Self::internal_error(format!("Service unavailable: {}", error));
        result.retryable = true;
        result
    }
}

pub struct Orchestrator {
    pool: Arc<Pool>,
    runtime: Arc<dyn ContainerRuntime>,
    config: ExecutionConfig,
}

impl Orchestrator {
    pub fn new(pool: Arc<Pool>, runtime: Arc<dyn ContainerRuntime>, config: ExecutionConfig) -> Self {
        Self {
            pool,
            runtime,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Run a request end to end. Never fails; problems become the result.
    pub async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let profile = InstanceProfile {
            network_enabled: request.constraints.network_enabled,
        };

        let instance = match self
            .pool
            .acquire_with(self.config.acquire_timeout(), profile)
            .await
        {
            Ok(instance) => instance,
            Err(e) => {
                log::warn!("No instance for submission {}: {}", request.token, e);
                let mut result = if e.is_retryable() {
                    ExecutionResult::unavailable(&e)
                } else {
                    ExecutionResult::internal_error(e.to_string())
                };
                result.total_execution_time_ms = Some(millis(started.elapsed()));
                return result;
            }
        };
        let acquire_time = started.elapsed();
        log::debug!(
            "Submission {} acquired {} in {:?}",
            request.token,
            instance.name,
            acquire_time
        );

        let mut result = match self.run_on(request, &instance).await {
            Ok(result) => result,
            Err(e) => {
                log::error!(
                    "Execution of submission {} on {} failed: {}",
                    request.token,
                    instance.name,
                    e
                );
                ExecutionResult::internal_error(e.to_string())
            }
        };

        self.release(instance).await;

        result.container_acquire_time_ms = Some(millis(acquire_time));
        result.total_execution_time_ms = Some(millis(started.elapsed()));
        result
    }

    /// Stage, compile and run on an instance the caller already holds.
    pub async fn run_on(
        &self,
        request: &ExecutionRequest,
        instance: &RuntimeInstance,
    ) -> Result<ExecutionResult, SandpitError> {
        let dir = &instance.host_dir;
        let workdir = instance.container_dir.as_str();
        let constraints = &request.constraints;

        let staged = staging::stage(
            dir,
            workdir,
            request,
            self.config.compile_timeout(),
            self.config.max_extract_bytes,
        )
        .await?;

        let update = ResourceUpdate {
            memory_bytes: Some(constraints.memory_bytes()),
            pids_limit: Some(constraints.max_processes_and_or_threads as i64 + PID_HEADROOM),
        };
        // Every run executes under its own limits or not at all.
        self.runtime
            .update_resources(&instance.id, update)
            .await
            .map_err(|e| {
                log::error!("Could not apply limits to {}: {}", instance.name, e);
                SandpitError::from(e)
            })?;

        let mut compile_output = None;
        if staged.compile_script.is_some() {
            let command = self.script_command(workdir, staging::COMPILE_SCRIPT);
            let compile = tokio::time::timeout(
                self.config.compile_timeout() + self.config.grace(),
                self.runtime.exec_in(&instance.id, &command),
            )
            .await;

            match compile {
                Err(_) => {
                    log::info!("Compilation of submission {} timed out", request.token);
                    let mut result = ExecutionResult::with_status(Status::CompilationError);
                    result.compile_output = Some("Compilation time limit exceeded".to_string());
                    return Ok(result);
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(output)) => {
                    let text = truncate(output.combined(), self.config.max_output_bytes);
                    if compilation_failed(&output) {
                        let mut result = ExecutionResult::with_status(Status::CompilationError);
                        result.exit_code = output.exit_code.map(|c| c as i32);
                        result.compile_output = Some(text);
                        return Ok(result);
                    }
                    compile_output = Some(text);
                }
            }
        }

        if constraints.filesystem == FileSystemAccess::ReadOnly {
            staging::lock_directory(dir).await?;
        }

        let deadline = constraints.time_limit() + constraints.extra_time() + self.config.grace();
        let command = self.script_command(workdir, staging::RUN_SCRIPT);
        let completed = match tokio::time::timeout(
            deadline,
            self.runtime.exec_in(&instance.id, &command),
        )
        .await
        {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                log::info!(
                    "Submission {} exceeded the await deadline of {:?}",
                    request.token,
                    deadline
                );
                false
            }
        };

        let cap = self.config.max_output_bytes;
        let (stdout, stdout_size) = read_capped(&dir.join(STDOUT_FILE), cap).await?;
        let (stderr, stderr_size) = read_capped(&dir.join(STDERR_FILE), cap).await?;
        let (exit_code, _) = read_capped(&dir.join(EXIT_CODE_FILE), 64).await?;
        let (timing, _) = read_capped(&dir.join(TIMING_FILE), 4096).await?;
        let (memory, _) = read_capped(&dir.join(MEMORY_FILE), 4096).await?;

        let exit_code = parse_exit_code(&exit_code);
        if completed && exit_code.is_none() {
            return Err(SandpitError::internal("run script did not record an exit code"));
        }
        let timing = parse_timing(&timing);

        let report = RunReport {
            completed,
            exit_code,
            stdout,
            output_bytes: stdout_size.max(stderr_size),
            wall_time: timing.map(|(wall, _)| wall),
            cpu_time: timing.map(|(_, cpu)| cpu),
            memory: parse_memory(&memory),
        };
        let verdict = classify(&report, constraints, request.expected_output.as_deref());

        log::info!(
            "Submission {} finished on {}: {}",
            request.token,
            instance.name,
            verdict.status
        );

        let mut result = ExecutionResult::with_status(verdict.status);
        result.stdout = Some(report.stdout);
        result.stderr = if request.redirect_stderr_to_stdout {
            None
        } else {
            Some(stderr)
        };
        result.compile_output = compile_output;
        result.exit_code = report.exit_code;
        result.exit_signal = verdict.exit_signal;
        result.time = report.cpu_time;
        result.wall_time = report.wall_time;
        result.memory = report.memory;
        Ok(result)
    }

    fn script_command(&self, workdir: &str, script: &str) -> ExecCommand {
        ExecCommand::new(["/bin/bash".to_string(), format!("{}/{}", workdir, script)])
            .user(self.config.run_user.clone())
            .working_dir(workdir)
    }

    async fn release(&self, instance: RuntimeInstance) {
        if self.config.async_cleanup {
            let pool = Arc::clone(&self.pool);
            tokio::spawn(async move {
                pool.release(&instance.id).await;
            });
        } else {
            self.pool.release(&instance.id).await;
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

fn truncate(mut text: String, cap: u64) -> String {
    let cap = cap.min(usize::MAX as u64) as usize;
    if text.len() > cap {
        let mut end = cap;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
