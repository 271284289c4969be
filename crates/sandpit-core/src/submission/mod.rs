//! Submissions and their lifecycle
//!
//! A submission is created `Queued`, moves to `Processing` when a worker picks
//! it up, and ends in exactly one terminal status. `finished_at` is set if and
//! only if the status is terminal, and nothing but deletion touches a
//! terminal submission.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::tokenize;
use crate::constraints::{ConstraintCompiler, ConstraintOverrides, ConstraintSet};
use crate::errors::SandpitError;
use crate::executor::staging::validate_bundle;
use crate::executor::{ExecutionRequest, ExecutionResult};
use crate::language::LanguageDescriptor;
use crate::status::Status;

pub use store::{InMemorySubmissionStore, SubmissionStore};

/// The program to run: one source file, or a ZIP bundle for projects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Source(String),
    Project(Vec<u8>),
}

/// What a caller submits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmissionRequest {
    pub language_id: u32,
    #[serde(default)]
    pub source_code: Option<String>,
    /// ZIP archive, only for the multi-file project language.
    #[serde(default)]
    pub additional_files: Option<Vec<u8>>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(flatten)]
    pub constraints: ConstraintOverrides,
    #[serde(default)]
    pub compiler_options: Option<String>,
    #[serde(default)]
    pub command_line_arguments: Option<String>,
    #[serde(default)]
    pub redirect_stderr_to_stdout: bool,
    #[serde(default)]
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub token: String,
    pub language_id: u32,
    pub payload: Payload,
    pub stdin: Option<String>,
    pub expected_output: Option<String>,
    pub constraints: ConstraintSet,
    pub compiler_options: Vec<String>,
    pub command_line_arguments: Vec<String>,
    pub redirect_stderr_to_stdout: bool,
    pub callback_url: Option<String>,
    pub status: Status,
    pub result: Option<ExecutionResult>,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Submission {
    /// Validate a request against its language and compile its constraints.
    pub fn create(
        request: SubmissionRequest,
        language: &LanguageDescriptor,
        compiler: &ConstraintCompiler,
        max_bundle_bytes: u64,
    ) -> Result<Submission, SandpitError> {
        let payload = match (request.source_code, request.additional_files) {
            (Some(_), Some(_)) => {
                return Err(SandpitError::validation(
                    "provide either source_code or additional_files, not both",
                ))
            }
            (None, None) => {
                return Err(SandpitError::validation(
                    "one of source_code or additional_files is required",
                ))
            }
            (Some(source), None) => {
                if language.is_project() {
                    return Err(SandpitError::validation(format!(
                        "{} requires additional_files",
                        language.name
                    )));
                }
                Payload::Source(source)
            }
            (None, Some(bundle)) => {
                if !language.is_project() {
                    return Err(SandpitError::validation(format!(
                        "{} requires source_code",
                        language.name
                    )));
                }
                validate_bundle(&bundle, max_bundle_bytes)?;
                Payload::Project(bundle)
            }
        };

        let constraints = compiler.compile(language, &request.constraints)?;
        let compiler_options = tokenize(
            "compiler_options",
            request.compiler_options.as_deref().unwrap_or(""),
        )?;
        let command_line_arguments = tokenize(
            "command_line_arguments",
            request.command_line_arguments.as_deref().unwrap_or(""),
        )?;

        let callback_url = match request.callback_url {
            Some(url) if !url.trim().is_empty() => Some(validate_callback_url(url.trim())?),
            _ => None,
        };

        Ok(Submission {
            token: Uuid::new_v4().to_string(),
            language_id: language.id,
            payload,
            stdin: request.stdin,
            expected_output: request.expected_output,
            constraints,
            compiler_options,
            command_line_arguments,
            redirect_stderr_to_stdout: request.redirect_stderr_to_stdout,
            callback_url,
            status: Status::Queued,
            result: None,
            created_at: Utc::now(),
            queued_at: None,
            started_at: None,
            finished_at: None,
            cancelled_at: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    pub(crate) fn mark_queued(&mut self) {
        self.queued_at = Some(Utc::now());
        self.cancelled_at = None;
    }

    pub(crate) fn mark_processing(&mut self) {
        self.status = Status::Processing;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_cancelled(&mut self) {
        self.cancelled_at = Some(Utc::now());
    }

    /// Move to the result's terminal status. A non-terminal result status is
    /// recorded as an internal error so the submission cannot stay pending.
    pub(crate) fn complete(&mut self, mut result: ExecutionResult) {
        if !result.status.is_terminal() {
            log::error!(
                "Submission {} produced non-terminal status {}",
                self.token,
                result.status
            );
            result.status = Status::InternalError;
        }
        self.status = result.status;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
    }

    pub fn execution_request(&self, language: LanguageDescriptor) -> ExecutionRequest {
        ExecutionRequest {
            token: self.token.clone(),
            language,
            payload: self.payload.clone(),
            stdin: self.stdin.clone(),
            expected_output: self.expected_output.clone(),
            constraints: self.constraints.clone(),
            compiler_options: self.compiler_options.clone(),
            command_line_arguments: self.command_line_arguments.clone(),
            redirect_stderr_to_stdout: self.redirect_stderr_to_stdout,
        }
    }

    pub fn view(&self) -> SubmissionView {
        let result = self.result.as_ref();
        SubmissionView {
            token: self.token.clone(),
            language_id: self.language_id,
            status: self.status,
            stdout: result.and_then(|r| r.stdout.clone()),
            stderr: result.and_then(|r| r.stderr.clone()),
            compile_output: result.and_then(|r| r.compile_output.clone()),
            message: result.and_then(|r| r.message.clone()),
            exit_code: result.and_then(|r| r.exit_code),
            exit_signal: result.and_then(|r| r.exit_signal),
            time: result.and_then(|r| r.time),
            wall_time: result.and_then(|r| r.wall_time),
            memory: result.and_then(|r| r.memory),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Outward-facing snapshot of a submission, as sent to webhooks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionView {
    pub token: String,
    pub language_id: u32,
    pub status: Status,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    pub message: Option<String>,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub time: Option<f64>,
    pub wall_time: Option<f64>,
    pub memory: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Callback URLs must be absolute http(s) URLs with a host.
pub fn validate_callback_url(url: &str) -> Result<String, SandpitError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| SandpitError::validation(format!("invalid callback_url '{}': {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SandpitError::validation(format!(
            "callback_url must use http or https, got '{}'",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(SandpitError::validation("callback_url must include a host"));
    }
    Ok(parsed.to_string())
}
