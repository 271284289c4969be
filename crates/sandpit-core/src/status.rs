//! Submission status taxonomy
//!
//! A single tagged type replaces the numeric id plus cached enum pair. The
//! numeric ids stay Judge0-compatible so external clients can keep using them;
//! `to_code`/`from_code` are the only way across that boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Runtime error subtype, keyed by the terminating signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeErrorKind {
    Sigsegv,
    Sigxfsz,
    Sigfpe,
    Sigabrt,
    /// Non-zero exit code without a signal.
    Nzec,
    Other,
}

impl RuntimeErrorKind {
    pub fn from_signal(signal: i32) -> Self {
        match signal {
            11 => RuntimeErrorKind::Sigsegv,
            25 => RuntimeErrorKind::Sigxfsz,
            8 => RuntimeErrorKind::Sigfpe,
            6 => RuntimeErrorKind::Sigabrt,
            _ => RuntimeErrorKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "StatusView", try_from = "StatusView")]
pub enum Status {
    Queued,
    Processing,
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    CompilationError,
    RuntimeError(RuntimeErrorKind),
    InternalError,
    OutputLimitExceeded,
}

impl Status {
    pub fn to_code(self) -> u8 {
        match self {
            Status::Queued => 1,
            Status::Processing => 2,
            Status::Accepted => 3,
            Status::WrongAnswer => 4,
            Status::TimeLimitExceeded => 5,
            Status::MemoryLimitExceeded => 6,
            Status::CompilationError => 7,
            Status::RuntimeError(RuntimeErrorKind::Sigsegv) => 8,
            Status::RuntimeError(RuntimeErrorKind::Sigxfsz) => 9,
            Status::RuntimeError(RuntimeErrorKind::Sigfpe) => 10,
            Status::RuntimeError(RuntimeErrorKind::Sigabrt) => 11,
            Status::RuntimeError(RuntimeErrorKind::Nzec) => 12,
            Status::RuntimeError(RuntimeErrorKind::Other) => 13,
            Status::InternalError => 14,
            Status::OutputLimitExceeded => 16,
        }
    }

    pub fn from_code(code: u8) -> Option<Status> {
        let status = match code {
            1 => Status::Queued,
            2 => Status::Processing,
            3 => Status::Accepted,
            4 => Status::WrongAnswer,
            5 => Status::TimeLimitExceeded,
            6 => Status::MemoryLimitExceeded,
            7 => Status::CompilationError,
            8 => Status::RuntimeError(RuntimeErrorKind::Sigsegv),
            9 => Status::RuntimeError(RuntimeErrorKind::Sigxfsz),
            10 => Status::RuntimeError(RuntimeErrorKind::Sigfpe),
            11 => Status::RuntimeError(RuntimeErrorKind::Sigabrt),
            12 => Status::RuntimeError(RuntimeErrorKind::Nzec),
            13 => Status::RuntimeError(RuntimeErrorKind::Other),
            14 => Status::InternalError,
            16 => Status::OutputLimitExceeded,
            _ => return None,
        };
        Some(status)
    }

    pub fn description(self) -> &'static str {
        match self {
            Status::Queued => "In Queue",
            Status::Processing => "Processing",
            Status::Accepted => "Accepted",
            Status::WrongAnswer => "Wrong Answer",
            Status::TimeLimitExceeded => "Time Limit Exceeded",
            Status::MemoryLimitExceeded => "Memory Limit Exceeded",
            Status::CompilationError => "Compilation Error",
            Status::RuntimeError(RuntimeErrorKind::Sigsegv) => "Runtime Error (SIGSEGV)",
            Status::RuntimeError(RuntimeErrorKind::Sigxfsz) => "Runtime Error (SIGXFSZ)",
            Status::RuntimeError(RuntimeErrorKind::Sigfpe) => "Runtime Error (SIGFPE)",
            Status::RuntimeError(RuntimeErrorKind::Sigabrt) => "Runtime Error (SIGABRT)",
            Status::RuntimeError(RuntimeErrorKind::Nzec) => "Runtime Error (NZEC)",
            Status::RuntimeError(RuntimeErrorKind::Other) => "Runtime Error (Other)",
            Status::InternalError => "Internal Error",
            Status::OutputLimitExceeded => "Output Limit Exceeded",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Queued | Status::Processing)
    }

    /// Everything from MLE upwards, plus output limit.
    pub fn is_error(self) -> bool {
        !matches!(
            self,
            Status::Queued
                | Status::Processing
                | Status::Accepted
                | Status::WrongAnswer
                | Status::TimeLimitExceeded
        )
    }

    pub fn is_runtime_error(self) -> bool {
        matches!(self, Status::RuntimeError(_))
    }

    pub fn is_successful(self) -> bool {
        self == Status::Accepted
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Wire shape of a status: `{ "id": 3, "description": "Accepted" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusView {
    pub id: u8,
    #[serde(default)]
    pub description: String,
}

impl From<Status> for StatusView {
    fn from(status: Status) -> Self {
        StatusView {
            id: status.to_code(),
            description: status.description().to_string(),
        }
    }
}

impl TryFrom<StatusView> for Status {
    type Error = String;

    fn try_from(view: StatusView) -> Result<Self, Self::Error> {
        Status::from_code(view.id).ok_or_else(|| format!("Unknown status id: {}", view.id))
    }
}
