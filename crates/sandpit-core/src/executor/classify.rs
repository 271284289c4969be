//! Maps what the run script reported onto the status taxonomy.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::constraints::ConstraintSet;
use crate::runtime::ExecOutput;
use crate::status::{RuntimeErrorKind, Status};

/// Exit code of `timeout` when the limit fired.
pub const EXIT_TIMEOUT: i32 = 124;
/// 128 + SIGKILL, used by the kernel OOM killer and by `timeout -k`.
pub const EXIT_KILLED: i32 = 137;
const SIGNAL_BASE: i32 = 128;
const SIGXFSZ: i32 = 25;

static ERROR_MARKER: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| Regex::new(r"(?i)\berror\b"));

/// Observations from one run of the program.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// False when the external await deadline fired first.
    pub completed: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    /// Largest of the stdout and stderr file sizes, in bytes.
    pub output_bytes: u64,
    pub wall_time: Option<f64>,
    pub cpu_time: Option<f64>,
    /// Peak resident set, kilobytes.
    pub memory: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub status: Status,
    pub exit_signal: Option<i32>,
}

impl Verdict {
    fn of(status: Status) -> Self {
        Self {
            status,
            exit_signal: None,
        }
    }
}

pub fn classify(report: &RunReport, constraints: &ConstraintSet, expected_output: Option<&str>) -> Verdict {
    let Some(code) = report.exit_code.filter(|_| report.completed) else {
        return Verdict::of(Status::TimeLimitExceeded);
    };

    if code == EXIT_TIMEOUT || exceeded_time(report, constraints) {
        return Verdict::of(Status::TimeLimitExceeded);
    }

    if code == EXIT_KILLED {
        // `timeout -k` also ends in SIGKILL; only a kill before the limit is memory.
        let hit_time_limit = report
            .wall_time
            .map(|wall| wall >= constraints.cpu_time_limit)
            .unwrap_or(false);
        let status = if hit_time_limit {
            Status::TimeLimitExceeded
        } else {
            Status::MemoryLimitExceeded
        };
        return Verdict::of(status);
    }

    if report
        .memory
        .map(|kb| kb > constraints.memory_limit)
        .unwrap_or(false)
    {
        return Verdict::of(Status::MemoryLimitExceeded);
    }

    // `ulimit -f` stops the file at exactly the cap and raises SIGXFSZ, so a
    // file at the cap is only over the limit when the program died of it.
    let cap = constraints.max_file_size_bytes();
    let killed_by_file_size = code == SIGNAL_BASE + SIGXFSZ;
    if cap > 0
        && (report.output_bytes > cap || (killed_by_file_size && report.output_bytes >= cap))
    {
        return Verdict::of(Status::OutputLimitExceeded);
    }

    if code > SIGNAL_BASE {
        let signal = code - SIGNAL_BASE;
        return Verdict {
            status: Status::RuntimeError(RuntimeErrorKind::from_signal(signal)),
            exit_signal: Some(signal),
        };
    }

    if code != 0 {
        return Verdict::of(Status::RuntimeError(RuntimeErrorKind::Nzec));
    }

    match expected_output {
        Some(expected) if normalize(expected) != normalize(&report.stdout) => {
            Verdict::of(Status::WrongAnswer)
        }
        _ => Verdict::of(Status::Accepted),
    }
}

fn exceeded_time(report: &RunReport, constraints: &ConstraintSet) -> bool {
    let cpu = report
        .cpu_time
        .map(|t| t > constraints.cpu_time_limit)
        .unwrap_or(false);
    let wall = report
        .wall_time
        .map(|t| t > constraints.wall_time_limit)
        .unwrap_or(false);
    cpu || wall
}

/// Strip trailing whitespace from every line and from the whole text.
pub fn normalize(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

/// A compile phase fails on a non-zero exit or on diagnostics that mention
/// an error.
pub fn compilation_failed(output: &ExecOutput) -> bool {
    if !output.succeeded() {
        return true;
    }
    match ERROR_MARKER.as_ref() {
        Ok(marker) => marker.is_match(&output.combined()),
        Err(e) => {
            log::error!("Compile error marker pattern is invalid: {}", e);
            false
        }
    }
}
