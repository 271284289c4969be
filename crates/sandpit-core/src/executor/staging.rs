//! Filesystem staging for one execution
//!
//! Everything lives in the instance's private directory: the program, its
//! stdin, the generated compile and run scripts, and the files the run script
//! reports back through (exit code, timing, peak memory).

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use zip::ZipArchive;

use crate::command::{quote, quote_all, render_template};
use crate::constraints::ConstraintSet;
use crate::errors::SandpitError;
use crate::pool::{clear_dir, set_mode};
use crate::submission::Payload;

use super::ExecutionRequest;

pub const STDIN_FILE: &str = "stdin.txt";
pub const STDOUT_FILE: &str = "stdout.txt";
pub const STDERR_FILE: &str = "stderr.txt";
pub const EXIT_CODE_FILE: &str = "exit_code.txt";
pub const TIMING_FILE: &str = "timing.txt";
pub const MEMORY_FILE: &str = "memory.txt";
pub const COMPILE_SCRIPT: &str = "compile.sh";
pub const RUN_SCRIPT: &str = "run.sh";

/// Bundle entry names with special meaning.
pub const BUNDLE_COMPILE: &str = "compile";
pub const BUNDLE_RUN: &str = "run";

const OUTPUT_FILES: [&str; 5] = [STDOUT_FILE, STDERR_FILE, EXIT_CODE_FILE, TIMING_FILE, MEMORY_FILE];

#[derive(Debug, Clone, PartialEq)]
pub struct StagedFiles {
    pub compile_script: Option<PathBuf>,
    pub run_script: PathBuf,
}

/// Empty the directory and write everything the compile and run phases need.
pub async fn stage(
    dir: &Path,
    workdir: &str,
    request: &ExecutionRequest,
    compile_timeout: Duration,
    max_extract_bytes: u64,
) -> Result<StagedFiles, SandpitError> {
    clear_dir(dir).await?;

    let language = &request.language;
    let compile_command = match &request.payload {
        Payload::Source(source) => {
            tokio::fs::write(dir.join(&language.source_file), source).await?;
            language
                .compile_cmd
                .as_deref()
                .filter(|_| language.supports_compilation())
                .map(|template| render_template(template, &request.compiler_options))
        }
        Payload::Project(archive) => {
            let target = dir.to_path_buf();
            let archive = archive.clone();
            tokio::task::spawn_blocking(move || extract_bundle(&archive, &target, max_extract_bytes))
                .await
                .map_err(|e| SandpitError::internal(format!("bundle extraction task failed: {}", e)))??;

            if !tokio::fs::try_exists(dir.join(BUNDLE_RUN)).await? {
                return Err(SandpitError::validation(
                    "project bundle must contain a 'run' script",
                ));
            }
            // The bundle's own compile script is optional.
            if tokio::fs::try_exists(dir.join(BUNDLE_COMPILE)).await? {
                language
                    .compile_cmd
                    .as_deref()
                    .map(|template| render_template(template, &request.compiler_options))
            } else {
                None
            }
        }
    };

    tokio::fs::write(dir.join(STDIN_FILE), request.stdin.as_deref().unwrap_or("")).await?;

    let compile_script = match compile_command {
        Some(command) => {
            let path = dir.join(COMPILE_SCRIPT);
            tokio::fs::write(&path, compile_script(workdir, &command, compile_timeout)).await?;
            set_mode(&path, 0o755).await?;
            Some(path)
        }
        None => None,
    };

    let run_command = if request.command_line_arguments.is_empty() {
        language.run_cmd.clone()
    } else {
        format!("{} {}", language.run_cmd, quote_all(&request.command_line_arguments))
    };
    let run_script_path = dir.join(RUN_SCRIPT);
    tokio::fs::write(
        &run_script_path,
        run_script(
            workdir,
            &run_command,
            &request.constraints,
            request.redirect_stderr_to_stdout,
        ),
    )
    .await?;
    set_mode(&run_script_path, 0o755).await?;

    for name in OUTPUT_FILES {
        let path = dir.join(name);
        tokio::fs::write(&path, b"").await?;
        set_mode(&path, 0o666).await?;
    }

    Ok(StagedFiles {
        compile_script,
        run_script: run_script_path,
    })
}

pub fn compile_script(workdir: &str, command: &str, timeout: Duration) -> String {
    format!(
        "#!/bin/bash\n\
         set -e\n\
         cd {}\n\
         timeout -k 1s {}s {} 2>&1\n\
         echo \"Compilation completed successfully\"\n",
        quote(workdir),
        format_seconds(timeout.as_secs_f64()),
        command
    )
}

/// Build the run script. Limits are applied in a subshell so they bind the
/// program but not the bookkeeping writes that follow it. The `time` report
/// goes to the timing file only through the outer group's redirect; the
/// inner group's own redirects belong to the program.
///
/// `/usr/bin/time` wraps `timeout` rather than the program, so a program
/// that ignores SIGTERM is still killed by `timeout -k` and reported as 137.
pub fn run_script(
    workdir: &str,
    command: &str,
    constraints: &ConstraintSet,
    redirect_stderr_to_stdout: bool,
) -> String {
    let mut limits = Vec::new();
    if constraints.stack_limit > 0 {
        limits.push(format!("ulimit -s {}", constraints.stack_limit));
    }
    limits.push(format!("ulimit -f {}", constraints.max_file_size));
    limits.push(format!("ulimit -u {}", constraints.max_processes_and_or_threads));

    let stderr_redirect = if redirect_stderr_to_stdout {
        "2>&1".to_string()
    } else {
        format!("2> {}", STDERR_FILE)
    };

    format!(
        "#!/bin/bash\n\
         cd {workdir}\n\
         MEASURE=\"\"\n\
         if [ -x /usr/bin/time ]; then MEASURE=\"/usr/bin/time -f %M -o {memory}\"; fi\n\
         LC_NUMERIC=C\n\
         TIMEFORMAT='%R %U %S'\n\
         {{ time {{ ( {limits} ; exec $MEASURE timeout -k {kill_after}s {limit}s {command} ) < {stdin} > {stdout} {stderr} ; echo $? > {exit_code} ; }} ; }} 2> {timing}\n",
        workdir = quote(workdir),
        memory = MEMORY_FILE,
        limits = limits.join(" ; "),
        kill_after = format_seconds(constraints.cpu_extra_time.max(0.1)),
        limit = format_seconds(constraints.cpu_time_limit),
        command = command,
        stdin = STDIN_FILE,
        stdout = STDOUT_FILE,
        stderr = stderr_redirect,
        exit_code = EXIT_CODE_FILE,
        timing = TIMING_FILE,
    )
}

fn format_seconds(seconds: f64) -> String {
    let rounded = (seconds * 1000.0).round() / 1000.0;
    format!("{}", rounded)
}

/// Check a bundle without extracting it: every entry must stay inside the
/// target directory and the uncompressed total must fit under `max_bytes`.
pub fn validate_bundle(archive: &[u8], max_bytes: u64) -> Result<(), SandpitError> {
    let mut zip = ZipArchive::new(std::io::Cursor::new(archive))?;
    let mut total: u64 = 0;
    for i in 0..zip.len() {
        let file = zip.by_index(i)?;
        if file.enclosed_name().is_none() {
            return Err(SandpitError::validation(format!(
                "bundle entry '{}' escapes the project directory",
                file.name()
            )));
        }
        total = total.saturating_add(file.size());
        if total > max_bytes {
            return Err(SandpitError::validation(format!(
                "bundle expands to more than {} bytes",
                max_bytes
            )));
        }
    }
    Ok(())
}

/// Extract a ZIP bundle into `dir`, enforcing the same rules as
/// [`validate_bundle`] against the bytes actually written.
pub fn extract_bundle(archive: &[u8], dir: &Path, max_bytes: u64) -> Result<(), SandpitError> {
    let mut zip = ZipArchive::new(std::io::Cursor::new(archive))?;
    let mut written: u64 = 0;

    for i in 0..zip.len() {
        let mut file = zip.by_index(i)?;

        let outpath = match file.enclosed_name() {
            Some(path) => dir.join(path),
            None => {
                return Err(SandpitError::validation(format!(
                    "bundle entry '{}' escapes the project directory",
                    file.name()
                )))
            }
        };

        if file.is_dir() {
            std::fs::create_dir_all(&outpath)?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let remaining = max_bytes.saturating_sub(written);
        let mut limited = (&mut file).take(remaining + 1);
        let mut outfile = std::fs::File::create(&outpath)?;
        let copied = std::io::copy(&mut limited, &mut outfile)?;
        written += copied;
        if written > max_bytes {
            return Err(SandpitError::validation(format!(
                "bundle expands to more than {} bytes",
                max_bytes
            )));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = file.unix_mode() {
                // Keep entries readable by the unprivileged run user.
                std::fs::set_permissions(
                    &outpath,
                    std::fs::Permissions::from_mode((mode & 0o777) | 0o444),
                )?;
            }
        }
    }

    Ok(())
}

/// Read at most `cap` bytes of a file. Returns the text and the full size.
/// A missing file reads as empty.
pub async fn read_capped(path: &Path, cap: u64) -> Result<(String, u64), SandpitError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((String::new(), 0)),
        Err(e) => return Err(e.into()),
    };
    let size = file.metadata().await?.len();
    let mut buffer = Vec::new();
    file.take(cap).read_to_end(&mut buffer).await?;
    Ok((String::from_utf8_lossy(&buffer).into_owned(), size))
}

pub fn parse_exit_code(content: &str) -> Option<i32> {
    content.trim().parse().ok()
}

/// Parse the `TIMEFORMAT='%R %U %S'` line into (wall, cpu) seconds.
pub fn parse_timing(content: &str) -> Option<(f64, f64)> {
    let line = content.lines().rev().find(|l| !l.trim().is_empty())?;
    let fields: Vec<f64> = line
        .split_whitespace()
        .map(|f| f.parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;
    match fields.as_slice() {
        [real, user, sys] => Some((*real, user + sys)),
        _ => None,
    }
}

/// GNU time may prefix the `%M` value with a status line.
pub fn parse_memory(content: &str) -> Option<u64> {
    content
        .lines()
        .rev()
        .find_map(|line| line.trim().parse::<u64>().ok())
}

/// Read-only submissions may not create new files once the program runs.
pub async fn lock_directory(dir: &Path) -> Result<(), SandpitError> {
    set_mode(dir, 0o555).await
}
