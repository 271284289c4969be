// src/test_utils/fake_runtime.rs
//! In-memory `ContainerRuntime` that emulates the staged scripts.
//!
//! Instances are directories on the host. A behaviour closure decides what a
//! compile or run script "does" by writing the result files the real scripts
//! would have written.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::errors::RuntimeError;
use crate::executor::staging::{COMPILE_SCRIPT, EXIT_CODE_FILE, RUN_SCRIPT, STDERR_FILE, STDOUT_FILE, TIMING_FILE};
use crate::runtime::{ContainerRuntime, ExecCommand, ExecOutput, InstanceSpec, ResourceUpdate};

/// Which generated script an exec invoked, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Compile,
    Run,
    Other,
}

impl Script {
    pub fn of(command: &ExecCommand) -> Script {
        match command.argv.last() {
            Some(arg) if arg.ends_with(COMPILE_SCRIPT) => Script::Compile,
            Some(arg) if arg.ends_with(RUN_SCRIPT) => Script::Run,
            _ => Script::Other,
        }
    }
}

pub type Behavior = Arc<dyn Fn(Script, &Path) -> ExecOutput + Send + Sync>;

#[derive(Default)]
struct FakeState {
    mounts: HashMap<String, PathBuf>,
    running: HashSet<String>,
    created: usize,
    removed: Vec<String>,
    execs: Vec<(String, Script)>,
    updates: Vec<(String, ResourceUpdate)>,
}

pub struct FakeRuntime {
    state: Mutex<FakeState>,
    behavior: Mutex<Behavior>,
    next_id: AtomicUsize,
    fail_creates: AtomicBool,
    fail_updates: AtomicBool,
    image_present: AtomicBool,
    run_delay: Mutex<Duration>,
    create_delay: Mutex<Duration>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Self::with_behavior(|script, dir| match script {
            Script::Run => run_result(dir, "", 0),
            _ => ok_output(""),
        })
    }

    pub fn with_behavior<F>(behavior: F) -> Arc<Self>
    where
        F: Fn(Script, &Path) -> ExecOutput + Send + Sync + 'static,
    {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            behavior: Mutex::new(Arc::new(behavior)),
            next_id: AtomicUsize::new(1),
            fail_creates: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            image_present: AtomicBool::new(true),
            run_delay: Mutex::new(Duration::ZERO),
            create_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn set_behavior<F>(&self, behavior: F)
    where
        F: Fn(Script, &Path) -> ExecOutput + Send + Sync + 'static,
    {
        *self.behavior.lock().unwrap() = Arc::new(behavior);
    }

    /// Delay applied to every run-script exec.
    pub fn set_run_delay(&self, delay: Duration) {
        *self.run_delay.lock().unwrap() = delay;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn set_image_present(&self, present: bool) {
        self.image_present.store(present, Ordering::SeqCst);
    }

    /// Make an instance fail its liveness probe.
    pub fn crash(&self, id: &str) {
        self.state.lock().unwrap().running.remove(id);
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn script_runs(&self, script: Script) -> usize {
        self.state
            .lock()
            .unwrap()
            .execs
            .iter()
            .filter(|(_, s)| *s == script)
            .count()
    }

    pub fn resource_updates(&self) -> Vec<(String, ResourceUpdate)> {
        self.state.lock().unwrap().updates.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
        Ok(self.image_present.load(Ordering::SeqCst))
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<String, RuntimeError> {
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed("scripted create failure".to_string()));
        }
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut state = self.state.lock().unwrap();
        state.mounts.insert(id.clone(), spec.host_mount.clone());
        state.created += 1;
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if !state.mounts.contains_key(id) {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        state.running.insert(id.to_string());
        Ok(())
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.state.lock().unwrap().running.remove(id);
        Ok(())
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.state.lock().unwrap().running.remove(id);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.running.remove(id);
        if state.mounts.remove(id).is_none() {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        state.removed.push(id.to_string());
        Ok(())
    }

    async fn exec_in(&self, id: &str, command: &ExecCommand) -> Result<ExecOutput, RuntimeError> {
        let script = Script::of(command);
        let dir = {
            let mut state = self.state.lock().unwrap();
            if !state.running.contains(id) {
                return Err(RuntimeError::Failed(format!("instance {} is not running", id)));
            }
            state.execs.push((id.to_string(), script));
            state.mounts.get(id).cloned()
        };
        let dir = dir.ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;

        if script == Script::Run {
            let delay = *self.run_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let behavior = self.behavior.lock().unwrap().clone();
        Ok(behavior(script, &dir))
    }

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError> {
        Ok(self.state.lock().unwrap().running.contains(id))
    }

    async fn update_resources(&self, id: &str, update: ResourceUpdate) -> Result<(), RuntimeError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(RuntimeError::Failed("scripted update failure".to_string()));
        }
        self.state
            .lock()
            .unwrap()
            .updates
            .push((id.to_string(), update));
        Ok(())
    }
}

pub fn ok_output(stdout: &str) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(0),
    }
}

/// Write what the run script records for a program that printed `stdout`
/// and exited with `exit_code`.
pub fn run_result(dir: &Path, stdout: &str, exit_code: i32) -> ExecOutput {
    write_run_files(dir, stdout, "", exit_code, "0.01 0.00 0.00");
    ok_output("")
}

pub fn write_run_files(dir: &Path, stdout: &str, stderr: &str, exit_code: i32, timing: &str) {
    std::fs::write(dir.join(STDOUT_FILE), stdout).unwrap();
    std::fs::write(dir.join(STDERR_FILE), stderr).unwrap();
    std::fs::write(dir.join(EXIT_CODE_FILE), format!("{}\n", exit_code)).unwrap();
    std::fs::write(dir.join(TIMING_FILE), format!("{}\n", timing)).unwrap();
}
