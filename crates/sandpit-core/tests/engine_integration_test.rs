use async_trait::async_trait;
use sandpit_core::config::ConfigLoader;
use sandpit_core::errors::RuntimeError;
use sandpit_core::executor::staging::{
    COMPILE_SCRIPT, EXIT_CODE_FILE, RUN_SCRIPT, STDOUT_FILE, TIMING_FILE,
};
use sandpit_core::runtime::{
    ContainerRuntime, ExecCommand, ExecOutput, InstanceSpec, ResourceUpdate,
};
use sandpit_core::{Engine, EngineConfig, JobStatus, Status, SubmissionRequest};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Runtime that answers compile and run scripts from canned outputs, writing
/// the same bookkeeping files the real run script writes.
struct MockRuntime {
    mounts: Mutex<HashMap<String, PathBuf>>,
    created: AtomicUsize,
    compile_output: ExecOutput,
    program_stdout: String,
    runs: Mutex<usize>,
}

impl MockRuntime {
    fn new(compile_output: ExecOutput, program_stdout: &str) -> Arc<Self> {
        Arc::new(Self {
            mounts: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            compile_output,
            program_stdout: program_stdout.to_string(),
            runs: Mutex::new(0),
        })
    }

    fn runs(&self) -> usize {
        *self.runs.lock().unwrap()
    }
}

fn output(stdout: &str, exit_code: i64) -> ExecOutput {
    ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_code: Some(exit_code),
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
        Ok(true)
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<String, RuntimeError> {
        let id = format!("mock-{}", self.created.fetch_add(1, Ordering::SeqCst));
        self.mounts
            .lock()
            .unwrap()
            .insert(id.clone(), spec.host_mount.clone());
        Ok(id)
    }

    async fn start(&self, _id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn stop(&self, _id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn kill(&self, _id: &str) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        self.mounts.lock().unwrap().remove(id);
        Ok(())
    }

    async fn exec_in(&self, id: &str, command: &ExecCommand) -> Result<ExecOutput, RuntimeError> {
        let dir = self
            .mounts
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let script = command.argv.last().cloned().unwrap_or_default();

        if script.ends_with(COMPILE_SCRIPT) {
            return Ok(self.compile_output.clone());
        }
        if script.ends_with(RUN_SCRIPT) {
            *self.runs.lock().unwrap() += 1;
            std::fs::write(dir.join(STDOUT_FILE), &self.program_stdout)?;
            std::fs::write(dir.join(EXIT_CODE_FILE), "0\n")?;
            std::fs::write(dir.join(TIMING_FILE), "0.02 0.01 0.00\n")?;
        }
        Ok(output("", 0))
    }

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError> {
        Ok(self.mounts.lock().unwrap().contains_key(id))
    }

    async fn update_resources(&self, _id: &str, _update: ResourceUpdate) -> Result<(), RuntimeError> {
        Ok(())
    }
}

fn config(dir: &TempDir) -> EngineConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    let yaml = format!(
        r#"
pool:
  min_size: 1
  max_size: 2
  work_root: {}
execution:
  async_cleanup: false
scheduler:
  workers: 2
callbacks:
  enabled: false
"#,
        dir.path().join("instances").display()
    );
    ConfigLoader::from_str(&yaml).unwrap()
}

#[tokio::test]
async fn test_python_submission_is_accepted() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new(output("", 0), "hi\n");
    let engine = Engine::builder(config(&dir), runtime.clone()).build().unwrap();
    engine.start().await.unwrap();
    assert_eq!(engine.pool_statistics().await.available, 1);

    let token = engine
        .create_submission(SubmissionRequest {
            language_id: 71,
            source_code: Some("print(\"hi\")".to_string()),
            expected_output: Some("hi".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let result = engine.execute_sync(&token).await.unwrap();

    assert_eq!(result.status, Status::Accepted);
    assert_eq!(result.stdout.as_deref(), Some("hi\n"));
    assert_eq!(engine.job_status(&token).await, JobStatus::Succeeded);

    let view = serde_json::to_value(engine.get_status(&token).await.unwrap()).unwrap();
    assert_eq!(view["status"]["id"], 3);
    assert_eq!(view["status"]["description"], "Accepted");

    let stats = engine.pool_statistics().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_compilation_error_never_runs_the_program() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new(output("main.cpp:3:1: error: 'x' was not declared\n", 1), "");
    let engine = Engine::builder(config(&dir), runtime.clone()).build().unwrap();
    engine.start().await.unwrap();

    let token = engine
        .create_submission(SubmissionRequest {
            language_id: 54,
            source_code: Some("int main() { return x; }".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    let result = engine.execute_sync(&token).await.unwrap();

    assert_eq!(result.status, Status::CompilationError);
    assert!(result.compile_output.unwrap().contains("not declared"));
    assert_eq!(runtime.runs(), 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_submission_is_never_executed() {
    let dir = TempDir::new().unwrap();
    let runtime = MockRuntime::new(output("", 0), "");
    let engine = Engine::builder(config(&dir), runtime.clone()).build().unwrap();

    let token = engine
        .create_submission(SubmissionRequest {
            language_id: 46,
            source_code: Some("echo hi".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    // Schedule before the workers exist so the job is still waiting.
    let delay = Duration::from_millis(100);
    assert_eq!(engine.schedule_delayed(&token, delay).await.unwrap().status, Status::Queued);
    assert!(engine.cancel(&token).await);

    engine.start().await.unwrap();
    tokio::time::sleep(delay * 2).await;

    assert_eq!(engine.job_status(&token).await, JobStatus::Cancelled);
    assert_eq!(engine.get_status(&token).await.unwrap().status, Status::Queued);
    assert_eq!(runtime.runs(), 0);
    engine.shutdown().await;
}
