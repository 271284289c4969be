//! Container runtime abstraction
//!
//! The pool and the orchestrator only talk to containers through
//! [`ContainerRuntime`]. Production uses the Docker implementation in
//! [`docker`]; tests swap in a scripted fake.

pub mod docker;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::RuntimeError;

pub use docker::DockerRuntime;

/// Everything needed to create one long-lived runtime instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub image: String,
    /// Host directory bind-mounted into the instance.
    pub host_mount: PathBuf,
    /// Mount point inside the instance; also the working directory.
    pub container_mount: String,
    pub memory_bytes: i64,
    pub pids_limit: i64,
    pub cpu_quota: i64,
    pub network_enabled: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ExecCommand {
    pub argv: Vec<String>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
}

impl ExecCommand {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            user: None,
            working_dir: None,
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Both streams, stdout first.
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        combined.push_str(&self.stderr);
        combined
    }
}

/// Per-execution resource ceiling applied to a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceUpdate {
    pub memory_bytes: Option<i64>,
    pub pids_limit: Option<i64>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check the configured image is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Create an instance and return its id. The instance is not started.
    async fn create(&self, spec: &InstanceSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn kill(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-remove the instance.
    async fn remove(&self, id: &str) -> Result<(), RuntimeError>;

    /// Run a command inside a running instance and wait for it to exit.
    async fn exec_in(&self, id: &str, command: &ExecCommand) -> Result<ExecOutput, RuntimeError>;

    /// True when the instance exists and is running.
    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError>;

    async fn update_resources(&self, id: &str, update: ResourceUpdate) -> Result<(), RuntimeError>;
}
