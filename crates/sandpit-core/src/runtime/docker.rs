// src/runtime/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, ContainerUpdateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::time::Duration;

use super::{ContainerRuntime, ExecCommand, ExecOutput, InstanceSpec, ResourceUpdate};
use crate::errors::RuntimeError;

/// Keeps the instance alive between executions.
const IDLE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }
    )
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<String, RuntimeError> {
        let host_path = spec
            .host_mount
            .to_str()
            .ok_or_else(|| RuntimeError::Failed("Invalid host mount path".to_string()))?;

        let options = Some(CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let host_config = HostConfig {
            binds: Some(vec![format!("{}:{}", host_path, spec.container_mount)]),
            memory: Some(spec.memory_bytes),
            memory_swap: Some(spec.memory_bytes),
            cpu_quota: Some(spec.cpu_quota),
            pids_limit: Some(spec.pids_limit),
            network_mode: Some(if spec.network_enabled { "bridge" } else { "none" }.to_string()),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            ..Default::default()
        };

        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(IDLE_COMMAND.iter().map(|s| s.to_string()).collect()),
            working_dir: Some(spec.container_mount.clone()),
            network_disabled: Some(!spec.network_enabled),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self.docker.create_container(options, config).await?;
        for warning in &response.warnings {
            log::warn!("Docker warning while creating {}: {}", spec.name, warning);
        }
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: Some(grace.as_secs() as i32),
            ..Default::default()
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Err(RuntimeError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .kill_container(id, None::<KillContainerOptions>)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Err(RuntimeError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn exec_in(&self, id: &str, command: &ExecCommand) -> Result<ExecOutput, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(command.argv.clone()),
                    user: command.user.clone(),
                    working_dir: command.working_dir.clone(),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        match self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk? {
                        LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message))
                        }
                        LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message))
                        }
                        _ => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(RuntimeError::Failed(format!(
                    "Exec in {} started detached",
                    id
                )));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code,
        })
    }

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError> {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_resources(&self, id: &str, update: ResourceUpdate) -> Result<(), RuntimeError> {
        let body = ContainerUpdateBody {
            memory: update.memory_bytes,
            memory_swap: update.memory_bytes,
            pids_limit: update.pids_limit,
            ..Default::default()
        };
        self.docker.update_container(id, body).await?;
        Ok(())
    }
}
