//! Docker-backed sandbox.
//!
//! Container lifecycle and command execution go through the Docker API
//! (bollard). Image builds shell out to the Docker CLI, which owns build
//! context handling: a workspace-provided `Dockerfile` wins, then a pull of
//! the configured default image, then an embedded fallback recipe.

use crate::{ExecResult, Sandbox};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::StreamExt;
use recac_core::config::SandboxSettings;
use recac_core::{RecacError, RecacResult};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Fallback recipe used when neither a workspace Dockerfile nor the
/// configured image is available.
const FALLBACK_DOCKERFILE: &str = "\
FROM ubuntu:22.04
RUN apt-get update && apt-get install -y --no-install-recommends \\
    git curl ca-certificates build-essential python3 \\
    && rm -rf /var/lib/apt/lists/*
WORKDIR /workspace
";

/// Sandbox that runs commands inside a dedicated Docker container.
pub struct DockerSandbox {
    settings: SandboxSettings,
    workspace: PathBuf,
    project: String,
    env: Vec<String>,
    client: Docker,
    container_id: Mutex<Option<String>>,
}

impl DockerSandbox {
    /// Connect to the local Docker daemon and prepare a sandbox for the
    /// given workspace. The container itself is created lazily by
    /// [`Sandbox::ensure_ready`].
    pub fn new(
        settings: SandboxSettings,
        workspace: PathBuf,
        project: impl Into<String>,
        env: Vec<String>,
    ) -> RecacResult<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| RecacError::Sandbox(format!("cannot connect to Docker daemon: {e}")))?;
        Ok(Self {
            settings,
            workspace,
            project: project.into(),
            env,
            client,
            container_id: Mutex::new(None),
        })
    }

    fn image_tag(&self) -> String {
        format!("recac-{}", self.project)
    }

    /// Resolve the image to run: workspace build, pull, or fallback build.
    async fn ensure_image(&self) -> RecacResult<String> {
        let dockerfile = self.workspace.join("Dockerfile");
        if dockerfile.exists() {
            let tag = self.image_tag();
            info!(tag = %tag, "building sandbox image from workspace Dockerfile");
            self.build_image(&self.workspace.clone(), &tag).await?;
            return Ok(tag);
        }

        match self.pull_image(&self.settings.image).await {
            Ok(()) => Ok(self.settings.image.clone()),
            Err(e) => {
                warn!(image = %self.settings.image, error = %e, "pull failed, building fallback image");
                let tag = self.image_tag();
                let tmp = tempfile_dir()?;
                tokio::fs::write(tmp.join("Dockerfile"), FALLBACK_DOCKERFILE).await?;
                self.build_image(&tmp, &tag).await?;
                let _ = tokio::fs::remove_dir_all(&tmp).await;
                Ok(tag)
            }
        }
    }

    async fn pull_image(&self, image: &str) -> RecacResult<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(step) = stream.next().await {
            step.map_err(|e| RecacError::Sandbox(format!("pull {image} failed: {e}")))?;
        }
        Ok(())
    }

    async fn build_image(&self, context: &PathBuf, tag: &str) -> RecacResult<()> {
        let output = tokio::process::Command::new("docker")
            .args(["build", "-t", tag, "."])
            .current_dir(context)
            .output()
            .await
            .map_err(|e| RecacError::Sandbox(format!("docker build spawn failed: {e}")))?;
        if !output.status.success() {
            return Err(RecacError::Sandbox(format!(
                "docker build {tag} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

fn tempfile_dir() -> RecacResult<PathBuf> {
    let dir = std::env::temp_dir().join(format!("recac-build-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> Option<String> {
        self.container_id.try_lock().ok().and_then(|id| id.clone())
    }

    async fn ensure_ready(&self) -> RecacResult<()> {
        let mut guard = self.container_id.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let image = self.ensure_image().await?;

        let memory_bytes = (self.settings.memory_limit_mb * 1024 * 1024) as i64;
        let cpu_quota = (100_000.0 * self.settings.cpu_limit) as i64;

        let host_config = bollard::models::HostConfig {
            memory: Some(memory_bytes),
            cpu_quota: Some(cpu_quota),
            cpu_period: Some(100_000),
            binds: Some(vec![format!(
                "{}:{}",
                self.workspace.display(),
                self.settings.working_dir
            )]),
            network_mode: if self.settings.network_enabled {
                None
            } else {
                Some("none".to_string())
            },
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(image),
            working_dir: Some(self.settings.working_dir.clone()),
            env: Some(self.env.clone()),
            tty: Some(true),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let container = self
            .client
            .create_container(
                Some(CreateContainerOptions::<String> {
                    ..Default::default()
                }),
                container_config,
            )
            .await
            .map_err(|e| RecacError::Sandbox(format!("create container failed: {e}")))?;

        let id = container.id.clone();
        self.client
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RecacError::Sandbox(format!("start container failed: {e}")))?;

        info!(container_id = %id, project = %self.project, "sandbox container started");
        *guard = Some(id);
        Ok(())
    }

    async fn exec(&self, argv: &[String], timeout: Duration) -> RecacResult<ExecResult> {
        self.ensure_ready().await?;
        let guard = self.container_id.lock().await;
        let container_id = guard
            .as_ref()
            .ok_or_else(|| RecacError::Sandbox("container not running".into()))?;

        let exec_opts = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(argv.to_vec()),
            working_dir: Some(self.settings.working_dir.clone()),
            env: Some(self.env.clone()),
            ..Default::default()
        };

        let exec_created = self
            .client
            .create_exec(container_id, exec_opts)
            .await
            .map_err(|e| RecacError::Sandbox(format!("create exec failed: {e}")))?;

        let start_result = self
            .client
            .start_exec(&exec_created.id, None)
            .await
            .map_err(|e| RecacError::Sandbox(format!("start exec failed: {e}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut timed_out = false;

        if let StartExecResults::Attached { mut output, .. } = start_result {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                match tokio::time::timeout_at(deadline, output.next()).await {
                    Ok(Some(Ok(log))) => match log {
                        LogOutput::StdOut { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    },
                    Ok(Some(Err(e))) => {
                        warn!(error = %e, "error reading exec output");
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        timed_out = true;
                        break;
                    }
                }
            }
        }

        if timed_out {
            return Ok(ExecResult {
                exit_code: -1,
                stdout,
                stderr,
                timed_out: true,
            });
        }

        let inspect = self
            .client
            .inspect_exec(&exec_created.id)
            .await
            .map_err(|e| RecacError::Sandbox(format!("inspect exec failed: {e}")))?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        debug!(exit_code, stdout_len = stdout.len(), stderr_len = stderr.len(), "exec finished");

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
            timed_out: false,
        })
    }

    async fn read_file(&self, path: &str) -> RecacResult<Option<String>> {
        let argv = vec!["cat".to_string(), path.to_string()];
        let result = self.exec(&argv, Duration::from_secs(10)).await?;
        if result.success() {
            Ok(Some(result.stdout))
        } else {
            Ok(None)
        }
    }

    async fn cleanup(&self) -> RecacResult<()> {
        let mut guard = self.container_id.lock().await;
        if let Some(id) = guard.take() {
            info!(container_id = %id, "removing sandbox container");
            let _ = self
                .client
                .stop_container(&id, Some(StopContainerOptions { t: 5 }))
                .await;
            self.client
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|e| RecacError::Sandbox(format!("remove container failed: {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_dockerfile_installs_git() {
        assert!(FALLBACK_DOCKERFILE.contains("git"));
        assert!(FALLBACK_DOCKERFILE.starts_with("FROM"));
    }
}
