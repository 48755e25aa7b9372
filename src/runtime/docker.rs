//! Docker implementation of the container runtime, built on bollard.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ContainerRuntime, ContainerSpec, OutputLine, RuntimeError};

/// Container runtime backed by the local Docker daemon.
///
/// The daemon connection is established lazily on first use; a connection
/// failure is sticky so every subsequent run reports the same error instead
/// of hammering the socket.
#[derive(Default)]
pub struct DockerRuntime {
    client: OnceCell<Result<Docker, String>>,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self) -> Result<&Docker, RuntimeError> {
        let cached = self
            .client
            .get_or_init(|| async {
                Docker::connect_with_local_defaults().map_err(|e| e.to_string())
            })
            .await;

        match cached {
            Ok(docker) => Ok(docker),
            Err(e) => Err(RuntimeError::DaemonUnavailable(e.clone())),
        }
    }

    async fn ensure_image(&self, docker: &Docker, image: &str) -> Result<(), RuntimeError> {
        if docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        debug!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| RuntimeError::PullFailed(e.to_string()))?;
        }
        Ok(())
    }

    async fn remove(&self, docker: &Docker, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(e) = docker.remove_container(name, Some(options)).await {
            warn!(container = name, error = %e, "failed to remove container");
        }
    }

    /// Streams log lines and waits for the container to exit.
    async fn stream_and_wait(
        &self,
        docker: &Docker,
        name: &str,
        lines: &mpsc::Sender<OutputLine>,
    ) -> Result<i64, RuntimeError> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        let mut logs = docker.logs(name, Some(options));

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    push_chunk(&mut stdout_buf, &message, lines, OutputLine::stdout).await;
                }
                Ok(LogOutput::StdErr { message }) => {
                    push_chunk(&mut stderr_buf, &message, lines, OutputLine::stderr).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container = name, error = %e, "log stream ended with error");
                    break;
                }
            }
        }

        // Flush partial trailing lines.
        if !stdout_buf.is_empty() {
            let _ = lines.send(OutputLine::stdout(stdout_buf)).await;
        }
        if !stderr_buf.is_empty() {
            let _ = lines.send(OutputLine::stderr(stderr_buf)).await;
        }

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = docker.wait_container(name, Some(options));
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // A non-zero exit surfaces as a wait "error" carrying the
            // status code in some daemon versions; inspect as fallback.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(RuntimeError::WaitFailed(e.to_string())),
            None => {
                let info = docker
                    .inspect_container(name, None::<InspectContainerOptions>)
                    .await
                    .map_err(|e| RuntimeError::WaitFailed(e.to_string()))?;
                let exit = info
                    .state
                    .and_then(|s| s.exit_code)
                    .ok_or_else(|| RuntimeError::WaitFailed("container has no exit code".into()))?;
                Ok(exit)
            }
        }
    }
}

/// Appends a chunk to the per-stream buffer and emits every complete line.
async fn push_chunk(
    buf: &mut String,
    message: &[u8],
    lines: &mpsc::Sender<OutputLine>,
    make: fn(String) -> OutputLine,
) {
    buf.push_str(&String::from_utf8_lossy(message));
    while let Some(pos) = buf.find('\n') {
        let line: String = buf.drain(..=pos).collect();
        let _ = lines.send(make(line.trim_end_matches('\n').to_string())).await;
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run(
        &self,
        cancel: CancellationToken,
        spec: ContainerSpec,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<i64, RuntimeError> {
        let docker = self.client().await?;

        self.ensure_image(docker, &spec.image).await?;

        let host_config = HostConfig {
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            privileged: Some(spec.privileged),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: if spec.entrypoint.is_empty() {
                None
            } else {
                Some(spec.entrypoint.clone())
            },
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            working_dir: if spec.working_dir.is_empty() {
                None
            } else {
                Some(spec.working_dir.clone())
            },
            host_config: Some(host_config),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::RunFailed(format!("create: {e}")))?;

        if let Err(e) = docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(docker, &spec.name).await;
            return Err(RuntimeError::RunFailed(format!("start: {e}")));
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(container = %spec.name, "run canceled, removing container");
                Err(RuntimeError::Canceled)
            }
            result = self.stream_and_wait(docker, &spec.name, &lines) => result,
        };

        self.remove(docker, &spec.name).await;
        result
    }
}
