//! Container runtime abstraction.
//!
//! The engine drives containers through one narrow interface: run a single
//! container with image, env, binds, and command, stream its output lines,
//! and return the exit code. The production implementation talks to a local
//! Docker daemon (`runtime/docker.rs`); tests substitute a scripted fake.

mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors that can occur while running a container.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The container daemon is not reachable.
    #[error("container daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// Pulling the image failed.
    #[error("image pull failed: {0}")]
    PullFailed(String),

    /// Creating or starting the container failed.
    #[error("container run failed: {0}")]
    RunFailed(String),

    /// Waiting for the container failed.
    #[error("container wait failed: {0}")]
    WaitFailed(String),

    /// The run context was canceled; the container was stopped and removed.
    #[error("container run canceled")]
    Canceled,
}

/// Which stream a line was read from. Ordering is guaranteed within a
/// stream, not across streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of container output, without the trailing newline.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

/// Configuration for one container invocation.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    pub image: String,
    /// Entrypoint override; empty uses the image default.
    pub entrypoint: Vec<String>,
    /// Command; empty uses the image default.
    pub cmd: Vec<String>,
    /// Environment as `K=V` lines, pre-sorted by the caller.
    pub env: Vec<String>,
    pub working_dir: String,
    /// Host binds, `host:container[:mode]`.
    pub binds: Vec<String>,
    pub privileged: bool,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    /// Runs `command` through a shell instead of the image entrypoint.
    pub fn with_shell_command(mut self, command: impl Into<String>) -> Self {
        self.entrypoint = vec!["/bin/sh".to_string(), "-c".to_string()];
        self.cmd = vec![command.into()];
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_binds(mut self, binds: Vec<String>) -> Self {
        self.binds = binds;
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }
}

/// Runs one container to completion.
///
/// Implementations must pull the image if absent, stream stdout and stderr
/// line-by-line into `lines` in stream order, honor `cancel` as a hard
/// stop, guarantee container removal on every path, and return the exit
/// code (non-zero is reported as an `Ok` value; the caller decides policy).
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(
        &self,
        cancel: CancellationToken,
        spec: ContainerSpec,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<i64, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_spec_builder() {
        let spec = ContainerSpec::new("build-1-1-c0", "busybox")
            .with_shell_command("echo hi")
            .with_env(vec!["CI=true".to_string()])
            .with_working_dir("/workspace")
            .with_binds(vec!["/tmp/ws:/workspace".to_string()])
            .privileged(false);

        assert_eq!(spec.entrypoint, vec!["/bin/sh", "-c"]);
        assert_eq!(spec.cmd, vec!["echo hi"]);
        assert_eq!(spec.working_dir, "/workspace");
        assert!(!spec.privileged);
    }

    #[test]
    fn test_default_entrypoint_is_empty() {
        let spec = ContainerSpec::new("plugin-1-1", "plugins/webhook");
        assert!(spec.entrypoint.is_empty());
        assert!(spec.cmd.is_empty());
    }
}
