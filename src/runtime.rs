//! Container runtime interface and the docker CLI implementation.
//!
//! Nothing here assumes docker specifically beyond a handful of verbs:
//! `run -d` (printing the new container ID), `wait`, `logs -f`, `rm`,
//! `rm -v`, `ps`, `ps -a --filter=status=exited`, and `load` reading an
//! image tarball from stdin. The trait exists so the scheduler, worker
//! lifecycle, and reapers can run against an in-memory runtime in tests.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tokio::process::Command;

use crate::error::{CoordinatorError, Result};

/// Output streams of a container whose logs are being followed, plus the
/// follower process itself so it can be reaped once the streams are drained.
pub struct LogStreams {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    child: Option<tokio::process::Child>,
}

impl LogStreams {
    pub fn from_child(mut child: tokio::process::Child) -> Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoordinatorError::Runtime("log follower stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CoordinatorError::Runtime("log follower stderr not piped".to_string()))?;
        Ok(Self {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            child: Some(child),
        })
    }

    /// Streams backed by fixed buffers. Test runtimes use this.
    pub fn from_buffers(stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        Self {
            stdout: Box::new(std::io::Cursor::new(stdout)),
            stderr: Box::new(std::io::Cursor::new(stderr)),
            child: None,
        }
    }

    /// Reaps the follower process, if any. Call after draining both streams.
    pub async fn finish(self) -> Result<()> {
        if let Some(mut child) = self.child {
            child.wait().await?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Starts a detached container and returns its identifier.
    async fn run_detached(&self, args: &[String]) -> Result<String>;

    /// Blocks until the container exits and returns its exit code.
    async fn wait(&self, container: &str) -> Result<i64>;

    /// Follows the container's output until it exits.
    async fn follow_logs(&self, container: &str) -> Result<LogStreams>;

    async fn remove(&self, container: &str) -> Result<()>;

    /// Removes a container together with its volumes.
    async fn remove_with_volumes(&self, container: &str) -> Result<()>;

    /// Number of running containers whose image starts with `image_prefix`.
    async fn running_image_count(&self, image_prefix: &str) -> Result<usize>;

    /// Identifiers of containers in the exited state.
    async fn exited_containers(&self) -> Result<Vec<String>>;

    /// Pipes an image tarball into the runtime's image store.
    async fn load_image(&self, tarball: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()>;
}

/// The local `docker` command line.
pub struct DockerCli;

impl DockerCli {
    async fn docker(args: &[&str]) -> Result<std::process::Output> {
        Ok(Command::new("docker").args(args).output().await?)
    }

    fn fail(verb: &str, out: &std::process::Output) -> CoordinatorError {
        let stderr = String::from_utf8_lossy(&out.stderr);
        CoordinatorError::Runtime(format!("docker {verb}: {}", stderr.trim()))
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn run_detached(&self, args: &[String]) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.arg("run").arg("-d").args(args);
        let out = cmd.output().await?;
        if !out.status.success() {
            return Err(Self::fail("run", &out));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    async fn wait(&self, container: &str) -> Result<i64> {
        let out = Self::docker(&["wait", container]).await?;
        if !out.status.success() {
            return Err(Self::fail("wait", &out));
        }
        let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
        text.parse::<i64>().map_err(|_| {
            CoordinatorError::Runtime(format!("docker wait {container}: unexpected output {text:?}"))
        })
    }

    async fn follow_logs(&self, container: &str) -> Result<LogStreams> {
        let child = Command::new("docker")
            .args(["logs", "-f", container])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        LogStreams::from_child(child)
    }

    async fn remove(&self, container: &str) -> Result<()> {
        let out = Self::docker(&["rm", container]).await?;
        if !out.status.success() {
            return Err(Self::fail("rm", &out));
        }
        Ok(())
    }

    async fn remove_with_volumes(&self, container: &str) -> Result<()> {
        let out = Self::docker(&["rm", "-v", container]).await?;
        if !out.status.success() {
            return Err(Self::fail("rm -v", &out));
        }
        Ok(())
    }

    async fn running_image_count(&self, image_prefix: &str) -> Result<usize> {
        let out = Self::docker(&["ps"]).await?;
        if !out.status.success() {
            return Err(Self::fail("ps", &out));
        }
        let text = String::from_utf8_lossy(&out.stdout);
        Ok(text
            .lines()
            .skip(1) // column headers
            .filter(|line| {
                line.split_whitespace()
                    .any(|field| field.starts_with(image_prefix))
            })
            .count())
    }

    async fn exited_containers(&self) -> Result<Vec<String>> {
        let out =
            Self::docker(&["ps", "-a", "--filter=status=exited", "--no-trunc", "-q"]).await?;
        if !out.status.success() {
            return Err(Self::fail("ps -a", &out));
        }
        let text = String::from_utf8_lossy(&out.stdout);
        Ok(text.split_whitespace().map(str::to_string).collect())
    }

    async fn load_image(&self, tarball: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()> {
        let mut child = Command::new("docker")
            .arg("load")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CoordinatorError::Runtime("docker load stdin not piped".to_string()))?;
        tokio::io::copy(tarball, &mut stdin).await?;
        drop(stdin); // close so the load sees EOF
        let out = child.wait_with_output().await?;
        if !out.status.success() {
            return Err(Self::fail("load", &out));
        }
        Ok(())
    }
}
