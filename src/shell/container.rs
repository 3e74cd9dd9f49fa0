use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::info;

use super::process::{LaunchSpec, ShellChannel};
use super::reader::ReadinessMode;
use super::{InteractiveSession, ReadOutcome, SessionState};
use crate::config::{BackendKind, ContainerConfig};
use crate::error::ExecError;

/// A running container shared by every containerized session.
#[derive(Debug)]
pub struct ContainerHandle {
    engine: String,
    name: String,
}

impl ContainerHandle {
    /// Refer to a container by name without touching the engine.
    pub fn new(engine: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            name: name.into(),
        }
    }

    /// Make sure the configured container is running: start it when stopped,
    /// create it from the image when absent.
    pub async fn ensure_running(config: &ContainerConfig) -> Result<Arc<Self>, ExecError> {
        let handle = Self::new(config.engine.clone(), config.name.clone());

        let ensured = match handle.inspect_running().await {
            Ok(Some(true)) => Ok(()),
            Ok(Some(false)) => {
                info!(container = %handle.name, "starting stopped container");
                handle.engine_cmd(&["start".to_string(), handle.name.clone()]).await
            }
            Ok(None) => {
                info!(container = %handle.name, image = %config.image, "creating container");
                handle.engine_cmd(&run_args(config)).await
            }
            Err(e) => Err(e),
        };
        ensured.map_err(|e| ExecError::BackendUnavailable(format!("{:#}", e)))?;

        Ok(Arc::new(handle))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Some(running)` when the container exists, `None` when it does not.
    async fn inspect_running(&self) -> anyhow::Result<Option<bool>> {
        let output = Command::new(&self.engine)
            .args(["inspect", "-f", "{{.State.Running}}", self.name.as_str()])
            .output()
            .await
            .with_context(|| format!("Failed to execute {} inspect", self.engine))?;

        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Some(stdout.trim() == "true"))
    }

    async fn engine_cmd(&self, args: &[String]) -> anyhow::Result<()> {
        let output = Command::new(&self.engine)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", self.engine))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} {} failed: {}", self.engine, args.join(" "), stderr.trim());
        }
        Ok(())
    }

    fn exec_spec(&self, shell: &str) -> LaunchSpec {
        LaunchSpec::new(self.engine.clone()).args(["exec", "-i", self.name.as_str(), shell])
    }
}

fn run_args(config: &ContainerConfig) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        config.name.clone(),
    ];
    for port in &config.ports {
        args.push("-p".to_string());
        args.push(port.clone());
    }
    for volume in &config.volumes {
        args.push("-v".to_string());
        args.push(volume.clone());
    }
    args.push(config.image.clone());
    // keep the container alive without a foreground workload
    args.extend(["sleep".to_string(), "infinity".to_string()]);
    args
}

/// A shell attached to the shared container through `<engine> exec -i`
pub struct ContainerSession {
    container: Arc<ContainerHandle>,
    spec: LaunchSpec,
    channel: ShellChannel,
}

impl ContainerSession {
    pub fn new(container: Arc<ContainerHandle>, shell: &str, readiness: ReadinessMode) -> Self {
        let spec = container.exec_spec(shell);
        Self {
            container,
            spec,
            channel: ShellChannel::new("container", readiness),
        }
    }
}

#[async_trait]
impl InteractiveSession for ContainerSession {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    fn state(&self) -> SessionState {
        self.channel.state()
    }

    async fn connect(&mut self) -> Result<(), ExecError> {
        info!(container = %self.container.name(), "attaching to container");
        self.channel.open(&self.spec)
    }

    async fn send(&mut self, command: &str) -> Result<(), ExecError> {
        self.channel.send(command).await
    }

    async fn read(
        &mut self,
        timeout: Option<Duration>,
        reset_accumulated: bool,
    ) -> Result<ReadOutcome, ExecError> {
        self.channel.read(timeout, reset_accumulated).await
    }

    async fn close(&mut self) {
        self.channel.close().await
    }
}
