use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use super::process::{LaunchSpec, ShellChannel};
use super::reader::ReadinessMode;
use super::{InteractiveSession, ReadOutcome, SessionState};
use crate::config::{BackendKind, ShellConfig};
use crate::error::ExecError;

/// A shell spawned directly on this machine
pub struct LocalSession {
    spec: LaunchSpec,
    channel: ShellChannel,
}

impl LocalSession {
    pub fn new(config: &ShellConfig, readiness: ReadinessMode) -> Self {
        let program = config.program.clone().unwrap_or_else(default_shell);
        Self {
            spec: LaunchSpec::new(program).args(config.args.iter().cloned()),
            channel: ShellChannel::new("local", readiness),
        }
    }
}

/// `cmd.exe` on Windows, otherwise bash when installed, else `/bin/sh`.
fn default_shell() -> String {
    if cfg!(windows) {
        "cmd.exe".to_string()
    } else if Path::new("/bin/bash").exists() {
        "/bin/bash".to_string()
    } else {
        "/bin/sh".to_string()
    }
}

#[async_trait]
impl InteractiveSession for LocalSession {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn state(&self) -> SessionState {
        self.channel.state()
    }

    async fn connect(&mut self) -> Result<(), ExecError> {
        warn!("Local execution mode active: commands run directly on this host");
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
