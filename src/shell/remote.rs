use async_trait::async_trait;
use std::time::Duration;

use super::process::{LaunchSpec, ShellChannel};
use super::reader::ReadinessMode;
use super::{InteractiveSession, ReadOutcome, SessionState};
use crate::config::{BackendKind, RemoteConfig};
use crate::error::ExecError;

/// A shell on another host, driven through the system `ssh` client with a
/// forced remote pty.
pub struct RemoteSession {
    spec: LaunchSpec,
    channel: ShellChannel,
}

impl RemoteSession {
    pub fn new(config: &RemoteConfig, readiness: ReadinessMode) -> Self {
        Self {
            spec: ssh_launch_spec(config),
            channel: ShellChannel::new("remote", readiness),
        }
    }
}

fn ssh_launch_spec(config: &RemoteConfig) -> LaunchSpec {
    let mut ssh_args = vec![
        "-tt".to_string(),
        "-p".to_string(),
        config.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-o".to_string(),
        "ServerAliveInterval=15".to_string(),
    ];
    if let Some(identity) = &config.identity_file {
        ssh_args.push("-i".to_string());
        ssh_args.push(identity.display().to_string());
    }
    if config.password.is_none() {
        ssh_args.push("-o".to_string());
        ssh_args.push("BatchMode=yes".to_string());
    }
    ssh_args.push(format!("{}@{}", config.user, config.addr));

    match &config.password {
        Some(password) => LaunchSpec::new("sshpass")
            .arg("-e")
            .arg("ssh")
            .args(ssh_args)
            .env("SSHPASS", password.clone()),
        None => LaunchSpec::new("ssh").args(ssh_args),
    }
}

#[async_trait]
impl InteractiveSession for RemoteSession {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn state(&self) -> SessionState {
        self.channel.state()
    }

    async fn connect(&mut self) -> Result<(), ExecError> {
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
