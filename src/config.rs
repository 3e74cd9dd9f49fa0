use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::exec::Timeouts;
use crate::shell::ReadinessMode;

/// Environment variable pointing at an explicit config file
pub const CONFIG_ENV: &str = "AGENT_SHELL_CONFIG";

/// Which mechanism realizes a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// A shell spawned on this machine
    #[default]
    Local,
    /// A shell on another host, reached through the `ssh` client
    Remote,
    /// A shell attached to a shared container
    #[serde(alias = "docker")]
    Container,
}

impl BackendKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "local" => Some(Self::Local),
            "remote" | "ssh" => Some(Self::Remote),
            "container" | "docker" => Some(Self::Container),
            _ => None,
        }
    }
}

/// Top-level configuration, read once per registry (re-)initialization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    pub backend: BackendKind,
    pub shell: ShellConfig,
    pub remote: RemoteConfig,
    pub container: ContainerConfig,
    pub timeouts: TimeoutConfig,
    /// Missing fields fall back to [`TimeoutConfig::for_output_polling`]
    #[serde(deserialize_with = "output_timeouts")]
    pub output_timeouts: TimeoutConfig,
    pub interpreters: InterpreterConfig,
    pub truncate_threshold: TruncateThreshold,
    /// Force a readiness strategy instead of the platform default
    pub readiness: Option<ReadinessMode>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            shell: ShellConfig::default(),
            remote: RemoteConfig::default(),
            container: ContainerConfig::default(),
            timeouts: TimeoutConfig::default(),
            output_timeouts: TimeoutConfig::for_output_polling(),
            interpreters: InterpreterConfig::default(),
            truncate_threshold: TruncateThreshold::default(),
            readiness: None,
        }
    }
}

/// Local shell launch settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Shell binary; platform default when unset
    pub program: Option<String>,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub addr: String,
    pub port: u16,
    pub user: String,
    /// Handed to `sshpass` through the environment when present
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            addr: "localhost".to_string(),
            port: 55022,
            user: "root".to_string(),
            password: None,
            identity_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// `docker` or a compatible CLI such as `podman`
    pub engine: String,
    pub name: String,
    pub image: String,
    /// `host:container` port mappings
    pub ports: Vec<String>,
    /// `host:container` volume mappings
    pub volumes: Vec<String>,
    pub shell: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            engine: "docker".to_string(),
            name: "agent-shell-exe".to_string(),
            image: "debian:stable-slim".to_string(),
            ports: Vec::new(),
            volumes: Vec::new(),
            shell: "/bin/bash".to_string(),
        }
    }
}

/// Timeout tiers as they appear on disk
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub first_output_secs: f64,
    pub between_output_secs: f64,
    pub max_exec_secs: f64,
    pub poll_interval_ms: u64,
    pub read_timeout_secs: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            first_output_secs: 30.0,
            between_output_secs: 30.0,
            max_exec_secs: 180.0,
            poll_interval_ms: 100,
            read_timeout_secs: 3.0,
        }
    }
}

impl TimeoutConfig {
    /// Defaults used when polling a command that is already running
    pub fn for_output_polling() -> Self {
        Self {
            first_output_secs: 60.0,
            between_output_secs: 5.0,
            ..Self::default()
        }
    }

    pub fn to_timeouts(&self) -> Timeouts {
        Timeouts {
            first_output: secs(self.first_output_secs),
            between_output: secs(self.between_output_secs),
            max_exec: secs(self.max_exec_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            read_timeout: secs(self.read_timeout_secs),
        }
    }
}

/// A timeout section where every field is optional, laid over a base
#[derive(Debug, Deserialize)]
struct TimeoutOverrides {
    first_output_secs: Option<f64>,
    between_output_secs: Option<f64>,
    max_exec_secs: Option<f64>,
    poll_interval_ms: Option<u64>,
    read_timeout_secs: Option<f64>,
}

impl TimeoutOverrides {
    fn apply(self, base: TimeoutConfig) -> TimeoutConfig {
        TimeoutConfig {
            first_output_secs: self.first_output_secs.unwrap_or(base.first_output_secs),
            between_output_secs: self.between_output_secs.unwrap_or(base.between_output_secs),
            max_exec_secs: self.max_exec_secs.unwrap_or(base.max_exec_secs),
            poll_interval_ms: self.poll_interval_ms.unwrap_or(base.poll_interval_ms),
            read_timeout_secs: self.read_timeout_secs.unwrap_or(base.read_timeout_secs),
        }
    }
}

fn output_timeouts<'de, D>(deserializer: D) -> std::result::Result<TimeoutConfig, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let overrides = TimeoutOverrides::deserialize(deserializer)?;
    Ok(overrides.apply(TimeoutConfig::for_output_polling()))
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// One-shot interpreter invocations; the quoted code is appended
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    pub python: String,
    pub nodejs: String,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            python: "ipython -c".to_string(),
            nodejs: "node /exe/node_eval.js".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TruncateThreshold(pub usize);

impl Default for TruncateThreshold {
    fn default() -> Self {
        Self(10_000)
    }
}

impl ExecConfig {
    /// Load from `$AGENT_SHELL_CONFIG` or `~/.agent-shell/config.json`,
    /// then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };

        if let Ok(value) = std::env::var("AGENT_SHELL_BACKEND") {
            match BackendKind::parse(&value) {
                Some(kind) => config.backend = kind,
                None => anyhow::bail!("Unknown AGENT_SHELL_BACKEND value: {}", value),
            }
        }

        let local_execution = std::env::var("AGENT_SHELL_LOCAL_EXECUTION")
            .ok()
            .map(|v| parse_flag(&v));
        let dockerized = std::env::var("AGENT_SHELL_DOCKERIZED")
            .map(|v| parse_flag(&v))
            .unwrap_or(false);
        config.apply_local_execution(local_execution, dockerized);

        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// A host-side `local_execution` request disables the remote sandbox.
    /// Inside a container the sandbox flag is left alone.
    pub fn apply_local_execution(&mut self, local_execution: Option<bool>, dockerized: bool) {
        if dockerized {
            return;
        }
        if local_execution == Some(true) && self.backend == BackendKind::Remote {
            self.backend = BackendKind::Local;
        }
    }

    pub fn readiness(&self) -> ReadinessMode {
        self.readiness.unwrap_or_else(ReadinessMode::for_platform)
    }
}

fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs::home_dir().map(|home| home.join(".agent-shell").join("config.json"))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
