use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::reader::{ChannelSource, OutputReader, ReadinessMode};
use super::{ReadOutcome, SessionState};
use crate::error::ExecError;

const PUMP_BUFFER_SIZE: usize = 4096;
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Program, arguments and extra environment for one interpreter process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Owns one interpreter process. stdout and stderr are pumped by background
/// tasks into a single [`ChannelSource`] so reads never block the caller.
pub struct ProcessHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    source: ChannelSource,
    pumps: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Spawn the process with all three standard streams piped.
    pub fn spawn(spec: &LaunchSpec) -> Result<Self, ExecError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecError::BackendUnavailable(format!("{}: {}", spec.program, e)))?;

        let stdin = child.stdin.take();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, tx.clone())));
        }
        drop(tx);

        debug!(program = %spec.program, pid = ?child.id(), "process spawned");

        Ok(Self {
            child,
            stdin,
            source: ChannelSource::new(rx),
            pumps,
        })
    }

    /// Write bytes to the process and flush.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ExecError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ExecError::ConnectionLost("stdin closed".to_string()))?;
        stdin
            .write_all(data)
            .await
            .map_err(|e| ExecError::ConnectionLost(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| ExecError::ConnectionLost(e.to_string()))
    }

    pub fn source_mut(&mut self) -> &mut ChannelSource {
        &mut self.source
    }

    /// Kill the process and wait briefly for it to exit.
    pub async fn terminate(&mut self) {
        self.stdin.take();
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "kill failed, process probably exited already");
        }
        match tokio::time::timeout(EXIT_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "process exited"),
            Ok(Err(e)) => warn!(error = %e, "failed to reap process"),
            Err(_) => warn!("process did not exit within grace period"),
        }
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
    }
}

/// Forward whatever the stream yields, chunk by chunk, until it ends.
async fn pump<R>(mut stream: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; PUMP_BUFFER_SIZE];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "output stream failed");
                break;
            }
        }
    }
}

/// Session core shared by every process-backed variant: the handle, the
/// reader, the accumulated output and the connectivity state.
pub struct ShellChannel {
    label: &'static str,
    handle: Option<ProcessHandle>,
    reader: OutputReader,
    full_output: String,
    state: SessionState,
    /// End of channel has been observed
    ended: bool,
}

impl ShellChannel {
    pub fn new(label: &'static str, readiness: ReadinessMode) -> Self {
        Self {
            label,
            handle: None,
            reader: OutputReader::new(readiness),
            full_output: String::new(),
            state: SessionState::Pending,
            ended: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn open(&mut self, spec: &LaunchSpec) -> Result<(), ExecError> {
        match self.state {
            SessionState::Connected => return Ok(()),
            SessionState::Closed => return Err(ExecError::NotConnected),
            SessionState::Pending => {}
        }

        let handle = ProcessHandle::spawn(spec)?;
        self.handle = Some(handle);
        self.state = SessionState::Connected;
        info!(
            backend = self.label,
            program = %spec.program,
            readiness = ?self.reader.mode(),
            "shell connected"
        );
        Ok(())
    }

    pub async fn send(&mut self, command: &str) -> Result<(), ExecError> {
        if self.state != SessionState::Connected {
            return Err(ExecError::NotConnected);
        }
        if self.ended {
            return Err(ExecError::ConnectionLost(format!(
                "{} shell has exited",
                self.label
            )));
        }

        self.full_output.clear();
        debug!(backend = self.label, command, "sending command");
        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\n');
        let handle = self.handle.as_mut().ok_or(ExecError::NotConnected)?;
        handle.write(line.as_bytes()).await
    }

    pub async fn read(
        &mut self,
        timeout: Option<Duration>,
        reset_accumulated: bool,
    ) -> Result<ReadOutcome, ExecError> {
        if self.state != SessionState::Connected {
            return Err(ExecError::NotConnected);
        }
        if reset_accumulated {
            self.full_output.clear();
        }
        if self.ended {
            return Err(ExecError::ConnectionLost(format!(
                "{} shell has exited",
                self.label
            )));
        }

        let handle = self.handle.as_mut().ok_or(ExecError::NotConnected)?;
        let report = self
            .reader
            .read(handle.source_mut(), &mut self.full_output, timeout)
            .await;

        if report.eof {
            self.ended = true;
            warn!(backend = self.label, "shell output ended");
            if report.chunk.is_none() {
                return Err(ExecError::ConnectionLost(format!(
                    "{} shell output ended",
                    self.label
                )));
            }
        }

        Ok(ReadOutcome {
            full_output: self.full_output.clone(),
            chunk: report.chunk,
        })
    }

    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(mut handle) = self.handle.take() {
            handle.terminate().await;
        }
        self.state = SessionState::Closed;
        info!(backend = self.label, "shell closed");
    }
}
