//! Interactive shell sessions and the plumbing underneath them.
//!
//! - `ProcessHandle` owns one interpreter process (local shell, `ssh` client
//!   or `docker exec`) and pumps its output into a channel.
//! - `OutputReader` drains that channel without ever waiting on a line
//!   terminator.
//! - [`InteractiveSession`] is the capability set every backend variant
//!   offers; the registry and the executor only ever see this trait.

mod container;
mod heuristics;
mod local;
mod process;
mod reader;
mod remote;

pub use container::{ContainerHandle, ContainerSession};
pub use heuristics::PromptDetector;
pub use local::LocalSession;
pub use reader::ReadinessMode;
pub use remote::RemoteSession;

use async_trait::async_trait;
use std::time::Duration;

use crate::config::BackendKind;
use crate::error::ExecError;

/// Caller-chosen session identifier; 0 is the default session
pub type SessionId = u32;

/// Connectivity of a session's handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed but `connect` has not succeeded yet
    Pending,
    Connected,
    /// Terminated; the object must not be reused
    Closed,
}

/// Result of one `read` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Everything seen since the last `send` or explicit reset
    pub full_output: String,
    /// Text observed during this call, `None` when nothing arrived
    pub chunk: Option<String>,
}

/// A live, stateful channel to a command interpreter.
#[async_trait]
pub trait InteractiveSession: Send {
    fn kind(&self) -> BackendKind;

    fn state(&self) -> SessionState;

    /// Establish the underlying channel. Fails with
    /// [`ExecError::BackendUnavailable`] when nothing could be started.
    async fn connect(&mut self) -> Result<(), ExecError>;

    /// Clear the accumulated output, then write `command` plus a newline and
    /// flush.
    async fn send(&mut self, command: &str) -> Result<(), ExecError>;

    /// Collect output for at most `timeout`. With `None` or a zero duration
    /// the call waits until some output arrives or the channel ends.
    async fn read(
        &mut self,
        timeout: Option<Duration>,
        reset_accumulated: bool,
    ) -> Result<ReadOutcome, ExecError>;

    /// Terminate the channel. Calling it again is a no-op.
    async fn close(&mut self);
}
