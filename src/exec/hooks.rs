//! Narrow interfaces to the collaborators around the executor: the
//! intervention checkpoint, output truncation, informational notices and the
//! streaming sink. Each has a default implementation good enough for the
//! standalone binary.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::error::ExecError;
use crate::shell::SessionId;

/// Cooperative pause/cancel point polled by long-running loops
#[async_trait]
pub trait Intervention: Send + Sync {
    /// Wait while paused; fail with [`ExecError::Cancelled`] when cancelled.
    async fn checkpoint(&self) -> Result<(), ExecError>;
}

/// Bounds cumulative output for display and for the response
pub trait Truncator: Send + Sync {
    fn truncate(&self, text: &str, threshold: usize) -> String;
}

/// Events that turn into caller-facing prose
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    MaxTimeExceeded { timeout: Duration },
    NoOutputWithin { timeout: Duration },
    PausedOutput { timeout: Duration },
    Reset { session: SessionId },
    NoOutput,
    UnknownRuntime { runtime: String },
}

pub trait Notices: Send + Sync {
    fn render(&self, notice: &Notice) -> String;
}

/// Live observer of command output
pub trait OutputSink: Send + Sync {
    /// A new chunk arrived
    fn chunk(&self, session: SessionId, text: &str);
    /// The bounded display form changed
    fn display(&self, session: SessionId, text: &str);
    /// A timeout or reset notice was produced
    fn notice(&self, session: SessionId, text: &str);
}

/// Bundle of collaborators handed to the executor
#[derive(Clone)]
pub struct Hooks {
    pub intervention: Arc<dyn Intervention>,
    pub truncator: Arc<dyn Truncator>,
    pub notices: Arc<dyn Notices>,
    pub sink: Arc<dyn OutputSink>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            intervention: Arc::new(PauseGate::new()),
            truncator: Arc::new(HeadTailTruncator),
            notices: Arc::new(DefaultNotices),
            sink: Arc::new(TracingSink),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Running,
    Paused,
    Cancelled,
}

/// Intervention checkpoint that can be paused, resumed and cancelled from
/// another task.
#[derive(Clone)]
pub struct PauseGate {
    tx: Arc<watch::Sender<GateState>>,
}

impl PauseGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GateState::Running);
        Self { tx: Arc::new(tx) }
    }

    pub fn pause(&self) {
        self.set(GateState::Paused);
    }

    pub fn resume(&self) {
        self.set(GateState::Running);
    }

    /// Cancellation is final; later pauses and resumes are ignored.
    pub fn cancel(&self) {
        self.tx.send_replace(GateState::Cancelled);
    }

    fn set(&self, state: GateState) {
        self.tx.send_if_modified(|current| {
            if *current == GateState::Cancelled || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Intervention for PauseGate {
    async fn checkpoint(&self) -> Result<(), ExecError> {
        let mut rx = self.tx.subscribe();
        let state = *rx
            .wait_for(|state| *state != GateState::Paused)
            .await
            .map_err(|_| ExecError::Cancelled)?;
        match state {
            GateState::Cancelled => Err(ExecError::Cancelled),
            _ => Ok(()),
        }
    }
}

/// Keeps the head and the tail of oversized output
pub struct HeadTailTruncator;

impl Truncator for HeadTailTruncator {
    fn truncate(&self, text: &str, threshold: usize) -> String {
        let total = text.chars().count();
        if total <= threshold {
            return text.to_string();
        }

        let head_len = threshold / 2;
        let tail_len = threshold - head_len;
        let head_end = text
            .char_indices()
            .nth(head_len)
            .map(|(i, _)| i)
            .unwrap_or(text.len());
        let tail_start = text
            .char_indices()
            .nth(total - tail_len)
            .map(|(i, _)| i)
            .unwrap_or(text.len());

        format!(
            "{}\n\n... {} characters skipped ...\n\n{}",
            &text[..head_end],
            total - threshold,
            &text[tail_start..]
        )
    }
}

/// Plain English notices wrapped as system information
pub struct DefaultNotices;

impl Notices for DefaultNotices {
    fn render(&self, notice: &Notice) -> String {
        let info = match notice {
            Notice::MaxTimeExceeded { timeout } => format!(
                "Returning control to agent after {} seconds of execution. Process is still running. Decide whether to wait for more output with the output runtime or reset the session.",
                timeout.as_secs_f64()
            ),
            Notice::NoOutputWithin { timeout } => format!(
                "No output returned within {} seconds after execution. Process is still running. Decide whether to wait for more output with the output runtime or reset the session.",
                timeout.as_secs_f64()
            ),
            Notice::PausedOutput { timeout } => format!(
                "Returning control to agent after {} seconds with no new output. Process is still running. Decide whether to wait for more output with the output runtime or reset the session.",
                timeout.as_secs_f64()
            ),
            Notice::Reset { session } => format!("Terminal session {} has been reset.", session),
            Notice::NoOutput => "Code execution returned no output.".to_string(),
            Notice::UnknownRuntime { runtime } => format!(
                "Unknown runtime '{}'. Use one of: python, nodejs, terminal, output, reset.",
                runtime
            ),
        };
        format!("[SYSTEM: {}]", info)
    }
}

/// Streams output into the tracing subscriber
pub struct TracingSink;

impl OutputSink for TracingSink {
    fn chunk(&self, session: SessionId, text: &str) {
        debug!(session, bytes = text.len(), chunk = %text, "output");
    }

    fn display(&self, session: SessionId, text: &str) {
        trace!(session, bytes = text.len(), "display updated");
    }

    fn notice(&self, session: SessionId, text: &str) {
        warn!(session, "{}", text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_gate_passes_when_running() {
        let gate = PauseGate::new();
        assert!(gate.checkpoint().await.is_ok());
    }

    #[tokio::test]
    async fn test_gate_blocks_until_resumed() {
        let gate = PauseGate::new();
        gate.pause();

        let blocked = timeout(Duration::from_millis(100), gate.checkpoint()).await;
        assert!(blocked.is_err(), "checkpoint should wait while paused");

        let resumer = gate.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            resumer.resume();
        });
        let resumed = timeout(Duration::from_secs(2), gate.checkpoint()).await;
        assert!(matches!(resumed, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_cancel_releases_paused_checkpoint() {
        let gate = PauseGate::new();
        gate.pause();

        let canceller = gate.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let result = timeout(Duration::from_secs(2), gate.checkpoint()).await;
        assert!(matches!(result, Ok(Err(ExecError::Cancelled))));

        gate.resume();
        assert!(matches!(gate.checkpoint().await, Err(ExecError::Cancelled)));
    }

    #[test]
    fn test_truncator_keeps_short_text() {
        assert_eq!(HeadTailTruncator.truncate("short", 10), "short");
    }

    #[test]
    fn test_truncator_keeps_head_and_tail() {
        let text = format!("{}{}", "a".repeat(50), "z".repeat(50));
        let out = HeadTailTruncator.truncate(&text, 20);

        assert!(out.starts_with(&"a".repeat(10)));
        assert!(out.ends_with(&"z".repeat(10)));
        assert!(out.contains("80 characters skipped"));
    }

    #[test]
    fn test_truncator_respects_char_boundaries() {
        let text = "é".repeat(30);
        let out = HeadTailTruncator.truncate(&text, 10);
        assert!(out.starts_with(&"é".repeat(5)));
        assert!(out.ends_with(&"é".repeat(5)));
    }

    #[test]
    fn test_notices_are_wrapped() {
        let text = DefaultNotices.render(&Notice::UnknownRuntime {
            runtime: "bogus".to_string(),
        });
        assert!(text.starts_with("[SYSTEM: "));
        assert!(text.contains("'bogus'"));
    }
}
