use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use super::hooks::{Hooks, Notice};
use crate::error::ExecError;
use crate::shell::{InteractiveSession, PromptDetector, SessionId};

/// Timeout tiers for one completion wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Give up when nothing at all arrived within this window
    pub first_output: Duration,
    /// Give up when output stalls for this long
    pub between_output: Duration,
    /// Hard ceiling regardless of activity
    pub max_exec: Duration,
    /// Sleep between read attempts
    pub poll_interval: Duration,
    /// Deadline handed to each `read` call
    pub read_timeout: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            first_output: Duration::from_secs(30),
            between_output: Duration::from_secs(30),
            max_exec: Duration::from_secs(180),
            poll_interval: Duration::from_millis(100),
            read_timeout: Duration::from_secs(3),
        }
    }
}

/// Why the detector stopped waiting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// A shell prompt showed up in the tail of the output
    Prompt(String),
    MaxRuntimeExceeded,
    NoFirstOutput,
    BetweenOutputGap,
}

/// Response text plus the reason it was produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub response: String,
    pub completion: Completion,
}

/// Decides when a command is "done enough" by polling its session.
pub struct CompletionDetector<'a> {
    hooks: &'a Hooks,
    timeouts: Timeouts,
    truncate_threshold: usize,
}

impl<'a> CompletionDetector<'a> {
    pub fn new(hooks: &'a Hooks, timeouts: Timeouts, truncate_threshold: usize) -> Self {
        Self {
            hooks,
            timeouts,
            truncate_threshold,
        }
    }

    /// Poll `session` until a prompt appears or a timeout tier fires.
    ///
    /// Timeouts are successful returns with an explanatory notice attached;
    /// only connectivity failures and cancellation are errors.
    pub async fn wait(
        &self,
        session_id: SessionId,
        session: &mut dyn InteractiveSession,
        reset_full_output: bool,
    ) -> Result<Detection, ExecError> {
        let t = self.timeouts;
        let start = Instant::now();
        let mut last_output = start;
        let mut bounded = String::new();
        let mut got_output = false;
        let mut reset = reset_full_output;

        loop {
            sleep(t.poll_interval).await;
            let outcome = session.read(Some(t.read_timeout), reset).await?;
            reset = false;

            self.hooks.intervention.checkpoint().await?;

            let now = Instant::now();
            if let Some(chunk) = outcome.chunk.as_deref() {
                self.hooks.sink.chunk(session_id, chunk);
                bounded = self
                    .hooks
                    .truncator
                    .truncate(&outcome.full_output, self.truncate_threshold);
                self.hooks.sink.display(session_id, &bounded);
                last_output = now;
                got_output = true;

                if let Some(prompt) = PromptDetector::find_prompt(&bounded) {
                    info!(
                        session = session_id,
                        prompt = %prompt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "shell prompt detected, returning early"
                    );
                    return Ok(Detection {
                        response: bounded,
                        completion: Completion::Prompt(prompt),
                    });
                }
            }

            let elapsed = now - start;
            if elapsed > t.max_exec {
                return Ok(self.give_up(
                    session_id,
                    &bounded,
                    Notice::MaxTimeExceeded { timeout: t.max_exec },
                    Completion::MaxRuntimeExceeded,
                ));
            }

            if !got_output {
                if elapsed > t.first_output {
                    return Ok(self.give_up(
                        session_id,
                        "",
                        Notice::NoOutputWithin {
                            timeout: t.first_output,
                        },
                        Completion::NoFirstOutput,
                    ));
                }
            } else if now - last_output > t.between_output {
                return Ok(self.give_up(
                    session_id,
                    &bounded,
                    Notice::PausedOutput {
                        timeout: t.between_output,
                    },
                    Completion::BetweenOutputGap,
                ));
            }

            debug!(
                session = session_id,
                elapsed_ms = elapsed.as_millis() as u64,
                got_output,
                "still waiting for output"
            );
        }
    }

    fn give_up(
        &self,
        session_id: SessionId,
        bounded: &str,
        notice: Notice,
        completion: Completion,
    ) -> Detection {
        let info = self.hooks.notices.render(&notice);
        self.hooks.sink.notice(session_id, &info);

        let response = if bounded.is_empty() {
            info
        } else {
            format!("{}\n\n{}", bounded, info)
        };
        self.hooks.sink.display(session_id, &response);

        Detection {
            response,
            completion,
        }
    }
}
