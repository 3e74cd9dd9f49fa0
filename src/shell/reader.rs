use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout as with_timeout, Instant};
use tracing::debug;

/// How long one readiness poll may wait before the deadline is rechecked
pub const POLL_SLICE: Duration = Duration::from_millis(100);

/// Result of a single non-blocking read attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Vec<u8>),
    /// Nothing buffered right now; more may come later
    Empty,
    /// The channel is gone and will never produce more bytes
    Eof,
}

/// A byte stream that can be polled for readiness and read without blocking.
#[async_trait]
pub trait OutputSource: Send {
    /// Wait up to `wait` for output to become available. `true` means a
    /// following [`try_read`](Self::try_read) will not report `Empty`.
    async fn wait_ready(&mut self, wait: Duration) -> bool;

    /// Take whatever is buffered right now without waiting.
    fn try_read(&mut self) -> io::Result<Chunk>;

    /// Zero-timeout readiness check.
    fn has_buffered(&mut self) -> bool;
}

/// Strategy for deciding when a read is worth attempting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessMode {
    /// Trust the source's readiness notification
    Notify,
    /// Assume data may be ready, attempt the read and treat an empty result
    /// as "not yet"
    Optimistic,
}

impl ReadinessMode {
    /// Pipe readiness is unreliable on Windows, so reads are attempted blindly
    /// there.
    pub fn for_platform() -> Self {
        if cfg!(windows) {
            ReadinessMode::Optimistic
        } else {
            ReadinessMode::Notify
        }
    }
}

/// What one [`OutputReader::read`] call observed
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReadReport {
    /// Text decoded during this call, if any
    pub chunk: Option<String>,
    /// The source reported end of channel
    pub eof: bool,
}

/// Incremental reader that drains a source without waiting on line
/// terminators, so an unflushed prompt like `$ ` is returned as soon as it
/// is buffered.
pub struct OutputReader {
    mode: ReadinessMode,
    poll_slice: Duration,
    /// Incomplete UTF-8 sequence carried over to the next read
    carry: Vec<u8>,
}

impl OutputReader {
    pub fn new(mode: ReadinessMode) -> Self {
        Self {
            mode,
            poll_slice: POLL_SLICE,
            carry: Vec::new(),
        }
    }

    pub fn mode(&self) -> ReadinessMode {
        self.mode
    }

    /// Poll `source` until `deadline` elapses (or, without a deadline, until
    /// something arrives), appending every drained chunk to `full_output`.
    /// A zero deadline counts as no deadline. End of channel stops the loop
    /// immediately.
    pub async fn read<S>(
        &mut self,
        source: &mut S,
        full_output: &mut String,
        deadline: Option<Duration>,
    ) -> ReadReport
    where
        S: OutputSource + ?Sized,
    {
        let deadline = deadline.filter(|limit| !limit.is_zero());
        let start = Instant::now();
        let mut new_text = String::new();
        let mut eof = false;

        loop {
            let wait = match deadline {
                Some(limit) => {
                    let elapsed = start.elapsed();
                    if elapsed >= limit {
                        break;
                    }
                    (limit - elapsed).min(self.poll_slice)
                }
                None => self.poll_slice,
            };

            let ready = match self.mode {
                ReadinessMode::Notify => source.wait_ready(wait).await,
                ReadinessMode::Optimistic => true,
            };

            if ready {
                eof = self.drain(source, &mut new_text, full_output);
                if eof {
                    break;
                }
                if self.mode == ReadinessMode::Optimistic && !source.has_buffered() {
                    sleep(wait).await;
                }
            }

            if deadline.is_none() && !new_text.is_empty() {
                break;
            }
        }

        if eof && !self.carry.is_empty() {
            let tail = String::from_utf8_lossy(&self.carry).into_owned();
            self.carry.clear();
            new_text.push_str(&tail);
            full_output.push_str(&tail);
        }

        debug!(
            bytes = new_text.len(),
            eof,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "read finished"
        );

        ReadReport {
            chunk: (!new_text.is_empty()).then_some(new_text),
            eof,
        }
    }

    /// Take everything currently buffered. Returns `true` on end of channel.
    fn drain<S>(&mut self, source: &mut S, new_text: &mut String, full_output: &mut String) -> bool
    where
        S: OutputSource + ?Sized,
    {
        loop {
            match source.try_read() {
                Ok(Chunk::Data(bytes)) => {
                    let text = decode_utf8(&mut self.carry, &bytes);
                    new_text.push_str(&text);
                    full_output.push_str(&text);
                }
                Ok(Chunk::Empty) => return false,
                Ok(Chunk::Eof) => return true,
                Err(err) => {
                    // A flaky read must not end a long monitoring session
                    debug!(error = %err, "read attempt failed, treating as no data");
                    return false;
                }
            }

            if !source.has_buffered() {
                return false;
            }
        }
    }
}

/// Decode `bytes` after any carried-over prefix, holding back a trailing
/// incomplete sequence. Invalid bytes become U+FFFD.
fn decode_utf8(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    let mut out = String::new();
    let mut rest: &[u8] = carry;

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                rest = &[];
                break;
            }
            Err(err) => {
                let (valid, after) = rest.split_at(err.valid_up_to());
                // valid_up_to guarantees this prefix is UTF-8
                out.push_str(&String::from_utf8_lossy(valid));
                match err.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    }
                    None => {
                        rest = after;
                        break;
                    }
                }
            }
        }
    }

    let remaining = rest.to_vec();
    *carry = remaining;
    out
}

/// Output source fed by background pump tasks through an unbounded channel.
/// The channel closing (every pump finished) is end of channel.
pub struct ChannelSource {
    rx: UnboundedReceiver<Vec<u8>>,
    pending: VecDeque<Vec<u8>>,
    closed: bool,
}

impl ChannelSource {
    pub fn new(rx: UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: VecDeque::new(),
            closed: false,
        }
    }
}

#[async_trait]
impl OutputSource for ChannelSource {
    async fn wait_ready(&mut self, wait: Duration) -> bool {
        if !self.pending.is_empty() || self.closed {
            return true;
        }
        match with_timeout(wait, self.rx.recv()).await {
            Ok(Some(bytes)) => {
                self.pending.push_back(bytes);
                true
            }
            Ok(None) => {
                self.closed = true;
                true
            }
            Err(_) => false,
        }
    }

    fn try_read(&mut self) -> io::Result<Chunk> {
        if let Some(bytes) = self.pending.pop_front() {
            return Ok(Chunk::Data(bytes));
        }
        if self.closed {
            return Ok(Chunk::Eof);
        }
        match self.rx.try_recv() {
            Ok(bytes) => Ok(Chunk::Data(bytes)),
            Err(TryRecvError::Empty) => Ok(Chunk::Empty),
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                Ok(Chunk::Eof)
            }
        }
    }

    fn has_buffered(&mut self) -> bool {
        if !self.pending.is_empty() || self.closed {
            return true;
        }
        match self.rx.try_recv() {
            Ok(bytes) => {
                self.pending.push_back(bytes);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                self.closed = true;
                true
            }
        }
    }
}
