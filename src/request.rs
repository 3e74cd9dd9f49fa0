use serde::{Deserialize, Serialize};

use crate::shell::SessionId;

/// What a request asks the executor to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeKind {
    Python,
    Nodejs,
    Terminal,
    /// Keep collecting output of a command that is already running
    Output,
    Reset,
}

impl RuntimeKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "python" => Some(Self::Python),
            "nodejs" => Some(Self::Nodejs),
            "terminal" => Some(Self::Terminal),
            "output" => Some(Self::Output),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Nodejs => "nodejs",
            Self::Terminal => "terminal",
            Self::Output => "output",
            Self::Reset => "reset",
        }
    }
}

/// One caller request. `runtime` stays a plain string so unknown kinds reach
/// the executor and get a descriptive answer instead of a parse error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub runtime: String,
    #[serde(default)]
    pub session: SessionId,
    #[serde(default, alias = "command")]
    pub code: String,
    #[serde(default)]
    pub reset: bool,
}

#[cfg(test)]
impl ExecRequest {
    pub fn new(runtime: &str, session: SessionId, code: &str) -> Self {
        Self {
            runtime: runtime.to_string(),
            session,
            code: code.to_string(),
            reset: false,
        }
    }

    pub fn with_reset(mut self) -> Self {
        self.reset = true;
        self
    }
}
