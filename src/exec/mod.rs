//! Request execution on top of [`crate::shell`] sessions.

mod detector;
mod hooks;
mod orchestrator;
mod registry;
#[cfg(test)]
mod testing;

pub use detector::Timeouts;
pub use hooks::{Hooks, PauseGate};
pub use orchestrator::{CodeExecutor, ExecSettings};
pub use registry::{ConfiguredFactory, SessionRegistry};
