use tracing::{debug, info, warn};

use super::detector::{CompletionDetector, Timeouts};
use super::hooks::{Hooks, Notice};
use super::registry::SessionRegistry;
use crate::config::{ExecConfig, InterpreterConfig};
use crate::error::ExecError;
use crate::request::{ExecRequest, RuntimeKind};
use crate::shell::SessionId;

/// Knobs the executor needs from the configuration
#[derive(Debug, Clone)]
pub struct ExecSettings {
    /// Used after sending a command
    pub timeouts: Timeouts,
    /// Used by the `output` runtime
    pub output_timeouts: Timeouts,
    pub interpreters: InterpreterConfig,
    pub truncate_threshold: usize,
}

impl ExecSettings {
    pub fn from_config(config: &ExecConfig) -> Self {
        Self {
            timeouts: config.timeouts.to_timeouts(),
            output_timeouts: config.output_timeouts.to_timeouts(),
            interpreters: config.interpreters.clone(),
            truncate_threshold: config.truncate_threshold.0,
        }
    }
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self::from_config(&ExecConfig::default())
    }
}

/// Entry point for requests: picks the runtime, drives the session and
/// hands back the response text.
pub struct CodeExecutor {
    registry: SessionRegistry,
    settings: ExecSettings,
    hooks: Hooks,
}

impl CodeExecutor {
    pub fn new(registry: SessionRegistry, settings: ExecSettings, hooks: Hooks) -> Self {
        Self {
            registry,
            settings,
            hooks,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Close every session; the executor stays usable and reconnects lazily.
    pub async fn shutdown(&mut self) {
        self.registry.reset(None).await;
    }

    /// Handle one request. Timeouts and unknown runtimes come back as
    /// ordinary text; errors mean the request could not be served even after
    /// the retry.
    pub async fn execute(&mut self, request: &ExecRequest) -> Result<String, ExecError> {
        self.hooks.intervention.checkpoint().await?;

        let Some(kind) = RuntimeKind::parse(&request.runtime) else {
            warn!(runtime = %request.runtime, "unknown runtime requested");
            return Ok(self.hooks.notices.render(&Notice::UnknownRuntime {
                runtime: request.runtime.clone(),
            }));
        };

        let session = request.session;
        info!(
            runtime = kind.as_str(),
            session,
            reset = request.reset,
            "executing request"
        );

        let interpreters = &self.settings.interpreters;
        let response = match kind {
            RuntimeKind::Python => {
                let command = interpreter_command(&interpreters.python, &request.code);
                self.run_command(session, &command, request.reset).await?
            }
            RuntimeKind::Nodejs => {
                let command = interpreter_command(&interpreters.nodejs, &request.code);
                self.run_command(session, &command, request.reset).await?
            }
            RuntimeKind::Terminal => self.run_command(session, &request.code, request.reset).await?,
            RuntimeKind::Output => self.poll_output(session).await?,
            RuntimeKind::Reset => self.reset_session(session).await?,
        };

        if response.trim().is_empty() {
            return Ok(self.hooks.notices.render(&Notice::NoOutput));
        }
        Ok(response)
    }

    /// Send `command` and wait for completion, retrying once after a full
    /// reset when the backend turns out to be unreachable.
    async fn run_command(
        &mut self,
        session: SessionId,
        command: &str,
        reset: bool,
    ) -> Result<String, ExecError> {
        if reset {
            self.registry.reset(Some(session)).await;
        }

        let mut retried = false;
        loop {
            match self.send_and_wait(session, command).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_connectivity() && !retried => {
                    warn!(
                        session,
                        error = %e,
                        "connection problem, resetting all sessions and retrying"
                    );
                    retried = true;
                    self.registry.reset(None).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_and_wait(
        &mut self,
        session: SessionId,
        command: &str,
    ) -> Result<String, ExecError> {
        self.registry.prepare().await?;
        let shell = self.registry.ensure(session).await?;

        debug!(session, command = %command, "sending command");
        shell.send(command).await?;

        let detector = CompletionDetector::new(
            &self.hooks,
            self.settings.timeouts,
            self.settings.truncate_threshold,
        );
        let detection = detector.wait(session, shell, true).await?;
        debug!(session, completion = ?detection.completion, "command finished");
        Ok(detection.response)
    }

    /// Keep collecting output of whatever is already running in `session`.
    async fn poll_output(&mut self, session: SessionId) -> Result<String, ExecError> {
        self.registry.prepare().await?;
        let shell = self.registry.ensure(session).await?;

        let detector = CompletionDetector::new(
            &self.hooks,
            self.settings.output_timeouts,
            self.settings.truncate_threshold,
        );
        let detection = detector.wait(session, shell, true).await?;
        Ok(detection.response)
    }

    async fn reset_session(&mut self, session: SessionId) -> Result<String, ExecError> {
        self.registry.reset(Some(session)).await;
        self.registry.prepare().await?;

        let text = self.hooks.notices.render(&Notice::Reset { session });
        self.hooks.sink.notice(session, &text);
        Ok(text)
    }
}

fn interpreter_command(prefix: &str, code: &str) -> String {
    format!("{} {}", prefix, shell_words::quote(code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::hooks::{DefaultNotices, Intervention, Notices, PauseGate};
    use crate::exec::registry::SessionFactory;
    use crate::exec::testing::{Plan, ScriptedFactory, Step};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast_settings() -> ExecSettings {
        let timeouts = Timeouts {
            first_output: Duration::from_millis(300),
            between_output: Duration::from_millis(300),
            max_exec: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            read_timeout: Duration::from_millis(10),
        };
        ExecSettings {
            timeouts,
            output_timeouts: timeouts,
            ..ExecSettings::default()
        }
    }

    async fn executor(factory: &Arc<ScriptedFactory>) -> CodeExecutor {
        let registry = SessionRegistry::open(factory.clone() as Arc<dyn SessionFactory>)
            .await
            .unwrap();
        CodeExecutor::new(registry, fast_settings(), Hooks::default())
    }

    fn sent(factory: &ScriptedFactory, id: SessionId) -> Vec<String> {
        factory
            .logs_for(id)
            .iter()
            .flat_map(|log| log.lock().unwrap().sent.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_terminal_command_returns_output() {
        let factory = Arc::new(ScriptedFactory::new(Plan::prompt()));
        let mut exec = executor(&factory).await;

        let response = exec
            .execute(&ExecRequest::new("terminal", 0, "ls"))
            .await
            .unwrap();

        assert_eq!(response, "ok\nuser@host:~$ ");
        assert_eq!(sent(&factory, 0), vec!["ls"]);
    }

    #[tokio::test]
    async fn test_unknown_runtime_leaves_registry_alone() {
        let factory = Arc::new(ScriptedFactory::new(Plan::prompt()));
        let mut exec = executor(&factory).await;
        exec.execute(&ExecRequest::new("terminal", 1, "pwd"))
            .await
            .unwrap();
        let ids_before = exec.registry().ids();
        let builds_before = factory.builds();

        let response = exec
            .execute(&ExecRequest::new("bogus", 4, "whatever"))
            .await
            .unwrap();

        assert!(response.contains("Unknown runtime 'bogus'"));
        assert_eq!(exec.registry().ids(), ids_before);
        assert_eq!(factory.builds(), builds_before);
        assert_eq!(sent(&factory, 1), vec!["pwd"]);
    }

    #[tokio::test]
    async fn test_connection_loss_retries_once() {
        let factory = Arc::new(ScriptedFactory::with_plans(
            vec![Plan::new(vec![Step::Drop], Step::Quiet)],
            Plan::prompt(),
        ));
        let mut exec = executor(&factory).await;

        let response = exec
            .execute(&ExecRequest::new("terminal", 0, "make"))
            .await
            .unwrap();

        assert_eq!(response, "ok\nuser@host:~$ ");
        assert_eq!(factory.builds(), vec![0, 0]);
        assert_eq!(sent(&factory, 0), vec!["make", "make"]);
        assert_eq!(factory.logs_for(0)[0].lock().unwrap().closes, 1);
    }

    #[tokio::test]
    async fn test_second_connection_loss_is_fatal() {
        let dying = Plan::new(vec![Step::Drop], Step::Quiet);
        let factory = Arc::new(ScriptedFactory::new(dying));
        let mut exec = executor(&factory).await;

        let result = exec.execute(&ExecRequest::new("terminal", 0, "make")).await;

        assert!(matches!(result, Err(ExecError::ConnectionLost(_))));
        assert_eq!(sent(&factory, 0), vec!["make", "make"]);
        assert_eq!(factory.builds(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_interpreter_code_is_quoted() {
        let factory = Arc::new(ScriptedFactory::new(Plan::prompt()));
        let mut exec = executor(&factory).await;

        exec.execute(&ExecRequest::new("python", 0, "print('hi there')"))
            .await
            .unwrap();
        exec.execute(&ExecRequest::new("nodejs", 0, "console.log(1)"))
            .await
            .unwrap();

        let commands = sent(&factory, 0);
        assert!(commands[0].starts_with("ipython -c '"));
        assert_eq!(
            shell_words::split(&commands[0]).unwrap(),
            vec!["ipython", "-c", "print('hi there')"]
        );
        assert_eq!(
            shell_words::split(&commands[1]).unwrap(),
            vec!["node", "/exe/node_eval.js", "console.log(1)"]
        );
    }

    #[tokio::test]
    async fn test_output_runtime_does_not_send() {
        let factory = Arc::new(ScriptedFactory::new(Plan::new(
            vec![Step::emit("still compiling\n")],
            Step::Quiet,
        )));
        let mut exec = executor(&factory).await;

        let response = exec
            .execute(&ExecRequest::new("output", 0, ""))
            .await
            .unwrap();

        assert!(response.starts_with("still compiling\n"));
        assert!(response.contains("with no new output"));
        assert!(sent(&factory, 0).is_empty());
    }

    #[tokio::test]
    async fn test_silent_session_reports_notice() {
        let factory = Arc::new(ScriptedFactory::new(Plan::new(Vec::new(), Step::Quiet)));
        let mut exec = executor(&factory).await;

        let response = exec
            .execute(&ExecRequest::new("terminal", 0, "sleep 100"))
            .await
            .unwrap();

        assert!(response.starts_with("[SYSTEM: No output returned within"));
    }

    struct QuietResets;

    impl Notices for QuietResets {
        fn render(&self, notice: &Notice) -> String {
            match notice {
                Notice::Reset { .. } => String::new(),
                Notice::NoOutput => "nothing to report".to_string(),
                other => DefaultNotices.render(other),
            }
        }
    }

    #[tokio::test]
    async fn test_empty_response_becomes_no_output_notice() {
        let factory = Arc::new(ScriptedFactory::new(Plan::prompt()));
        let registry = SessionRegistry::open(factory.clone() as Arc<dyn SessionFactory>)
            .await
            .unwrap();
        let hooks = Hooks {
            notices: Arc::new(QuietResets),
            ..Hooks::default()
        };
        let mut exec = CodeExecutor::new(registry, fast_settings(), hooks);

        let response = exec
            .execute(&ExecRequest::new("reset", 0, ""))
            .await
            .unwrap();

        assert_eq!(response, "nothing to report");
    }

    #[tokio::test]
    async fn test_reset_request_resets_only_that_session() {
        let factory = Arc::new(ScriptedFactory::new(Plan::prompt()));
        let mut exec = executor(&factory).await;
        for id in [1, 2] {
            exec.execute(&ExecRequest::new("terminal", id, "pwd"))
                .await
                .unwrap();
        }

        let response = exec
            .execute(&ExecRequest::new("reset", 2, ""))
            .await
            .unwrap();

        assert_eq!(response, "[SYSTEM: Terminal session 2 has been reset.]");
        assert_eq!(exec.registry().ids(), vec![0, 1]);
        assert_eq!(factory.logs_for(2)[0].lock().unwrap().closes, 1);
        assert_eq!(factory.logs_for(1)[0].lock().unwrap().closes, 0);
    }

    #[tokio::test]
    async fn test_reset_flag_replaces_session_before_sending() {
        let factory = Arc::new(ScriptedFactory::new(Plan::prompt()));
        let mut exec = executor(&factory).await;
        exec.execute(&ExecRequest::new("terminal", 1, "cd /tmp"))
            .await
            .unwrap();

        exec.execute(&ExecRequest::new("terminal", 1, "pwd").with_reset())
            .await
            .unwrap();

        let logs = factory.logs_for(1);
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].lock().unwrap().sent, vec!["cd /tmp"]);
        assert_eq!(logs[1].lock().unwrap().sent, vec!["pwd"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let factory = Arc::new(ScriptedFactory::new(Plan::prompt()));
        let registry = SessionRegistry::open(factory.clone() as Arc<dyn SessionFactory>)
            .await
            .unwrap();
        let gate = PauseGate::new();
        let hooks = Hooks {
            intervention: Arc::new(gate.clone()) as Arc<dyn Intervention>,
            ..Hooks::default()
        };
        let mut exec = CodeExecutor::new(registry, fast_settings(), hooks);
        gate.cancel();

        let result = exec.execute(&ExecRequest::new("terminal", 0, "ls")).await;

        assert!(matches!(result, Err(ExecError::Cancelled)));
        assert!(sent(&factory, 0).is_empty());
    }
}
