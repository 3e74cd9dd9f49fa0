//! Scripted sessions and factories standing in for real backends.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::registry::SessionFactory;
use crate::config::BackendKind;
use crate::error::ExecError;
use crate::shell::{ContainerHandle, InteractiveSession, ReadOutcome, SessionId, SessionState};

/// What a scripted session does on one `read`
#[derive(Debug, Clone)]
pub enum Step {
    Emit(String),
    Quiet,
    /// The backend dies; this and every later call fails with `ConnectionLost`
    Drop,
}

impl Step {
    pub fn emit(text: &str) -> Self {
        Step::Emit(text.to_string())
    }
}

/// Everything callers did to a scripted session
#[derive(Debug, Default)]
pub struct SessionLog {
    pub sent: Vec<String>,
    pub connects: usize,
    pub closes: usize,
}

pub struct ScriptedSession {
    state: SessionState,
    full_output: String,
    steps: VecDeque<Step>,
    tail: Step,
    dropped: bool,
    fail_connect: bool,
    log: Arc<Mutex<SessionLog>>,
}

impl ScriptedSession {
    /// Replays `steps`, then repeats `tail` forever.
    pub fn new(steps: Vec<Step>, tail: Step) -> Self {
        Self {
            state: SessionState::Pending,
            full_output: String::new(),
            steps: steps.into(),
            tail,
            dropped: false,
            fail_connect: false,
            log: Arc::new(Mutex::new(SessionLog::default())),
        }
    }

    pub fn log(&self) -> Arc<Mutex<SessionLog>> {
        self.log.clone()
    }

    fn lost() -> ExecError {
        ExecError::ConnectionLost("scripted backend died".to_string())
    }
}

#[async_trait]
impl InteractiveSession for ScriptedSession {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), ExecError> {
        if self.fail_connect {
            return Err(ExecError::BackendUnavailable("scripted refusal".to_string()));
        }
        if self.state == SessionState::Closed {
            return Err(ExecError::NotConnected);
        }
        self.state = SessionState::Connected;
        self.log.lock().unwrap().connects += 1;
        Ok(())
    }

    async fn send(&mut self, command: &str) -> Result<(), ExecError> {
        if self.state != SessionState::Connected {
            return Err(ExecError::NotConnected);
        }
        if self.dropped {
            return Err(Self::lost());
        }
        self.full_output.clear();
        self.log.lock().unwrap().sent.push(command.to_string());
        Ok(())
    }

    async fn read(
        &mut self,
        _timeout: Option<Duration>,
        reset_accumulated: bool,
    ) -> Result<ReadOutcome, ExecError> {
        if self.state == SessionState::Closed {
            return Err(ExecError::NotConnected);
        }
        if reset_accumulated {
            self.full_output.clear();
        }
        if self.dropped {
            return Err(Self::lost());
        }

        let step = self.steps.pop_front().unwrap_or_else(|| self.tail.clone());
        let chunk = match step {
            Step::Emit(text) => {
                self.full_output.push_str(&text);
                Some(text)
            }
            Step::Quiet => None,
            Step::Drop => {
                self.dropped = true;
                return Err(Self::lost());
            }
        };

        Ok(ReadOutcome {
            full_output: self.full_output.clone(),
            chunk,
        })
    }

    async fn close(&mut self) {
        if self.state != SessionState::Closed {
            self.log.lock().unwrap().closes += 1;
        }
        self.state = SessionState::Closed;
    }
}

/// Script for one session built by [`ScriptedFactory`]
#[derive(Debug, Clone)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub tail: Step,
    pub fail_connect: bool,
}

impl Plan {
    pub fn new(steps: Vec<Step>, tail: Step) -> Self {
        Self {
            steps,
            tail,
            fail_connect: false,
        }
    }

    /// A shell that answers every command with a prompt
    pub fn prompt() -> Self {
        Self::new(Vec::new(), Step::emit("ok\nuser@host:~$ "))
    }

    pub fn refusing() -> Self {
        Self {
            fail_connect: true,
            ..Self::new(Vec::new(), Step::Quiet)
        }
    }
}

/// Hands out scripted sessions: queued plans first, then the default plan.
pub struct ScriptedFactory {
    plans: Mutex<VecDeque<Plan>>,
    default_plan: Plan,
    containerized: bool,
    containers: AtomicUsize,
    built: Mutex<Vec<(SessionId, bool, Arc<Mutex<SessionLog>>)>>,
}

impl ScriptedFactory {
    pub fn new(default_plan: Plan) -> Self {
        Self {
            plans: Mutex::new(VecDeque::new()),
            default_plan,
            containerized: false,
            containers: AtomicUsize::new(0),
            built: Mutex::new(Vec::new()),
        }
    }

    pub fn with_plans(plans: Vec<Plan>, default_plan: Plan) -> Self {
        let factory = Self::new(default_plan);
        factory.plans.lock().unwrap().extend(plans);
        factory
    }

    pub fn containerized(mut self) -> Self {
        self.containerized = true;
        self
    }

    /// Session ids in build order
    pub fn builds(&self) -> Vec<SessionId> {
        self.built.lock().unwrap().iter().map(|(id, _, _)| *id).collect()
    }

    /// How many sessions received the shared container
    pub fn builds_with_container(&self) -> usize {
        self.built.lock().unwrap().iter().filter(|(_, c, _)| *c).count()
    }

    pub fn containers_provisioned(&self) -> usize {
        self.containers.load(Ordering::SeqCst)
    }

    /// Logs of every session built for `id`, oldest first
    pub fn logs_for(&self, id: SessionId) -> Vec<Arc<Mutex<SessionLog>>> {
        self.built
            .lock()
            .unwrap()
            .iter()
            .filter(|(built_id, _, _)| *built_id == id)
            .map(|(_, _, log)| log.clone())
            .collect()
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn provision_container(&self) -> Result<Option<Arc<ContainerHandle>>, ExecError> {
        if !self.containerized {
            return Ok(None);
        }
        self.containers.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Arc::new(ContainerHandle::new("docker", "scripted"))))
    }

    fn build(
        &self,
        id: SessionId,
        container: Option<&Arc<ContainerHandle>>,
    ) -> Result<Box<dyn InteractiveSession>, ExecError> {
        let plan = self
            .plans
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_plan.clone());

        let mut session = ScriptedSession::new(plan.steps, plan.tail);
        session.fail_connect = plan.fail_connect;
        self.built
            .lock()
            .unwrap()
            .push((id, container.is_some(), session.log()));
        Ok(Box::new(session))
    }
}
