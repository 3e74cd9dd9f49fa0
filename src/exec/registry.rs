use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{BackendKind, ExecConfig};
use crate::error::ExecError;
use crate::shell::{
    ContainerHandle, ContainerSession, InteractiveSession, LocalSession, RemoteSession,
    SessionId, SessionState,
};

/// The session that always exists after [`SessionRegistry::prepare`]
pub const DEFAULT_SESSION: SessionId = 0;

/// Builds unconnected sessions of whatever kind the configuration selects.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Container shared by containerized sessions, `None` for other kinds.
    async fn provision_container(&self) -> Result<Option<Arc<ContainerHandle>>, ExecError>;

    fn build(
        &self,
        id: SessionId,
        container: Option<&Arc<ContainerHandle>>,
    ) -> Result<Box<dyn InteractiveSession>, ExecError>;
}

/// Factory driven by [`ExecConfig`]
pub struct ConfiguredFactory {
    config: ExecConfig,
}

impl ConfiguredFactory {
    pub fn new(config: ExecConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for ConfiguredFactory {
    async fn provision_container(&self) -> Result<Option<Arc<ContainerHandle>>, ExecError> {
        if self.config.backend != BackendKind::Container {
            return Ok(None);
        }
        ContainerHandle::ensure_running(&self.config.container)
            .await
            .map(Some)
    }

    fn build(
        &self,
        _id: SessionId,
        container: Option<&Arc<ContainerHandle>>,
    ) -> Result<Box<dyn InteractiveSession>, ExecError> {
        let readiness = self.config.readiness();
        let session: Box<dyn InteractiveSession> = match self.config.backend {
            BackendKind::Local => Box::new(LocalSession::new(&self.config.shell, readiness)),
            BackendKind::Remote => Box::new(RemoteSession::new(&self.config.remote, readiness)),
            BackendKind::Container => {
                let container = container.ok_or_else(|| {
                    ExecError::BackendUnavailable("container has not been provisioned".to_string())
                })?;
                Box::new(ContainerSession::new(
                    container.clone(),
                    &self.config.container.shell,
                    readiness,
                ))
            }
        };
        Ok(session)
    }
}

/// Maps session ids to live sessions, plus the shared container handle.
///
/// Mutation goes through `&mut self`, so inserts, replacements and removals
/// are never observed half-done. Serializing commands on one id is up to
/// the caller.
pub struct SessionRegistry {
    factory: Arc<dyn SessionFactory>,
    sessions: HashMap<SessionId, Box<dyn InteractiveSession>>,
    container: Option<Arc<ContainerHandle>>,
    container_provisioned: bool,
}

impl SessionRegistry {
    /// Create a registry and connect the default session right away.
    pub async fn open(factory: Arc<dyn SessionFactory>) -> Result<Self, ExecError> {
        let mut registry = Self {
            factory,
            sessions: HashMap::new(),
            container: None,
            container_provisioned: false,
        };
        registry.prepare().await?;
        Ok(registry)
    }

    /// Make sure the default session exists.
    pub async fn prepare(&mut self) -> Result<(), ExecError> {
        self.ensure(DEFAULT_SESSION).await.map(|_| ())
    }

    /// Return the session for `id`, creating and connecting it if absent.
    /// A closed session is replaced by a fresh one.
    pub async fn ensure(&mut self, id: SessionId) -> Result<&mut dyn InteractiveSession, ExecError> {
        let stale = self
            .sessions
            .get(&id)
            .is_some_and(|session| session.state() != SessionState::Connected);
        if stale {
            if let Some(mut old) = self.sessions.remove(&id) {
                debug!(session = id, "replacing closed session");
                old.close().await;
            }
        }

        if !self.sessions.contains_key(&id) {
            let session = self.create(id).await?;
            self.sessions.insert(id, session);
        }

        match self.sessions.get_mut(&id) {
            Some(session) => Ok(session.as_mut()),
            None => Err(ExecError::NotConnected),
        }
    }

    #[cfg(test)]
    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut dyn InteractiveSession> {
        match self.sessions.get_mut(&id) {
            Some(session) => Some(session.as_mut()),
            None => None,
        }
    }

    #[cfg(test)]
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Live session ids in ascending order
    #[cfg(test)]
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub fn container(&self) -> Option<&Arc<ContainerHandle>> {
        self.container.as_ref()
    }

    /// Close and forget one session, or with `None` every session and the
    /// shared container reference.
    pub async fn reset(&mut self, id: Option<SessionId>) {
        match id {
            Some(id) => {
                if let Some(mut session) = self.sessions.remove(&id) {
                    session.close().await;
                    info!(session = id, "session reset");
                }
            }
            None => {
                let sessions = std::mem::take(&mut self.sessions);
                let count = sessions.len();
                for (_, mut session) in sessions {
                    session.close().await;
                }
                self.container = None;
                self.container_provisioned = false;
                info!(sessions = count, "all sessions reset");
            }
        }
    }

    async fn create(&mut self, id: SessionId) -> Result<Box<dyn InteractiveSession>, ExecError> {
        if !self.container_provisioned {
            self.container = self.factory.provision_container().await?;
            self.container_provisioned = true;
        }

        let mut session = self.factory.build(id, self.container.as_ref())?;
        session.connect().await?;
        info!(session = id, kind = ?session.kind(), "session created");
        Ok(session)
    }
}
