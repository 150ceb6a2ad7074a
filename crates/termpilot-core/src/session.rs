use crate::connection::{ConnectionId, ConnectionRegistry, ConnectionStatus, LineKind, TerminalBuffer};
use crate::error::CoreError;
use crate::events::{Event, EventBus};
use crate::transport::{SessionResources, Transport};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use termpilot_ssh::RemoteEntry;
use tracing::{debug, info, warn};

pub type SessionId = String;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ActivePanel {
    #[default]
    Terminal,
    Files,
    Assistant,
}

#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    pub name: Option<String>,
    /// Open a dedicated shell and SFTP channel for the session.
    pub open_resources: bool,
}

#[derive(Clone, Debug, Default)]
pub struct SessionPatch {
    pub name: Option<String>,
    pub status: Option<ConnectionStatus>,
    pub active_panel: Option<ActivePanel>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub connection_id: ConnectionId,
    pub name: String,
    pub status: ConnectionStatus,
    pub active_panel: ActivePanel,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub has_shell: bool,
    pub has_sftp: bool,
}

struct Session {
    id: SessionId,
    connection_id: ConnectionId,
    name: String,
    status: ConnectionStatus,
    active_panel: ActivePanel,
    is_active: bool,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    output: TerminalBuffer,
    resources: Option<Arc<SessionResources>>,
}

impl Session {
    fn snapshot(&self) -> SessionSnapshot {
        let resources = self.resources.as_deref();
        SessionSnapshot {
            id: self.id.clone(),
            connection_id: self.connection_id.clone(),
            name: self.name.clone(),
            status: self.status,
            active_panel: self.active_panel,
            is_active: self.is_active,
            created_at: self.created_at,
            last_activity: self.last_activity,
            has_shell: resources.map(|r| r.shell.is_some()).unwrap_or(false),
            has_sftp: resources.map(|r| r.sftp.is_some()).unwrap_or(false),
        }
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<SessionId, Session>,
    order: Vec<SessionId>,
    by_connection: HashMap<ConnectionId, Vec<SessionId>>,
    active: Option<SessionId>,
}

impl Inner {
    fn activate(&mut self, id: &str) -> Option<SessionSnapshot> {
        if !self.sessions.contains_key(id) {
            return None;
        }
        if let Some(prev) = self.active.take() {
            if let Some(prev) = self.sessions.get_mut(&prev) {
                prev.is_active = false;
            }
        }
        let session = self.sessions.get_mut(id)?;
        session.is_active = true;
        session.last_activity = Utc::now();
        self.active = Some(id.to_string());
        Some(session.snapshot())
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    transport: Arc<dyn Transport>,
    connections: ConnectionRegistry,
    bus: EventBus,
    inner: Arc<Mutex<Inner>>,
}

impl SessionRegistry {
    pub fn new(transport: Arc<dyn Transport>, connections: ConnectionRegistry, bus: EventBus) -> Self {
        Self {
            transport,
            connections,
            bus,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    pub async fn create_session(
        &self,
        connection_id: &str,
        options: SessionOptions,
    ) -> Result<SessionSnapshot, CoreError> {
        let conn = self.connections.get(connection_id).ok_or(CoreError::NotFound)?;
        let id = new_session_id(connection_id);

        let resources = if options.open_resources {
            let opened = self
                .transport
                .open_session(&id, &conn.connect_params())
                .await
                .map_err(|e| CoreError::Ssh(e.to_string()))?;
            Some(Arc::new(opened))
        } else {
            None
        };

        let now = Utc::now();
        let (created, activated) = {
            let mut inner = self.inner.lock();
            let list = inner.by_connection.entry(connection_id.to_string()).or_default();
            let count = list.len();
            list.push(id.clone());
            let session = Session {
                id: id.clone(),
                connection_id: connection_id.to_string(),
                name: options
                    .name
                    .unwrap_or_else(|| format!("{} - 会话 {}", conn.name, count + 1)),
                status: conn.status,
                active_panel: ActivePanel::default(),
                is_active: false,
                created_at: now,
                last_activity: now,
                output: TerminalBuffer::default(),
                resources,
            };
            inner.order.push(id.clone());
            inner.sessions.insert(id.clone(), session);
            let activated = if count == 0 { inner.activate(&id) } else { None };
            let created = inner
                .sessions
                .get(&id)
                .map(Session::snapshot)
                .ok_or(CoreError::NotFound)?;
            (created, activated)
        };

        info!(connection_id = %connection_id, session_id = %id, "session created");
        self.bus.send(Event::SessionCreated(created.clone()));
        if let Some(snapshot) = activated {
            self.bus.send(Event::SessionActivated(snapshot.clone()));
            return Ok(snapshot);
        }
        Ok(created)
    }

    pub fn activate_session(&self, id: &str) -> Result<SessionSnapshot, CoreError> {
        let snapshot = self.inner.lock().activate(id).ok_or(CoreError::NotFound)?;
        debug!(session_id = %id, "session activated");
        self.bus.send(Event::SessionActivated(snapshot.clone()));
        Ok(snapshot)
    }

    /// Tears down the session's channels (shell, then SFTP, then client) and
    /// forgets it. Teardown failures are logged only.
    pub async fn close_session(&self, id: &str) -> Result<(), CoreError> {
        let resources = {
            let mut inner = self.inner.lock();
            let session = inner.sessions.get_mut(id).ok_or(CoreError::NotFound)?;
            session.resources.take()
        };
        if let Some(resources) = resources {
            teardown(id, &resources).await;
        }

        let (connection_id, replacement) = {
            let mut inner = self.inner.lock();
            let session = inner.sessions.remove(id).ok_or(CoreError::NotFound)?;
            inner.order.retain(|s| s != id);
            let mut emptied = false;
            if let Some(list) = inner.by_connection.get_mut(&session.connection_id) {
                list.retain(|s| s != id);
                emptied = list.is_empty();
            }
            if emptied {
                inner.by_connection.remove(&session.connection_id);
            }
            let mut replacement = None;
            if inner.active.as_deref() == Some(id) {
                inner.active = None;
                let next = inner
                    .by_connection
                    .get(&session.connection_id)
                    .and_then(|list| list.last().cloned())
                    .or_else(|| inner.order.last().cloned());
                if let Some(next) = next {
                    replacement = inner.activate(&next);
                }
            }
            (session.connection_id, replacement)
        };

        info!(connection_id = %connection_id, session_id = %id, "session closed");
        self.bus.send(Event::SessionClosed {
            session_id: id.to_string(),
            connection_id,
        });
        if let Some(snapshot) = replacement {
            self.bus.send(Event::SessionActivated(snapshot));
        }
        Ok(())
    }

    pub async fn close_connection_sessions(&self, connection_id: &str) -> usize {
        let ids = self
            .inner
            .lock()
            .by_connection
            .get(connection_id)
            .cloned()
            .unwrap_or_default();
        let mut closed = 0;
        for id in ids {
            match self.close_session(&id).await {
                Ok(()) => closed += 1,
                Err(err) => warn!(session_id = %id, error = %err, "session close failed"),
            }
        }
        closed
    }

    pub fn update_session(&self, id: &str, patch: SessionPatch) -> Result<SessionSnapshot, CoreError> {
        let snapshot = {
            let mut inner = self.inner.lock();
            let session = inner.sessions.get_mut(id).ok_or(CoreError::NotFound)?;
            if let Some(name) = patch.name {
                session.name = name;
            }
            if let Some(status) = patch.status {
                session.status = status;
            }
            if let Some(panel) = patch.active_panel {
                session.active_panel = panel;
            }
            session.last_activity = Utc::now();
            session.snapshot()
        };
        self.bus.send(Event::SessionUpdated(snapshot.clone()));
        Ok(snapshot)
    }

    pub fn set_connection_status(&self, connection_id: &str, status: ConnectionStatus) {
        let mut updated = Vec::new();
        {
            let mut inner = self.inner.lock();
            let ids = inner
                .by_connection
                .get(connection_id)
                .cloned()
                .unwrap_or_default();
            for id in ids {
                if let Some(session) = inner.sessions.get_mut(&id) {
                    if session.status != status {
                        session.status = status;
                        updated.push(session.snapshot());
                    }
                }
            }
        }
        for snapshot in updated {
            self.bus.send(Event::SessionUpdated(snapshot));
        }
    }

    pub async fn send_input(&self, id: &str, data: &str) -> Result<(), CoreError> {
        let resources = {
            let mut inner = self.inner.lock();
            let session = inner.sessions.get_mut(id).ok_or(CoreError::NotFound)?;
            session.last_activity = Utc::now();
            session.output.push(LineKind::Command, data.trim_end());
            session.resources.clone()
        };
        let shell = resources
            .as_deref()
            .and_then(|r| r.shell.as_deref())
            .ok_or_else(|| CoreError::Invalid(format!("session {id} has no shell")))?;
        shell
            .write(data.as_bytes())
            .await
            .map_err(|e| CoreError::Ssh(e.to_string()))
    }

    pub async fn list_directory(&self, id: &str, path: &str) -> Result<Vec<RemoteEntry>, CoreError> {
        let resources = {
            let inner = self.inner.lock();
            inner
                .sessions
                .get(id)
                .ok_or(CoreError::NotFound)?
                .resources
                .clone()
        };
        let sftp = resources
            .as_deref()
            .and_then(|r| r.sftp.as_deref())
            .ok_or_else(|| CoreError::Invalid(format!("session {id} has no sftp channel")))?;
        sftp.read_dir(path)
            .await
            .map_err(|e| CoreError::Ssh(e.to_string()))
    }

    pub fn push_line(&self, id: &str, kind: LineKind, content: impl Into<String>) {
        if let Some(session) = self.inner.lock().sessions.get_mut(id) {
            session.output.push(kind, content);
        }
    }

    pub fn output_len(&self, id: &str) -> usize {
        self.inner
            .lock()
            .sessions
            .get(id)
            .map(|s| s.output.len())
            .unwrap_or(0)
    }

    pub fn get_session(&self, id: &str) -> Option<SessionSnapshot> {
        self.inner.lock().sessions.get(id).map(Session::snapshot)
    }

    pub fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.sessions.get(id))
            .map(Session::snapshot)
            .collect()
    }

    pub fn connection_sessions(&self, connection_id: &str) -> Vec<SessionSnapshot> {
        let inner = self.inner.lock();
        inner
            .by_connection
            .get(connection_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.sessions.get(id))
                    .map(Session::snapshot)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn active_session(&self) -> Option<SessionSnapshot> {
        let inner = self.inner.lock();
        inner
            .active
            .as_ref()
            .and_then(|id| inner.sessions.get(id))
            .map(Session::snapshot)
    }
}

async fn teardown(id: &str, resources: &SessionResources) {
    if let Some(shell) = &resources.shell {
        if let Err(err) = shell.end().await {
            debug!(session_id = %id, error = %err, "shell end failed");
        }
        shell.destroy().await;
    }
    if let Some(sftp) = &resources.sftp {
        if let Err(err) = sftp.end().await {
            warn!(session_id = %id, error = %err, "sftp close failed");
        }
    }
    if let Some(client) = &resources.client {
        if let Err(err) = client.end().await {
            warn!(session_id = %id, error = %err, "client close failed");
        }
    }
}

fn new_session_id(connection_id: &str) -> SessionId {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("{connection_id}-{}-{suffix}", Utc::now().timestamp_millis())
}
