use crate::error::CoreError;
use crate::metrics::{LoadAverage, SystemMetrics};
use crate::transport::{AuthMethod, ConnectParams};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

pub type ConnectionId = String;

pub const OUTPUT_CAPACITY: usize = 1000;
pub const OUTPUT_RETAIN: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Failed,
    Disconnected,
    Cancelled,
}

impl ConnectionStatus {
    /// Edges of the connection state machine. Terminal states only leave
    /// through a fresh connect attempt.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Cancelled)
                | (Connected, Disconnected)
                | (Failed, Connecting)
                | (Disconnected, Connecting)
                | (Cancelled, Connecting)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Failed => "failed",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct SessionData {
    pub id: ConnectionId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineKind {
    Command,
    Output,
    Error,
    Info,
    Success,
    Warning,
}

#[derive(Clone, Debug)]
pub struct TerminalLine {
    pub kind: LineKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only output buffer. On overflow only the newest
/// [`OUTPUT_RETAIN`] lines survive.
#[derive(Clone, Debug, Default)]
pub struct TerminalBuffer {
    lines: VecDeque<TerminalLine>,
}

impl TerminalBuffer {
    pub fn push(&mut self, kind: LineKind, content: impl Into<String>) {
        self.lines.push_back(TerminalLine {
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        });
        if self.lines.len() > OUTPUT_CAPACITY {
            let excess = self.lines.len() - OUTPUT_RETAIN;
            self.lines.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> impl Iterator<Item = &TerminalLine> {
        self.lines.iter()
    }

    pub fn last(&self) -> Option<&TerminalLine> {
        self.lines.back()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SystemInfo {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    /// Bytes per second since the previous sample.
    pub network_down_rate: f64,
    pub network_up_rate: f64,
    pub load_average: LoadAverage,
    pub process_count: u32,
    pub timestamp: i64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NetworkSample {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub timestamp: i64,
}

#[derive(Clone, Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
    pub status: ConnectionStatus,
    pub connect_step: Option<String>,
    pub error_message: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub output: TerminalBuffer,
    pub system_info: Option<SystemInfo>,
    pub network_history: Option<NetworkSample>,
}

impl Connection {
    pub fn new(data: SessionData) -> Self {
        Self {
            id: data.id,
            name: data.name,
            host: data.host,
            port: data.port,
            username: data.username,
            auth: data.auth,
            status: ConnectionStatus::Connecting,
            connect_step: None,
            error_message: None,
            connected_at: None,
            output: TerminalBuffer::default(),
            system_info: None,
            network_history: None,
        }
    }

    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            auth: self.auth.clone(),
        }
    }

    pub fn transition(&mut self, next: ConnectionStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Folds a fresh sample into `system_info`, deriving network rates from
    /// the previous cumulative counters.
    pub fn apply_metrics(&mut self, metrics: &SystemMetrics) -> SystemInfo {
        let (down, up) = match self.network_history {
            Some(prev) if metrics.timestamp > prev.timestamp => {
                let secs = (metrics.timestamp - prev.timestamp) as f64;
                (
                    metrics.network_down.saturating_sub(prev.rx_bytes) as f64 / secs,
                    metrics.network_up.saturating_sub(prev.tx_bytes) as f64 / secs,
                )
            }
            Some(_) => self
                .system_info
                .as_ref()
                .map(|i| (i.network_down_rate, i.network_up_rate))
                .unwrap_or((0.0, 0.0)),
            None => (0.0, 0.0),
        };
        if self
            .network_history
            .map(|prev| metrics.timestamp > prev.timestamp)
            .unwrap_or(true)
        {
            self.network_history = Some(NetworkSample {
                rx_bytes: metrics.network_down,
                tx_bytes: metrics.network_up,
                timestamp: metrics.timestamp,
            });
        }
        let info = SystemInfo {
            cpu: metrics.cpu,
            memory: metrics.memory,
            disk: metrics.disk,
            network_down_rate: down,
            network_up_rate: up,
            load_average: metrics.load_average,
            process_count: metrics.process_count,
            timestamp: metrics.timestamp,
        };
        self.system_info = Some(info.clone());
        info
    }
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, Connection>,
    order: Vec<ConnectionId>,
    active: Option<ConnectionId>,
}

/// Shared table of live connections. All writes go through these methods.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces; a replaced id keeps its position in the order.
    pub fn insert(&self, conn: Connection) {
        let mut inner = self.inner.write();
        if !inner.connections.contains_key(&conn.id) {
            inner.order.push(conn.id.clone());
        }
        inner.connections.insert(conn.id.clone(), conn);
    }

    pub fn get(&self, id: &str) -> Option<Connection> {
        self.inner.read().connections.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().connections.contains_key(id)
    }

    pub fn status(&self, id: &str) -> Option<ConnectionStatus> {
        self.inner.read().connections.get(id).map(|c| c.status)
    }

    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        self.inner.write().connections.get_mut(id).map(f)
    }

    pub fn transition(&self, id: &str, next: ConnectionStatus) -> Result<(), CoreError> {
        self.update(id, |c| c.transition(next))
            .unwrap_or(Err(CoreError::NotFound))
    }

    pub fn push_line(&self, id: &str, kind: LineKind, content: impl Into<String>) {
        let content = content.into();
        self.update(id, |c| c.output.push(kind, content));
    }

    /// Removes the connection; if it was active, the most recently added
    /// survivor becomes active.
    pub fn remove(&self, id: &str) -> Option<Connection> {
        let mut inner = self.inner.write();
        let removed = inner.connections.remove(id)?;
        inner.order.retain(|c| c != id);
        if inner.active.as_deref() == Some(id) {
            inner.active = inner.order.last().cloned();
        }
        Some(removed)
    }

    pub fn active(&self) -> Option<ConnectionId> {
        self.inner.read().active.clone()
    }

    pub fn set_active(&self, id: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.write();
        if !inner.connections.contains_key(id) {
            return Err(CoreError::NotFound);
        }
        inner.active = Some(id.to_string());
        Ok(())
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.inner.read().order.clone()
    }

    pub fn list(&self) -> Vec<Connection> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.connections.get(id).cloned())
            .collect()
    }
}
