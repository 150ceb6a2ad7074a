use crate::agent::ToolCallRecord;
use crate::connection::{ConnectionId, ConnectionStatus, SystemInfo};
use crate::session::{SessionId, SessionSnapshot};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Clone, Debug)]
pub enum Event {
    ConnectionStatusChanged {
        connection_id: ConnectionId,
        status: ConnectionStatus,
    },
    MetricsUpdated {
        connection_id: ConnectionId,
        info: SystemInfo,
    },
    IdleWarning {
        connection_id: ConnectionId,
        remaining: Duration,
        message: String,
    },
    IdleTimeout {
        connection_id: ConnectionId,
        idle: Duration,
        message: String,
    },
    SessionCreated(SessionSnapshot),
    SessionActivated(SessionSnapshot),
    SessionUpdated(SessionSnapshot),
    SessionClosed {
        session_id: SessionId,
        connection_id: ConnectionId,
    },
    ToolStarted(ToolCallRecord),
    ToolCompleted(ToolCallRecord),
    ToolFailed(ToolCallRecord),
    Notification {
        level: NotificationLevel,
        message: String,
    },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    sender: tokio::sync::broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn send(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        self.send(Event::Notification {
            level,
            message: message.into(),
        });
    }
}
