pub mod agent;
pub mod bridge;
pub mod chat;
pub mod connection;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod session;
pub mod store;
pub mod transport;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use agent::{
    AssistantOrchestrator, AssistantReply, ToolCallLedger, ToolCallRecord, ToolCallStats,
    ToolCallStatus,
};
pub use bridge::{CommandBridge, CommandOrigin, CommandResult, ExecuteOptions};
pub use chat::{ChatBackend, ChatMessage, OpenAiClient};
pub use connection::{
    Connection, ConnectionId, ConnectionRegistry, ConnectionStatus, LineKind, SessionData,
    SystemInfo, TerminalLine,
};
pub use error::CoreError;
pub use events::{Event, EventBus, NotificationLevel};
pub use lifecycle::ConnectionManager;
pub use metrics::{parse_batch_output, SystemMetrics};
pub use pool::{ConnectionPool, PoolEntry, PoolStatus};
pub use session::{ActivePanel, SessionId, SessionOptions, SessionPatch, SessionRegistry, SessionSnapshot};
pub use store::{SavedSession, SessionStore, StoredAuth};
pub use transport::{AuthMethod, ConnectParams, RusshTransport, Transport};
pub use watchdog::{IdleSettings, IdleStatus, IdleWatchdog, WatchdogEvent};
