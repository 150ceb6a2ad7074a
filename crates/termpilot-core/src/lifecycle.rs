use crate::bridge::{CommandBridge, CommandResult, ExecuteOptions};
use crate::connection::{
    Connection, ConnectionId, ConnectionRegistry, ConnectionStatus, LineKind, SessionData,
};
use crate::error::CoreError;
use crate::events::{Event, EventBus, NotificationLevel};
use crate::pool::{ConnectionPool, PoolStatus};
use crate::session::SessionRegistry;
use crate::transport::Transport;
use crate::watchdog::{IdleSettings, IdleStatus, IdleWatchdog, WatchdogEvent};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use termpilot_config::AppConfig;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct Monitors {
    token: CancellationToken,
    health: JoinHandle<()>,
    metrics: JoinHandle<()>,
}

impl Monitors {
    fn stop(self) {
        self.token.cancel();
        self.health.abort();
        self.metrics.abort();
    }
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    connections: ConnectionRegistry,
    bridge: Arc<CommandBridge>,
    pool: Arc<ConnectionPool>,
    sessions: SessionRegistry,
    watchdog: IdleWatchdog,
    watchdog_events: Mutex<Option<UnboundedReceiver<WatchdogEvent>>>,
    bus: EventBus,
    config: AppConfig,
    pending: Mutex<HashMap<ConnectionId, CancellationToken>>,
    monitors: Mutex<HashMap<ConnectionId, Monitors>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    root: CancellationToken,
}

/// Owns the user-visible connections and everything that runs on their
/// behalf: pool entries, monitoring loops, idle timers and sessions.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, bus: EventBus, config: AppConfig) -> Self {
        let connections = ConnectionRegistry::new();
        let bridge = Arc::new(CommandBridge::new(transport.clone(), connections.clone()));
        let pool = Arc::new(ConnectionPool::new(
            transport.clone(),
            bridge.clone(),
            config.pool.clone(),
            config.monitoring.heartbeat_command.clone(),
        ));
        let sessions = SessionRegistry::new(transport.clone(), connections.clone(), bus.clone());
        let (watchdog, watchdog_events) = IdleWatchdog::new(IdleSettings::from(&config.idle));
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                connections,
                bridge,
                pool,
                sessions,
                watchdog,
                watchdog_events: Mutex::new(Some(watchdog_events)),
                bus,
                config,
                pending: Mutex::new(HashMap::new()),
                monitors: Mutex::new(HashMap::new()),
                background: Mutex::new(Vec::new()),
                root: CancellationToken::new(),
            }),
        }
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.inner.connections
    }

    pub fn bridge(&self) -> Arc<CommandBridge> {
        self.inner.bridge.clone()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Spawns the watchdog listener and the pool cleanup task. Call once.
    pub fn start(&self) {
        let mut background = self.inner.background.lock();
        background.push(self.inner.pool.start_cleanup(self.inner.root.child_token()));
        if let Some(rx) = self.inner.watchdog_events.lock().take() {
            background.push(self.spawn_watchdog_listener(rx));
        }
    }

    pub async fn connect(&self, data: SessionData) -> Result<(), CoreError> {
        let id = data.id.clone();
        if self.inner.connections.contains(&id) {
            self.inner.connections.transition(&id, ConnectionStatus::Connecting)?;
            self.inner.connections.update(&id, |conn| {
                conn.name = data.name;
                conn.host = data.host;
                conn.port = data.port;
                conn.username = data.username;
                conn.auth = data.auth;
                conn.error_message = None;
            });
        } else {
            self.inner.connections.insert(Connection::new(data));
        }
        self.publish_status(&id);
        self.run_connect(&id).await
    }

    pub async fn cancel(&self, id: &str) -> Result<(), CoreError> {
        self.inner.connections.transition(id, ConnectionStatus::Cancelled)?;
        self.inner.connections.update(id, |conn| conn.connect_step = None);
        self.inner
            .connections
            .push_line(id, LineKind::Warning, "Connection attempt cancelled");
        if let Some(token) = self.inner.pending.lock().remove(id) {
            token.cancel();
        }
        self.inner.transport.disconnect(id).await;
        self.publish_status(id);
        info!(connection_id = %id, "connect cancelled");
        Ok(())
    }

    /// Idempotent; only a connected connection changes state.
    pub async fn disconnect(&self, id: &str) -> Result<(), CoreError> {
        let status = self.inner.connections.status(id).ok_or(CoreError::NotFound)?;
        self.stop_monitoring(id);
        self.inner.watchdog.remove_connection(id);
        if status != ConnectionStatus::Connected {
            return Ok(());
        }

        self.inner.pool.close_persistent_connection(id).await;
        self.inner.transport.disconnect(id).await;
        self.inner.bridge.release(id);
        self.inner.connections.transition(id, ConnectionStatus::Disconnected)?;
        self.inner
            .connections
            .push_line(id, LineKind::Info, "Disconnected");
        self.publish_status(id);
        info!(connection_id = %id, "disconnected");
        Ok(())
    }

    /// Rebuilds the connection in place, keeping its id and output.
    pub async fn reconnect(&self, id: &str) -> Result<(), CoreError> {
        match self.inner.connections.status(id) {
            None => return Err(CoreError::NotFound),
            Some(ConnectionStatus::Connected) => self.disconnect(id).await?,
            Some(_) => {}
        }
        self.inner.pool.close_persistent_connection(id).await;
        self.inner.connections.transition(id, ConnectionStatus::Connecting)?;
        self.inner.connections.update(id, |conn| conn.error_message = None);
        self.publish_status(id);
        self.run_connect(id).await
    }

    pub async fn close(&self, id: &str) -> Result<(), CoreError> {
        let status = self.inner.connections.status(id).ok_or(CoreError::NotFound)?;
        if status == ConnectionStatus::Connecting {
            let _ = self.cancel(id).await;
        }
        self.disconnect(id).await?;
        self.inner.pool.close_persistent_connection(id).await;
        self.inner.sessions.close_connection_sessions(id).await;
        self.inner.connections.remove(id);
        info!(connection_id = %id, "connection closed");
        Ok(())
    }

    /// Runs a user command; counts as activity for the idle timer.
    pub async fn execute_command(&self, id: &str, command: &str) -> Result<CommandResult, CoreError> {
        self.inner.watchdog.update_activity(id);
        self.inner
            .bridge
            .execute(id, command, &ExecuteOptions::terminal())
            .await
    }

    pub fn record_activity(&self, id: &str) {
        self.inner.watchdog.update_activity(id);
    }

    pub fn pause_idle(&self, id: &str) {
        self.inner.watchdog.pause_connection(id);
    }

    pub fn resume_idle(&self, id: &str) {
        self.inner.watchdog.resume_connection(id);
    }

    pub fn idle_status(&self, id: &str) -> Option<IdleStatus> {
        self.inner.watchdog.connection_status(id)
    }

    pub fn status(&self, id: &str) -> Option<ConnectionStatus> {
        self.inner.connections.status(id)
    }

    pub fn is_monitoring(&self, id: &str) -> bool {
        self.inner.monitors.lock().contains_key(id)
    }

    pub async fn shutdown(&self) {
        self.inner.root.cancel();
        for id in self.inner.connections.ids() {
            if let Err(err) = self.close(&id).await {
                warn!(connection_id = %id, error = %err, "close during shutdown failed");
            }
        }
        self.inner.watchdog.shutdown();
        for handle in self.inner.background.lock().drain(..) {
            handle.abort();
        }
        info!("connection manager stopped");
    }

    async fn run_connect(&self, id: &str) -> Result<(), CoreError> {
        let conn = self.inner.connections.get(id).ok_or(CoreError::NotFound)?;
        let params = conn.connect_params();
        let token = CancellationToken::new();
        self.inner.pending.lock().insert(id.to_string(), token.clone());
        self.inner.connections.update(id, |c| {
            c.connect_step = Some(format!("Connecting to {}:{}", c.host, c.port));
        });
        self.inner.connections.push_line(
            id,
            LineKind::Info,
            format!("Connecting to {}@{}:{}...", conn.username, conn.host, conn.port),
        );
        info!(connection_id = %id, host = %conn.host, port = conn.port, "connect start");

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            res = self.inner.transport.connect(id, &params) => Some(res),
        };
        self.inner.pending.lock().remove(id);

        match outcome {
            None => Err(CoreError::Cancelled),
            Some(Ok(())) => {
                if self
                    .inner
                    .connections
                    .transition(id, ConnectionStatus::Connected)
                    .is_err()
                {
                    // Cancelled between handshake completion and here.
                    self.inner.transport.disconnect(id).await;
                    return Err(CoreError::Cancelled);
                }
                self.on_connected(&conn).await;
                Ok(())
            }
            Some(Err(err)) => {
                let message = err.to_string();
                error!(connection_id = %id, error = %message, "connect failed");
                let _ = self.inner.connections.transition(id, ConnectionStatus::Failed);
                self.inner.connections.update(id, |c| {
                    c.error_message = Some(message.clone());
                    c.connect_step = None;
                });
                self.inner.connections.push_line(
                    id,
                    LineKind::Error,
                    format!("Connection failed: {message}"),
                );
                self.publish_status(id);
                self.inner.bus.notify(
                    NotificationLevel::Error,
                    format!("Could not connect to {}: {message}", conn.name),
                );
                Err(CoreError::Ssh(message))
            }
        }
    }

    async fn on_connected(&self, conn: &Connection) {
        let id = conn.id.as_str();
        self.inner.connections.update(id, |c| {
            c.connected_at = Some(Utc::now());
            c.connect_step = None;
            c.error_message = None;
        });
        self.publish_status(id);
        info!(connection_id = %id, "connected");

        if let Err(err) = self
            .inner
            .pool
            .create_persistent_connection(id, conn.connect_params())
            .await
        {
            warn!(connection_id = %id, error = %err, "pool entry unavailable");
            self.inner.connections.push_line(
                id,
                LineKind::Warning,
                "System metrics unavailable for this connection",
            );
        }

        self.inner.connections.push_line(
            id,
            LineKind::Success,
            format!("Connected to {}@{}", conn.username, conn.host),
        );
        self.inner.connections.push_line(
            id,
            LineKind::Info,
            format!("Welcome to {}. Type a command to get started.", conn.name),
        );

        self.start_monitoring(id);
        if self.inner.config.idle.enabled {
            self.inner.watchdog.init_connection(id, None);
        }
        let _ = self.inner.connections.set_active(id);
        self.inner
            .bus
            .notify(NotificationLevel::Success, format!("Connected to {}", conn.name));
    }

    fn publish_status(&self, id: &str) {
        if let Some(status) = self.inner.connections.status(id) {
            self.inner.bus.send(Event::ConnectionStatusChanged {
                connection_id: id.to_string(),
                status,
            });
            self.inner.sessions.set_connection_status(id, status);
        }
    }

    fn start_monitoring(&self, id: &str) {
        self.stop_monitoring(id);
        let token = self.inner.root.child_token();
        let monitors = Monitors {
            health: self.spawn_health_loop(id.to_string(), token.clone()),
            metrics: self.spawn_metrics_loop(id.to_string(), token.clone()),
            token,
        };
        self.inner.monitors.lock().insert(id.to_string(), monitors);
    }

    fn stop_monitoring(&self, id: &str) {
        if let Some(monitors) = self.inner.monitors.lock().remove(id) {
            monitors.stop();
        }
    }

    fn spawn_health_loop(&self, id: ConnectionId, token: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let period = Duration::from_secs(inner.config.monitoring.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match inner.pool.check_connection_health(&id).await {
                    Ok(check) if !check.healthy => {
                        if check.status == PoolStatus::Error
                            && check.error_count == inner.config.pool.max_errors
                        {
                            inner.bus.notify(
                                NotificationLevel::Warning,
                                format!("Monitoring for {id} stopped after repeated heartbeat failures"),
                            );
                        }
                    }
                    Ok(_) | Err(_) => {}
                }
            }
        })
    }

    fn spawn_metrics_loop(&self, id: ConnectionId, token: CancellationToken) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let period = Duration::from_millis(inner.config.monitoring.metrics_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(metrics) = inner.pool.execute_batch_command(&id).await else {
                    continue;
                };
                if token.is_cancelled() {
                    break;
                }
                if let Some(info) = inner.connections.update(&id, |c| c.apply_metrics(&metrics)) {
                    inner.bus.send(Event::MetricsUpdated {
                        connection_id: id.clone(),
                        info,
                    });
                }
            }
        })
    }

    fn spawn_watchdog_listener(&self, mut rx: UnboundedReceiver<WatchdogEvent>) -> JoinHandle<()> {
        let manager = self.clone();
        let token = self.inner.root.child_token();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                manager.handle_watchdog_event(event).await;
            }
        })
    }

    async fn handle_watchdog_event(&self, event: WatchdogEvent) {
        let inner = &self.inner;
        match event {
            WatchdogEvent::Warning {
                connection_id,
                remaining,
                message,
            } => {
                inner
                    .connections
                    .push_line(&connection_id, LineKind::Warning, message.clone());
                inner
                    .bus
                    .notify(NotificationLevel::Warning, message.clone());
                inner.bus.send(Event::IdleWarning {
                    connection_id,
                    remaining,
                    message,
                });
            }
            WatchdogEvent::Timeout {
                connection_id,
                idle,
                message,
            } => {
                if let Err(err) = self.disconnect(&connection_id).await {
                    warn!(connection_id = %connection_id, error = %err, "idle disconnect failed");
                }
                inner
                    .connections
                    .push_line(&connection_id, LineKind::Warning, message.clone());
                inner.bus.notify(NotificationLevel::Warning, message.clone());
                inner.bus.send(Event::IdleTimeout {
                    connection_id,
                    idle,
                    message,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::BATCH_SCRIPT;
    use crate::pool::pool_key;
    use crate::session::SessionOptions;
    use crate::testing::{MockTransport, ResourceCounters};
    use crate::transport::AuthMethod;

    const SAMPLE: &str = "CPU_USAGE:3.5\nMEMORY_USAGE:20\nNETWORK_DATA:100 200\nTIMESTAMP:1700000000";

    fn data(id: &str) -> SessionData {
        SessionData {
            id: id.to_string(),
            name: format!("{id}-server"),
            host: format!("{id}.example.net"),
            port: 22,
            username: "ops".to_string(),
            auth: AuthMethod::Agent,
        }
    }

    fn manager_with(config: AppConfig) -> (Arc<MockTransport>, ConnectionManager) {
        let transport = Arc::new(MockTransport::new());
        let manager = ConnectionManager::new(transport.clone(), EventBus::new(1024), config);
        (transport, manager)
    }

    fn manager() -> (Arc<MockTransport>, ConnectionManager) {
        let mut config = AppConfig::default();
        config.idle.enabled = false;
        manager_with(config)
    }

    fn lines(manager: &ConnectionManager, id: &str) -> Vec<(LineKind, String)> {
        manager
            .connections()
            .get(id)
            .map(|c| c.output.lines().map(|l| (l.kind, l.content.clone())).collect())
            .unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_brings_up_pool_and_monitors() {
        let (transport, manager) = manager();
        manager.connect(data("a")).await.unwrap();

        let conn = manager.connections().get("a").unwrap();
        assert_eq!(conn.status, ConnectionStatus::Connected);
        assert!(conn.connected_at.is_some());
        assert_eq!(transport.connects(), vec!["a".to_string(), pool_key("a")]);
        assert!(manager.pool().entry("a").is_some());
        assert!(manager.is_monitoring("a"));
        assert_eq!(manager.connections().active().as_deref(), Some("a"));
        assert!(lines(&manager, "a")
            .iter()
            .any(|(kind, _)| *kind == LineKind::Success));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_records_the_reason() {
        let (transport, manager) = manager();
        transport.fail_connect(Some("Permission denied (publickey)"));
        let err = manager.connect(data("a")).await.unwrap_err();
        assert!(matches!(err, CoreError::Ssh(_)));

        let conn = manager.connections().get("a").unwrap();
        assert_eq!(conn.status, ConnectionStatus::Failed);
        assert_eq!(
            conn.error_message.as_deref(),
            Some("Permission denied (publickey)")
        );
        assert_eq!(conn.output.last().unwrap().kind, LineKind::Error);
        assert!(manager.pool().is_empty());
        assert!(!manager.is_monitoring("a"));

        // Failed is terminal until a new attempt.
        transport.fail_connect(None);
        manager.connect(data("a")).await.unwrap();
        assert_eq!(manager.status("a"), Some(ConnectionStatus::Connected));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pool_failure_is_not_fatal() {
        let (transport, manager) = manager();
        transport.fail_connect_for(&pool_key("a"), "too many sessions");
        manager.connect(data("a")).await.unwrap();
        assert_eq!(manager.status("a"), Some(ConnectionStatus::Connected));
        assert!(manager.pool().entry("a").is_none());
        assert!(lines(&manager, "a")
            .iter()
            .any(|(kind, text)| *kind == LineKind::Warning && text.contains("metrics")));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_only_applies_while_connecting() {
        let (transport, manager) = manager();
        transport.set_connect_delay(Duration::from_secs(10));
        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect(data("a")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.status("a"), Some(ConnectionStatus::Connecting));

        manager.cancel("a").await.unwrap();
        assert!(matches!(pending.await.unwrap(), Err(CoreError::Cancelled)));
        assert_eq!(manager.status("a"), Some(ConnectionStatus::Cancelled));
        assert_eq!(transport.disconnects(), vec!["a".to_string()]);
        assert!(manager.pool().is_empty());

        assert!(matches!(
            manager.cancel("a").await,
            Err(CoreError::InvalidTransition { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_everything_and_is_idempotent() {
        let (transport, manager) = manager();
        transport.on_command(BATCH_SCRIPT, Ok(MockTransport::stdout(SAMPLE)));
        manager.connect(data("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(manager.connections().get("a").unwrap().system_info.is_some());

        manager.disconnect("a").await.unwrap();
        manager.disconnect("a").await.unwrap();
        assert_eq!(manager.status("a"), Some(ConnectionStatus::Disconnected));
        assert!(manager.pool().is_empty());
        assert!(!manager.is_monitoring("a"));

        let polls = transport.exec_count();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.exec_count(), polls);
        assert!(matches!(manager.disconnect("zzz").await, Err(CoreError::NotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_publish_events() {
        let (transport, manager) = manager();
        transport.on_command(BATCH_SCRIPT, Ok(MockTransport::stdout(SAMPLE)));
        let mut events = manager.bus().subscribe();
        manager.connect(data("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let mut saw_metrics = false;
        while let Ok(event) = events.try_recv() {
            if let Event::MetricsUpdated { connection_id, info } = event {
                assert_eq!(connection_id, "a");
                assert_eq!(info.cpu, 3.5);
                saw_metrics = true;
            }
        }
        assert!(saw_metrics);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn broken_pool_is_quarantined_until_reconnect() {
        let (transport, manager) = manager();
        manager.connect(data("a")).await.unwrap();
        transport.set_default(Err("broken pipe".to_string()));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(manager.pool().entry("a").unwrap().status, PoolStatus::Error);
        let polls = transport.exec_count_for(&pool_key("a"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.exec_count_for(&pool_key("a")), polls);

        transport.set_default(Ok(MockTransport::stdout(SAMPLE)));
        manager.reconnect("a").await.unwrap();
        let entry = manager.pool().entry("a").unwrap();
        assert_eq!(entry.status, PoolStatus::Connected);
        assert_eq!(entry.error_count, 0);
        assert_eq!(manager.status("a"), Some(ConnectionStatus::Connected));
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_disconnects() {
        let mut config = AppConfig::default();
        config.idle.idle_timeout_ms = 1000;
        config.idle.warning_time_ms = 300;
        let (_, manager) = manager_with(config);
        manager.start();
        let mut events = manager.bus().subscribe();
        manager.connect(data("a")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(600)).await;
        manager.execute_command("a", "ls").await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(manager.status("a"), Some(ConnectionStatus::Connected));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.status("a"), Some(ConnectionStatus::Disconnected));
        let warnings = lines(&manager, "a")
            .into_iter()
            .filter(|(kind, _)| *kind == LineKind::Warning)
            .count();
        assert_eq!(warnings, 2);

        let mut saw_warning = false;
        let mut saw_timeout = false;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::IdleWarning { .. } => saw_warning = true,
                Event::IdleTimeout { .. } => saw_timeout = true,
                _ => {}
            }
        }
        assert!(saw_warning && saw_timeout);
        manager.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_hands_active_back_and_closes_sessions() {
        let (transport, manager) = manager();
        manager.connect(data("a")).await.unwrap();
        manager.connect(data("b")).await.unwrap();
        manager
            .sessions()
            .create_session(
                "a",
                SessionOptions {
                    open_resources: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(manager.connections().active().as_deref(), Some("b"));

        manager.close("b").await.unwrap();
        assert_eq!(manager.connections().active().as_deref(), Some("a"));

        manager.close("a").await.unwrap();
        assert_eq!(manager.connections().active(), None);
        assert!(manager.sessions().list_sessions().is_empty());
        assert_eq!(ResourceCounters::get(&transport.resources.client_end), 1);
        assert!(manager.pool().is_empty());
        assert!(matches!(manager.close("a").await, Err(CoreError::NotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_every_connection() {
        let (transport, manager) = manager();
        manager.start();
        manager.connect(data("a")).await.unwrap();
        manager.connect(data("b")).await.unwrap();
        manager.shutdown().await;

        assert!(manager.connections().ids().is_empty());
        let disconnects = transport.disconnects();
        for key in ["a", "b", "a#pool", "b#pool"] {
            assert!(disconnects.iter().any(|k| k == key), "{key} not disconnected");
        }
    }
}
