use crate::connection::{ConnectionRegistry, ConnectionStatus, LineKind};
use crate::error::CoreError;
use crate::transport::{CommandOutput, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOrigin {
    Terminal,
    Assistant,
    Monitor,
}

#[derive(Clone, Debug)]
pub struct ExecuteOptions {
    pub origin: CommandOrigin,
    pub timeout: Option<Duration>,
    /// Echo the command and its output into the connection's terminal buffer.
    pub record: bool,
}

impl ExecuteOptions {
    pub fn terminal() -> Self {
        Self {
            origin: CommandOrigin::Terminal,
            timeout: None,
            record: true,
        }
    }

    pub fn assistant(timeout: Duration) -> Self {
        Self {
            origin: CommandOrigin::Assistant,
            timeout: Some(timeout),
            record: true,
        }
    }

    pub fn monitor() -> Self {
        Self {
            origin: CommandOrigin::Monitor,
            timeout: None,
            record: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandResult {
    fn from_output(out: CommandOutput, duration: Duration) -> Self {
        let code = out.exit_code.unwrap_or(0);
        let success = code == 0;
        let stderr = out.stderr.trim_end().to_string();
        let error = if !stderr.is_empty() {
            Some(stderr)
        } else if !success {
            Some(format!("command exited with code {code}"))
        } else {
            None
        };
        Self {
            success,
            output: out.stdout.trim_end().to_string(),
            error,
            exit_code: out.exit_code,
            timed_out: false,
            duration,
        }
    }

    fn failure(error: String, timed_out: bool, duration: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error),
            exit_code: None,
            timed_out,
            duration,
        }
    }
}

/// The single place commands are run. Every channel key has one command
/// slot, so terminal input, assistant tool calls and polling on the same
/// physical connection run one at a time in arrival order.
pub struct CommandBridge {
    transport: Arc<dyn Transport>,
    connections: ConnectionRegistry,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CommandBridge {
    pub fn new(transport: Arc<dyn Transport>, connections: ConnectionRegistry) -> Self {
        Self {
            transport,
            connections,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `command` on a connected connection. Only an unknown or
    /// not-connected id is an `Err`; command failures come back as a
    /// `CommandResult` with `success == false`.
    pub async fn execute(
        &self,
        connection_id: &str,
        command: &str,
        options: &ExecuteOptions,
    ) -> Result<CommandResult, CoreError> {
        match self.connections.status(connection_id) {
            None => return Err(CoreError::NotFound),
            Some(ConnectionStatus::Connected) => {}
            Some(_) => return Err(CoreError::NotConnected(connection_id.to_string())),
        }

        if options.record {
            self.connections
                .push_line(connection_id, LineKind::Command, format!("$ {command}"));
        }
        let result = self.dispatch(connection_id, command, options).await;
        if options.record {
            self.record(connection_id, &result);
        }
        Ok(result)
    }

    /// Runs `command` on a raw channel key without the status gate. Used for
    /// channels that are not user-visible connections, such as pool entries.
    pub async fn dispatch(&self, key: &str, command: &str, options: &ExecuteOptions) -> CommandResult {
        let slot = self.slot(key);
        let _turn = slot.lock().await;
        let started = Instant::now();
        debug!(key, origin = ?options.origin, "dispatch command");

        let exec = self.transport.execute(key, command);
        let outcome = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, exec).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(key, timeout_ms = limit.as_millis() as u64, "command timed out");
                    return CommandResult::failure(
                        format!("command timed out after {} ms", limit.as_millis()),
                        true,
                        started.elapsed(),
                    );
                }
            },
            None => exec.await,
        };

        match outcome {
            Ok(out) => CommandResult::from_output(out, started.elapsed()),
            Err(err) => {
                warn!(key, error = %err, "command failed");
                CommandResult::failure(err.to_string(), false, started.elapsed())
            }
        }
    }

    pub fn release(&self, key: &str) {
        self.slots.lock().remove(key);
    }

    fn slot(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.slots
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn record(&self, connection_id: &str, result: &CommandResult) {
        self.connections.update(connection_id, |conn| {
            for line in result.output.lines() {
                conn.output.push(LineKind::Output, line);
            }
            if let Some(err) = &result.error {
                let kind = if result.success {
                    LineKind::Warning
                } else {
                    LineKind::Error
                };
                conn.output.push(kind, err.clone());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, SessionData};
    use crate::testing::MockTransport;
    use crate::transport::AuthMethod;

    fn registry_with(id: &str, status: ConnectionStatus) -> ConnectionRegistry {
        let reg = ConnectionRegistry::new();
        let mut conn = Connection::new(SessionData {
            id: id.to_string(),
            name: id.to_string(),
            host: "h".to_string(),
            port: 22,
            username: "u".to_string(),
            auth: AuthMethod::Agent,
        });
        conn.status = status;
        reg.insert(conn);
        reg
    }

    #[tokio::test]
    async fn rejects_connections_that_are_not_connected() {
        let transport = Arc::new(MockTransport::new());
        let reg = registry_with("a", ConnectionStatus::Connecting);
        let bridge = CommandBridge::new(transport.clone(), reg);
        let err = bridge
            .execute("a", "ls", &ExecuteOptions::terminal())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotConnected(_)));
        assert!(matches!(
            bridge.execute("missing", "ls", &ExecuteOptions::terminal()).await,
            Err(CoreError::NotFound)
        ));
        assert_eq!(transport.exec_count(), 0);
    }

    #[tokio::test]
    async fn shapes_output_and_records_lines() {
        let transport = Arc::new(MockTransport::new());
        transport.on_command("uptime", Ok(MockTransport::stdout("up 3 days\n")));
        let reg = registry_with("a", ConnectionStatus::Connected);
        let bridge = CommandBridge::new(transport.clone(), reg.clone());

        let res = bridge
            .execute("a", "uptime", &ExecuteOptions::terminal())
            .await
            .unwrap();
        assert!(res.success);
        assert_eq!(res.output, "up 3 days");
        assert_eq!(res.exit_code, Some(0));

        let conn = reg.get("a").unwrap();
        let lines: Vec<_> = conn.output.lines().map(|l| (l.kind, l.content.clone())).collect();
        assert_eq!(
            lines,
            vec![
                (LineKind::Command, "$ uptime".to_string()),
                (LineKind::Output, "up 3 days".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn transport_errors_become_failed_results() {
        let transport = Arc::new(MockTransport::new());
        transport.on_command("boom", Err("channel closed".to_string()));
        transport.on_command(
            "false",
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(1),
            }),
        );
        let reg = registry_with("a", ConnectionStatus::Connected);
        let bridge = CommandBridge::new(transport, reg);

        let res = bridge.execute("a", "boom", &ExecuteOptions::terminal()).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.error.as_deref(), Some("channel closed"));

        let res = bridge.execute("a", "false", &ExecuteOptions::terminal()).await.unwrap();
        assert!(!res.success);
        assert_eq!(res.exit_code, Some(1));
        assert_eq!(res.error.as_deref(), Some("command exited with code 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported_not_thrown() {
        let transport = Arc::new(MockTransport::new());
        transport.set_exec_delay(Duration::from_secs(60));
        let reg = registry_with("a", ConnectionStatus::Connected);
        let bridge = CommandBridge::new(transport, reg);

        let res = bridge
            .execute("a", "sleep 60", &ExecuteOptions::assistant(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(res.timed_out);
        assert!(!res.success);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_on_one_connection_never_overlap() {
        let transport = Arc::new(MockTransport::new());
        transport.set_exec_delay(Duration::from_millis(100));
        let reg = registry_with("a", ConnectionStatus::Connected);
        let bridge = Arc::new(CommandBridge::new(transport.clone(), reg));

        let b1 = bridge.clone();
        let b2 = bridge.clone();
        let human = tokio::spawn(async move {
            b1.execute("a", "ls", &ExecuteOptions::terminal()).await
        });
        let ai = tokio::spawn(async move {
            b2.execute("a", "df -h", &ExecuteOptions::assistant(Duration::from_secs(5)))
                .await
        });
        human.await.unwrap().unwrap();
        ai.await.unwrap().unwrap();

        assert_eq!(transport.exec_count(), 2);
        assert_eq!(transport.max_concurrent_execs(), 1);
    }
}
