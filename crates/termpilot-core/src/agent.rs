use crate::bridge::{CommandBridge, CommandOrigin, ExecuteOptions};
use crate::chat::{
    ChatBackend, ChatChoice, ChatMessage, ChatRequest, ToolCallRequest, ToolSpec,
    EXECUTE_COMMAND_TOOL,
};
use crate::connection::{Connection, ConnectionId, ConnectionRegistry, ConnectionStatus};
use crate::error::CoreError;
use crate::events::{Event, EventBus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use termpilot_config::AiConfig;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const TOOL_HISTORY_LIMIT: usize = 100;
pub const TOOL_OUTPUT_LIMIT: usize = 8000;
pub const TOO_MANY_TOOL_CALLS: &str =
    "Too many tool calls were needed for this request. Please simplify your request.";
pub const COMMAND_COMPLETED: &str = "Command completed.";
const LENGTH_CAVEAT: &str = "[The response was cut off because it reached the token limit.]";
const FILTER_CAVEAT: &str = "[Part of the response was withheld by the content filter.]";

/// Reports the facts embedded in the assistant's system prompt.
pub const ENV_SCRIPT: &str = r#"echo "OS:$(uname -sr 2>/dev/null)"; echo "HOST:$(hostname 2>/dev/null)"; echo "USER:$(whoami 2>/dev/null)"; echo "CWD:$(pwd 2>/dev/null)""#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolCallStatus {
    Executing,
    Completed,
    Error,
    Timeout,
}

#[derive(Clone, Debug)]
pub struct ToolCallRecord {
    pub id: String,
    /// Id the model gave the call; only unique within one response.
    pub tool_call_id: Option<String>,
    pub command: String,
    pub connection_id: ConnectionId,
    pub status: ToolCallStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub execution_time: Option<Duration>,
}

impl ToolCallRecord {
    fn started(tool_call_id: Option<String>, command: String, connection_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_call_id,
            command,
            connection_id: connection_id.to_string(),
            status: ToolCallStatus::Executing,
            start_time: Utc::now(),
            end_time: None,
            result: None,
            error: None,
            execution_time: None,
        }
    }

    fn finish(&mut self, status: ToolCallStatus, elapsed: Duration) {
        self.status = status;
        self.end_time = Some(Utc::now());
        self.execution_time = Some(elapsed);
    }

    /// What the model is told about this call.
    pub fn model_feedback(&self) -> String {
        let output = self.result.as_deref().unwrap_or("");
        match self.status {
            ToolCallStatus::Completed if output.is_empty() => "(no output)".to_string(),
            ToolCallStatus::Completed => output.to_string(),
            ToolCallStatus::Timeout => format!(
                "Command timed out: {}",
                self.error.as_deref().unwrap_or("no response")
            ),
            ToolCallStatus::Error | ToolCallStatus::Executing => {
                let mut text = format!(
                    "Command failed: {}",
                    self.error.as_deref().unwrap_or("unknown error")
                );
                if !output.is_empty() {
                    text.push('\n');
                    text.push_str(output);
                }
                text
            }
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolCallStats {
    pub total: usize,
    pub executing: usize,
    pub completed: usize,
    pub error: usize,
    pub timeout: usize,
    pub success_rate: f64,
    pub average_execution_time: Duration,
}

#[derive(Clone)]
pub struct ToolCallLedger {
    records: Arc<Mutex<VecDeque<ToolCallRecord>>>,
    capacity: usize,
}

impl Default for ToolCallLedger {
    fn default() -> Self {
        Self::new(TOOL_HISTORY_LIMIT)
    }
}

impl ToolCallLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Inserts a record or replaces the one with the same id.
    pub fn record(&self, record: ToolCallRecord) {
        let mut records = self.records.lock();
        if let Some(existing) = records.iter_mut().find(|r| r.id == record.id) {
            *existing = record;
            return;
        }
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
    }

    pub fn get(&self, id: &str) -> Option<ToolCallRecord> {
        self.records.lock().iter().find(|r| r.id == id).cloned()
    }

    pub fn list(&self) -> Vec<ToolCallRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    pub fn stats(&self) -> ToolCallStats {
        let records = self.records.lock();
        let mut stats = ToolCallStats {
            total: records.len(),
            ..Default::default()
        };
        let mut finished = Duration::ZERO;
        let mut finished_count = 0u32;
        for record in records.iter() {
            match record.status {
                ToolCallStatus::Executing => stats.executing += 1,
                ToolCallStatus::Completed => stats.completed += 1,
                ToolCallStatus::Error => stats.error += 1,
                ToolCallStatus::Timeout => stats.timeout += 1,
            }
            if let Some(elapsed) = record.execution_time {
                finished += elapsed;
                finished_count += 1;
            }
        }
        let done = stats.completed + stats.error + stats.timeout;
        if done > 0 {
            stats.success_rate = stats.completed as f64 / done as f64;
        }
        if finished_count > 0 {
            stats.average_execution_time = finished / finished_count;
        }
        stats
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvironmentInfo {
    pub os: String,
    pub host: String,
    pub user: String,
    pub cwd: String,
}

impl EnvironmentInfo {
    fn fallback(conn: &Connection) -> Self {
        Self {
            os: "unknown".to_string(),
            host: conn.host.clone(),
            user: conn.username.clone(),
            cwd: "~".to_string(),
        }
    }

    /// Fills in whatever the script reported; the rest stays as in `base`.
    pub fn parse(output: &str, base: Self) -> Self {
        let mut env = base;
        for line in output.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "OS" => env.os = value.to_string(),
                "HOST" => env.host = value.to_string(),
                "USER" => env.user = value.to_string(),
                "CWD" => env.cwd = value.to_string(),
                _ => {}
            }
        }
        env
    }
}

#[derive(Clone, Debug)]
pub struct AssistantReply {
    pub content: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub iterations: u32,
    pub finish_reason: Option<String>,
    pub capped: bool,
}

#[derive(Deserialize)]
struct ExecuteCommandArgs {
    command: String,
}

/// Drives the bounded chat/tool loop for one user message at a time.
pub struct AssistantOrchestrator {
    backend: Arc<dyn ChatBackend>,
    bridge: Arc<CommandBridge>,
    connections: ConnectionRegistry,
    bus: EventBus,
    config: AiConfig,
    ledger: ToolCallLedger,
}

impl AssistantOrchestrator {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        bridge: Arc<CommandBridge>,
        connections: ConnectionRegistry,
        bus: EventBus,
        config: AiConfig,
    ) -> Self {
        Self {
            backend,
            bridge,
            connections,
            bus,
            config,
            ledger: ToolCallLedger::default(),
        }
    }

    pub fn ledger(&self) -> &ToolCallLedger {
        &self.ledger
    }

    pub async fn ask(
        &self,
        connection_id: &str,
        message: &str,
        history: &[ChatMessage],
    ) -> Result<AssistantReply, CoreError> {
        let conn = self
            .connections
            .get(connection_id)
            .ok_or(CoreError::NotFound)?;
        if conn.status != ConnectionStatus::Connected {
            return Err(CoreError::NotConnected(connection_id.to_string()));
        }

        let env = self.detect_environment(&conn).await;
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt(&env)));
        let keep = history
            .iter()
            .filter(|m| m.role != "system")
            .collect::<Vec<_>>();
        let skip = keep.len().saturating_sub(self.config.history_max);
        messages.extend(keep.into_iter().skip(skip).cloned());
        messages.push(ChatMessage::user(message));

        let cap = self.config.max_iterations.max(1);
        let mut records = Vec::new();
        for iteration in 1..=cap {
            let choice = self.backend.complete(&self.request(&messages)).await?;
            let calls = choice.message.requested_tools().to_vec();
            if calls.is_empty() {
                return Ok(finish_reply(choice, records, iteration));
            }
            if iteration == cap {
                break;
            }
            debug!(connection_id = %connection_id, iteration, calls = calls.len(), "tool calls requested");
            messages.push(ChatMessage::assistant_tool_calls(
                choice.message.content.clone(),
                calls.clone(),
            ));
            for call in &calls {
                let record = self.run_tool_call(connection_id, call).await;
                messages.push(ChatMessage::tool(call.id.clone(), record.model_feedback()));
                records.push(record);
            }
        }

        warn!(connection_id = %connection_id, cap, "tool call limit reached");
        Ok(AssistantReply {
            content: TOO_MANY_TOOL_CALLS.to_string(),
            tool_calls: records,
            iterations: cap,
            finish_reason: None,
            capped: true,
        })
    }

    /// Re-runs a finished tool call as a new ledger entry.
    pub async fn retry_tool_call(&self, id: &str) -> Result<ToolCallRecord, CoreError> {
        let previous = self.ledger.get(id).ok_or(CoreError::NotFound)?;
        if previous.status == ToolCallStatus::Executing {
            return Err(CoreError::Invalid(format!("tool call {id} is still executing")));
        }
        let record = ToolCallRecord::started(None, previous.command, &previous.connection_id);
        Ok(self.execute_record(record).await)
    }

    pub fn get_tool_call_stats(&self) -> ToolCallStats {
        self.ledger.stats()
    }

    pub fn clear_tool_calls(&self) {
        self.ledger.clear();
    }

    async fn run_tool_call(&self, connection_id: &str, call: &ToolCallRequest) -> ToolCallRecord {
        let command = if call.function.name != EXECUTE_COMMAND_TOOL {
            Err(format!("unknown tool: {}", call.function.name))
        } else {
            match serde_json::from_str::<ExecuteCommandArgs>(&call.function.arguments) {
                Ok(args) if !args.command.trim().is_empty() => Ok(args.command),
                Ok(_) => Err("invalid arguments: command is empty".to_string()),
                Err(err) => Err(format!("invalid arguments: {err}")),
            }
        };

        match command {
            Ok(command) => {
                let record = ToolCallRecord::started(Some(call.id.clone()), command, connection_id);
                self.execute_record(record).await
            }
            Err(err) => {
                let mut record = ToolCallRecord::started(
                    Some(call.id.clone()),
                    call.function.arguments.clone(),
                    connection_id,
                );
                self.ledger.record(record.clone());
                self.bus.send(Event::ToolStarted(record.clone()));
                warn!(tool_call_id = %call.id, error = %err, "rejected tool call");
                record.error = Some(err);
                record.finish(ToolCallStatus::Error, Duration::ZERO);
                self.ledger.record(record.clone());
                self.bus.send(Event::ToolFailed(record.clone()));
                record
            }
        }
    }

    async fn execute_record(&self, mut record: ToolCallRecord) -> ToolCallRecord {
        self.ledger.record(record.clone());
        self.bus.send(Event::ToolStarted(record.clone()));
        info!(record_id = %record.id, connection_id = %record.connection_id, command = %record.command, "tool call started");

        let started = Instant::now();
        let options = ExecuteOptions::assistant(self.tool_timeout());
        let outcome = self
            .bridge
            .execute(&record.connection_id, &record.command, &options)
            .await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(res) if res.timed_out => {
                record.error = res.error;
                record.finish(ToolCallStatus::Timeout, elapsed);
            }
            Ok(res) => {
                record.result = Some(truncate_output(&res.output));
                record.error = res.error.filter(|_| !res.success);
                let status = if res.success {
                    ToolCallStatus::Completed
                } else {
                    ToolCallStatus::Error
                };
                record.finish(status, elapsed);
            }
            Err(err) => {
                record.error = Some(err.to_string());
                record.finish(ToolCallStatus::Error, elapsed);
            }
        }

        self.ledger.record(record.clone());
        if record.status == ToolCallStatus::Completed {
            self.bus.send(Event::ToolCompleted(record.clone()));
        } else {
            self.bus.send(Event::ToolFailed(record.clone()));
        }
        debug!(record_id = %record.id, status = ?record.status, "tool call finished");
        record
    }

    async fn detect_environment(&self, conn: &Connection) -> EnvironmentInfo {
        let base = EnvironmentInfo::fallback(conn);
        let options = ExecuteOptions {
            origin: CommandOrigin::Assistant,
            timeout: Some(self.tool_timeout()),
            record: false,
        };
        match self.bridge.execute(&conn.id, ENV_SCRIPT, &options).await {
            Ok(res) if res.success => EnvironmentInfo::parse(&res.output, base),
            Ok(res) => {
                debug!(connection_id = %conn.id, error = ?res.error, "environment detection failed");
                base
            }
            Err(err) => {
                debug!(connection_id = %conn.id, error = %err, "environment detection failed");
                base
            }
        }
    }

    fn system_prompt(&self, env: &EnvironmentInfo) -> String {
        format!(
            "{}\n\nCurrent environment:\n- OS: {}\n- Host: {}\n- User: {}\n- Working directory: {}\n\n\
             Use the {} tool to run commands on this server. Run one command at a time, \
             avoid interactive programs, and summarise the results for the user.",
            self.config.system_prompt, env.os, env.host, env.user, env.cwd, EXECUTE_COMMAND_TOOL
        )
    }

    fn request(&self, messages: &[ChatMessage]) -> ChatRequest {
        ChatRequest {
            model: self.config.model.clone(),
            messages: messages.to_vec(),
            tools: vec![ToolSpec::execute_command()],
            tool_choice: Some("auto".to_string()),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.config.tool_timeout_ms.max(1))
    }
}

fn finish_reply(choice: ChatChoice, tool_calls: Vec<ToolCallRecord>, iterations: u32) -> AssistantReply {
    let mut content = choice.message.text().trim().to_string();
    if content.is_empty() {
        content = COMMAND_COMPLETED.to_string();
    }
    let caveat = match choice.finish_reason.as_deref() {
        Some("length") => Some(LENGTH_CAVEAT),
        Some("content_filter") => Some(FILTER_CAVEAT),
        _ => None,
    };
    if let Some(caveat) = caveat {
        content.push_str("\n\n");
        content.push_str(caveat);
    }
    AssistantReply {
        content,
        tool_calls,
        iterations,
        finish_reason: choice.finish_reason,
        capped: false,
    }
}

fn truncate_output(output: &str) -> String {
    if output.chars().count() <= TOOL_OUTPUT_LIMIT {
        return output.to_string();
    }
    let mut out: String = output.chars().take(TOOL_OUTPUT_LIMIT).collect();
    out.push_str("\n...[output truncated]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::FunctionCall;
    use crate::connection::SessionData;
    use crate::testing::MockTransport;
    use crate::transport::AuthMethod;
    use async_trait::async_trait;

    #[derive(Default)]
    struct ScriptedBackend {
        replies: Mutex<VecDeque<ChatChoice>>,
        fallback: Option<ChatChoice>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn complete(&self, request: &ChatRequest) -> Result<ChatChoice, CoreError> {
            self.requests.lock().push(request.clone());
            let next = self.replies.lock().pop_front();
            next.or_else(|| self.fallback.clone())
                .ok_or_else(|| CoreError::Ai("script exhausted".to_string()))
        }
    }

    fn tool_call(id: &str, arguments: &str) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: EXECUTE_COMMAND_TOOL.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    fn wants(calls: Vec<ToolCallRequest>) -> ChatChoice {
        ChatChoice {
            message: ChatMessage::assistant_tool_calls(None, calls),
            finish_reason: Some("tool_calls".to_string()),
        }
    }

    fn says(text: &str, reason: &str) -> ChatChoice {
        ChatChoice {
            message: ChatMessage::assistant(text),
            finish_reason: Some(reason.to_string()),
        }
    }

    fn setup(
        backend: ScriptedBackend,
    ) -> (Arc<MockTransport>, Arc<ScriptedBackend>, AssistantOrchestrator, EventBus) {
        let transport = Arc::new(MockTransport::new());
        let registry = ConnectionRegistry::new();
        let mut conn = Connection::new(SessionData {
            id: "web".to_string(),
            name: "web".to_string(),
            host: "web.internal".to_string(),
            port: 22,
            username: "ops".to_string(),
            auth: AuthMethod::Agent,
        });
        conn.status = ConnectionStatus::Connected;
        registry.insert(conn);
        let bridge = Arc::new(CommandBridge::new(transport.clone(), registry.clone()));
        let backend = Arc::new(backend);
        let bus = EventBus::new(256);
        let config = AiConfig {
            api_key: Some("k".to_string()),
            model: "m".to_string(),
            ..AiConfig::default()
        };
        let orchestrator =
            AssistantOrchestrator::new(backend.clone(), bridge, registry, bus.clone(), config);
        (transport, backend, orchestrator, bus)
    }

    fn scripted(replies: Vec<ChatChoice>) -> ScriptedBackend {
        ScriptedBackend {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn plain_answer_needs_one_round_trip() {
        let (_, backend, orchestrator, _) = setup(scripted(vec![says("All good.", "stop")]));
        let reply = orchestrator.ask("web", "how are you?", &[]).await.unwrap();
        assert_eq!(reply.content, "All good.");
        assert_eq!(reply.iterations, 1);
        assert!(reply.tool_calls.is_empty());

        let requests = backend.requests.lock();
        let system = requests[0].messages[0].text();
        assert!(system.contains("Host: web.internal"), "{system}");
        assert!(system.contains("User: ops"));
        assert_eq!(requests[0].tools.len(), 1);
    }

    #[tokio::test]
    async fn environment_facts_feed_the_prompt() {
        let (transport, backend, orchestrator, _) = setup(scripted(vec![says("ok", "stop")]));
        transport.on_command(
            ENV_SCRIPT,
            Ok(MockTransport::stdout(
                "OS:Linux 6.1.0\nHOST:web-01\nUSER:deploy\nCWD:/srv/app\n",
            )),
        );
        orchestrator.ask("web", "hi", &[]).await.unwrap();
        let requests = backend.requests.lock();
        let system = requests[0].messages[0].text();
        assert!(system.contains("OS: Linux 6.1.0"));
        assert!(system.contains("Host: web-01"));
        assert!(system.contains("Working directory: /srv/app"));
    }

    #[tokio::test]
    async fn tool_results_are_fed_back() {
        let (transport, backend, orchestrator, bus) = setup(scripted(vec![
            wants(vec![tool_call("call_1", r#"{"command":"df -h"}"#)]),
            says("Disk is 40% full.", "stop"),
        ]));
        transport.on_command("df -h", Ok(MockTransport::stdout("/dev/sda1 40%\n")));
        let mut events = bus.subscribe();

        let reply = orchestrator.ask("web", "disk?", &[]).await.unwrap();
        assert_eq!(reply.content, "Disk is 40% full.");
        assert_eq!(reply.iterations, 2);
        assert_eq!(reply.tool_calls[0].status, ToolCallStatus::Completed);
        assert_eq!(reply.tool_calls[0].result.as_deref(), Some("/dev/sda1 40%"));

        let requests = backend.requests.lock();
        let second = &requests[1].messages;
        let assistant = &second[second.len() - 2];
        assert_eq!(assistant.requested_tools()[0].id, "call_1");
        let tool = second.last().unwrap();
        assert_eq!(tool.role, "tool");
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool.text(), "/dev/sda1 40%");

        let record_id = reply.tool_calls[0].id.clone();
        assert_ne!(record_id, "call_1");
        assert_eq!(reply.tool_calls[0].tool_call_id.as_deref(), Some("call_1"));
        assert!(matches!(events.try_recv(), Ok(Event::ToolStarted(r)) if r.id == record_id));
        assert!(matches!(events.try_recv(), Ok(Event::ToolCompleted(r)) if r.id == record_id));
    }

    #[tokio::test]
    async fn failed_command_does_not_abort_the_loop() {
        let (transport, backend, orchestrator, _) = setup(scripted(vec![
            wants(vec![tool_call("c1", r#"{"command":"systemctl status nginx"}"#)]),
            says("nginx could not be checked.", "stop"),
        ]));
        transport.on_command("systemctl status nginx", Err("channel closed".to_string()));

        let reply = orchestrator.ask("web", "nginx?", &[]).await.unwrap();
        assert_eq!(reply.tool_calls[0].status, ToolCallStatus::Error);
        let requests = backend.requests.lock();
        let feedback = requests[1].messages.last().unwrap().text().to_string();
        assert!(feedback.contains("channel closed"), "{feedback}");
        assert_eq!(orchestrator.get_tool_call_stats().error, 1);
    }

    #[tokio::test]
    async fn malformed_arguments_become_error_records() {
        let (transport, backend, orchestrator, bus) = setup(scripted(vec![
            wants(vec![tool_call("bad", "not json"), {
                let mut call = tool_call("other", "{}");
                call.function.name = "delete_server".to_string();
                call
            }]),
            says("Sorry.", "stop"),
        ]));
        let mut events = bus.subscribe();

        let reply = orchestrator.ask("web", "go", &[]).await.unwrap();
        assert!(reply
            .tool_calls
            .iter()
            .all(|r| r.status == ToolCallStatus::Error));
        assert!(reply.tool_calls[1]
            .error
            .as_deref()
            .unwrap()
            .contains("unknown tool"));
        // Only the environment script reached the transport.
        assert_eq!(transport.exec_count(), 1);
        assert_eq!(backend.requests.lock()[1].messages.iter().filter(|m| m.role == "tool").count(), 2);

        for record in &reply.tool_calls {
            assert!(matches!(events.try_recv(), Ok(Event::ToolStarted(r)) if r.id == record.id && r.status == ToolCallStatus::Executing));
            assert!(matches!(events.try_recv(), Ok(Event::ToolFailed(r)) if r.id == record.id));
        }
        assert!(events.try_recv().is_err());
        assert_eq!(orchestrator.get_tool_call_stats().error, 2);
    }

    #[tokio::test]
    async fn reused_model_ids_keep_separate_records() {
        let (transport, _, orchestrator, _) = setup(scripted(vec![
            wants(vec![tool_call("call_0", r#"{"command":"uptime"}"#)]),
            says("up", "stop"),
            wants(vec![tool_call("call_0", r#"{"command":"df -h"}"#)]),
            says("disk", "stop"),
        ]));
        transport.on_command("uptime", Ok(MockTransport::stdout("up 3 days")));
        transport.on_command("df -h", Ok(MockTransport::stdout("/dev/sda1 40%")));

        let first = orchestrator.ask("web", "uptime?", &[]).await.unwrap();
        orchestrator.ask("web", "disk?", &[]).await.unwrap();

        let commands: Vec<_> = orchestrator
            .ledger()
            .list()
            .into_iter()
            .map(|r| r.command)
            .collect();
        assert_eq!(commands, vec!["uptime", "df -h"]);
        let stats = orchestrator.get_tool_call_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 2);

        let retried = orchestrator
            .retry_tool_call(&first.tool_calls[0].id)
            .await
            .unwrap();
        assert_eq!(retried.command, "uptime");
    }

    #[tokio::test]
    async fn never_more_than_ten_round_trips() {
        let backend = ScriptedBackend {
            fallback: Some(wants(vec![tool_call("loop", r#"{"command":"uptime"}"#)])),
            ..Default::default()
        };
        let (transport, backend, orchestrator, _) = setup(backend);

        let reply = orchestrator.ask("web", "loop forever", &[]).await.unwrap();
        assert!(reply.capped);
        assert_eq!(reply.content, TOO_MANY_TOOL_CALLS);
        assert_eq!(backend.requests.lock().len(), 10);
        assert_eq!(transport.exec_count_for("web"), 1 + 9);
        assert_eq!(reply.tool_calls.len(), 9);
        assert_eq!(orchestrator.get_tool_call_stats().total, 9);
    }

    #[tokio::test]
    async fn finish_reasons_are_post_processed() {
        let (_, _, orchestrator, _) = setup(scripted(vec![
            says("Partial answer", "length"),
            says("", "stop"),
            says("Hidden", "content_filter"),
        ]));
        let truncated = orchestrator.ask("web", "a", &[]).await.unwrap();
        assert!(truncated.content.starts_with("Partial answer"));
        assert!(truncated.content.contains("token limit"));

        let empty = orchestrator.ask("web", "b", &[]).await.unwrap();
        assert_eq!(empty.content, COMMAND_COMPLETED);

        let filtered = orchestrator.ask("web", "c", &[]).await.unwrap();
        assert!(filtered.content.contains("content filter"));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let (_, backend, orchestrator, _) = setup(scripted(vec![says("ok", "stop")]));
        let history: Vec<_> = (0..50)
            .map(|i| ChatMessage::user(format!("message {i}")))
            .collect();
        orchestrator.ask("web", "latest", &history).await.unwrap();
        let requests = backend.requests.lock();
        let messages = &requests[0].messages;
        // system + 20 history + the new message
        assert_eq!(messages.len(), 22);
        assert_eq!(messages[1].text(), "message 30");
        assert_eq!(messages.last().unwrap().text(), "latest");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_commands_time_out() {
        let (transport, _, orchestrator, _) = setup(scripted(vec![
            wants(vec![tool_call("t", r#"{"command":"tail -f /var/log/syslog"}"#)]),
            says("That command never finished.", "stop"),
        ]));
        transport.set_exec_delay(Duration::from_secs(120));

        let reply = orchestrator.ask("web", "follow logs", &[]).await.unwrap();
        assert_eq!(reply.tool_calls[0].status, ToolCallStatus::Timeout);
        assert_eq!(orchestrator.get_tool_call_stats().timeout, 1);
    }

    #[tokio::test]
    async fn retry_adds_a_new_record() {
        let (transport, _, orchestrator, _) = setup(scripted(vec![
            wants(vec![tool_call("c1", r#"{"command":"free -m"}"#)]),
            says("done", "stop"),
        ]));
        transport.on_command("free -m", Ok(MockTransport::stdout("Mem: 100 50")));
        let reply = orchestrator.ask("web", "memory?", &[]).await.unwrap();
        let original = reply.tool_calls[0].id.clone();

        let retried = orchestrator.retry_tool_call(&original).await.unwrap();
        assert_ne!(retried.id, original);
        assert_eq!(retried.tool_call_id, None);
        assert_eq!(retried.command, "free -m");
        assert_eq!(retried.status, ToolCallStatus::Completed);

        let stats = orchestrator.get_tool_call_stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.success_rate, 1.0);
        assert!(matches!(
            orchestrator.retry_tool_call("missing").await,
            Err(CoreError::NotFound)
        ));

        orchestrator.clear_tool_calls();
        assert!(orchestrator.ledger().is_empty());
    }

    #[tokio::test]
    async fn rejects_disconnected_connections() {
        let (_, backend, orchestrator, _) = setup(scripted(vec![]));
        orchestrator
            .connections
            .update("web", |c| c.status = ConnectionStatus::Disconnected);
        assert!(matches!(
            orchestrator.ask("web", "hi", &[]).await,
            Err(CoreError::NotConnected(_))
        ));
        assert!(backend.requests.lock().is_empty());
    }

    #[test]
    fn ledger_keeps_the_newest_hundred() {
        let ledger = ToolCallLedger::default();
        let ids: Vec<_> = (0..(TOOL_HISTORY_LIMIT + 5))
            .map(|i| {
                let record = ToolCallRecord::started(None, format!("echo {i}"), "web");
                ledger.record(record.clone());
                record.id
            })
            .collect();
        assert_eq!(ledger.len(), TOOL_HISTORY_LIMIT);
        assert!(ledger.get(&ids[0]).is_none());
        assert!(ledger.get(&ids[TOOL_HISTORY_LIMIT + 4]).is_some());
        assert_eq!(ledger.stats().executing, TOOL_HISTORY_LIMIT);
    }

    #[test]
    fn long_output_is_truncated() {
        let long = "x".repeat(TOOL_OUTPUT_LIMIT + 10);
        let out = truncate_output(&long);
        assert!(out.ends_with("[output truncated]"));
        assert_eq!(truncate_output("short"), "short");
    }
}
