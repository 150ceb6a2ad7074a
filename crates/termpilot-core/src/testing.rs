//! In-memory transport used by the unit tests. Responses are scripted per
//! command and every call is counted.

use crate::transport::{
    ClientHandle, CommandOutput, ConnectParams, SessionResources, SftpHandle, ShellStream,
    Transport,
};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use termpilot_ssh::RemoteEntry;

#[derive(Default)]
pub struct ResourceCounters {
    pub shell_end: AtomicUsize,
    pub shell_destroy: AtomicUsize,
    pub sftp_end: AtomicUsize,
    pub client_end: AtomicUsize,
}

impl ResourceCounters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<HashMap<String, Result<CommandOutput, String>>>,
    default_response: Mutex<Option<Result<CommandOutput, String>>>,
    connect_error: Mutex<Option<String>>,
    connect_errors_by_key: Mutex<HashMap<String, String>>,
    connect_delay: Mutex<Option<Duration>>,
    exec_delay: Mutex<Option<Duration>>,
    session_error: Mutex<Option<String>>,
    sftp_end_fails: Mutex<bool>,
    commands: Mutex<Vec<(String, String)>>,
    connects: Mutex<Vec<String>>,
    disconnects: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    sessions_opened: AtomicUsize,
    pub resources: Arc<ResourceCounters>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stdout(text: &str) -> CommandOutput {
        CommandOutput {
            stdout: text.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn on_command(&self, command: &str, response: Result<CommandOutput, String>) {
        self.responses.lock().insert(command.to_string(), response);
    }

    pub fn set_default(&self, response: Result<CommandOutput, String>) {
        *self.default_response.lock() = Some(response);
    }

    pub fn fail_connect(&self, error: Option<&str>) {
        *self.connect_error.lock() = error.map(str::to_string);
    }

    pub fn fail_connect_for(&self, key: &str, error: &str) {
        self.connect_errors_by_key
            .lock()
            .insert(key.to_string(), error.to_string());
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        *self.exec_delay.lock() = Some(delay);
    }

    pub fn fail_sessions(&self, error: Option<&str>) {
        *self.session_error.lock() = error.map(str::to_string);
    }

    pub fn fail_sftp_end(&self) {
        *self.sftp_end_fails.lock() = true;
    }

    pub fn exec_count(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn exec_count_for(&self, key: &str) -> usize {
        self.commands.lock().iter().filter(|(k, _)| k == key).count()
    }

    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().clone()
    }

    pub fn disconnects(&self) -> Vec<String> {
        self.disconnects.lock().clone()
    }

    pub fn max_concurrent_execs(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, key: &str, _params: &ConnectParams) -> Result<()> {
        self.connects.lock().push(key.to_string());
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let error = self
            .connect_errors_by_key
            .lock()
            .get(key)
            .cloned()
            .or_else(|| self.connect_error.lock().clone());
        match error {
            Some(err) => Err(anyhow::anyhow!(err)),
            None => Ok(()),
        }
    }

    async fn execute(&self, key: &str, command: &str) -> Result<CommandOutput> {
        self.commands
            .lock()
            .push((key.to_string(), command.to_string()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.exec_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.responses.lock().get(command).cloned();
        let response = scripted
            .or_else(|| self.default_response.lock().clone())
            .unwrap_or_else(|| Ok(Self::stdout("")));
        response.map_err(|e| anyhow::anyhow!(e))
    }

    async fn disconnect(&self, key: &str) {
        self.disconnects.lock().push(key.to_string());
    }

    async fn open_session(&self, _key: &str, _params: &ConnectParams) -> Result<SessionResources> {
        let error = self.session_error.lock().clone();
        if let Some(err) = error {
            return Err(anyhow::anyhow!(err));
        }
        self.sessions_opened.fetch_add(1, Ordering::SeqCst);
        let sftp_fails = *self.sftp_end_fails.lock();
        Ok(SessionResources {
            shell: Some(Box::new(MockShell(self.resources.clone()))),
            sftp: Some(Box::new(MockSftp(self.resources.clone(), sftp_fails))),
            client: Some(Box::new(MockClient(self.resources.clone()))),
        })
    }
}

struct MockShell(Arc<ResourceCounters>);

#[async_trait]
impl ShellStream for MockShell {
    async fn write(&self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn end(&self) -> Result<()> {
        self.0.shell_end.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self) {
        self.0.shell_destroy.fetch_add(1, Ordering::SeqCst);
    }
}

struct MockSftp(Arc<ResourceCounters>, bool);

#[async_trait]
impl SftpHandle for MockSftp {
    async fn read_dir(&self, _path: &str) -> Result<Vec<RemoteEntry>> {
        Ok(Vec::new())
    }

    async fn end(&self) -> Result<()> {
        self.0.sftp_end.fetch_add(1, Ordering::SeqCst);
        if self.1 {
            return Err(anyhow::anyhow!("sftp channel already closed"));
        }
        Ok(())
    }
}

struct MockClient(Arc<ResourceCounters>);

#[async_trait]
impl ClientHandle for MockClient {
    async fn end(&self) -> Result<()> {
        self.0.client_end.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
