use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use termpilot_config::SshDefaults;
use termpilot_ssh::{
    default_known_hosts, ConnectOptions, Credential, HostKeyPolicy, PtySize, RemoteEntry, RemoteFs,
    ShellChannel, SshConnection, SshTarget,
};
use tracing::{debug, warn};
use zeroize::Zeroizing;

#[derive(Clone, Debug)]
pub enum AuthMethod {
    Password {
        password: Zeroizing<String>,
    },
    Key {
        private_key_path: PathBuf,
        passphrase: Option<Zeroizing<String>>,
    },
    Agent,
}

impl AuthMethod {
    pub fn as_key(&self) -> &str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "key",
            AuthMethod::Agent => "agent",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// The raw SSH capability consumed by the core. Every physical connection is
/// addressed by a channel key; a logical connection may own several keys.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, key: &str, params: &ConnectParams) -> Result<()>;

    async fn execute(&self, key: &str, command: &str) -> Result<CommandOutput>;

    /// Best effort; failures are logged by the implementation.
    async fn disconnect(&self, key: &str);

    /// Opens the per-session sub-resources (own client, shell, SFTP).
    async fn open_session(&self, key: &str, params: &ConnectParams) -> Result<SessionResources>;
}

#[async_trait]
pub trait ShellStream: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<()>;
    async fn end(&self) -> Result<()>;
    async fn destroy(&self);
}

#[async_trait]
pub trait SftpHandle: Send + Sync {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>>;
    async fn end(&self) -> Result<()>;
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn end(&self) -> Result<()>;
}

#[derive(Default)]
pub struct SessionResources {
    pub shell: Option<Box<dyn ShellStream>>,
    pub sftp: Option<Box<dyn SftpHandle>>,
    pub client: Option<Box<dyn ClientHandle>>,
}

pub struct RusshTransport {
    options: ConnectOptions,
    connections: Mutex<HashMap<String, SshConnection>>,
}

impl RusshTransport {
    pub fn new(defaults: SshDefaults) -> Self {
        let host_key_policy = defaults.host_key_policy.parse().unwrap_or_else(|err| {
            warn!(error = %err, "falling back to accept-new host key policy");
            HostKeyPolicy::AcceptNew
        });
        let options = ConnectOptions {
            host_key_policy,
            known_hosts: defaults.known_hosts_path.clone().unwrap_or_else(default_known_hosts),
            keepalive: Duration::from_secs(defaults.keepalive_interval_secs),
            connect_timeout: Duration::from_millis(defaults.connect_timeout_ms),
            pty: PtySize::default(),
        };
        Self {
            options,
            connections: Mutex::new(HashMap::new()),
        }
    }

    async fn dial(&self, params: &ConnectParams) -> Result<SshConnection> {
        let credential = match &params.auth {
            AuthMethod::Password { password } => Credential::Password(password.clone()),
            AuthMethod::Key {
                private_key_path,
                passphrase,
            } => Credential::KeyFile {
                path: private_key_path.clone(),
                passphrase: passphrase.clone(),
            },
            AuthMethod::Agent => Credential::Agent,
        };
        let target = SshTarget {
            host: params.host.clone(),
            port: params.port,
            username: params.username.clone(),
            credential,
        };
        SshConnection::open(&target, self.options.clone()).await
    }

    fn connection(&self, key: &str) -> Result<SshConnection> {
        self.connections
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no open ssh connection for {key}"))
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn connect(&self, key: &str, params: &ConnectParams) -> Result<()> {
        let conn = self.dial(params).await?;
        let previous = self.connections.lock().insert(key.to_string(), conn);
        if let Some(previous) = previous {
            if let Err(err) = previous.close().await {
                debug!(key, error = %err, "replaced connection did not close cleanly");
            }
        }
        debug!(key, host = %params.host, "transport connected");
        Ok(())
    }

    async fn execute(&self, key: &str, command: &str) -> Result<CommandOutput> {
        let out = self.connection(key)?.exec(command).await?;
        Ok(CommandOutput {
            stdout: out.stdout_text(),
            stderr: out.stderr_text(),
            exit_code: out.exit_code,
        })
    }

    async fn disconnect(&self, key: &str) {
        let conn = self.connections.lock().remove(key);
        if let Some(conn) = conn {
            if let Err(err) = conn.close().await {
                warn!(key, error = %err, "transport disconnect failed");
            }
        }
    }

    async fn open_session(&self, key: &str, params: &ConnectParams) -> Result<SessionResources> {
        let conn = self.dial(params).await?;
        let shell = conn.open_shell().await?;
        let sftp = match conn.open_sftp().await {
            Ok(sftp) => Some(Box::new(RusshSftp(sftp)) as Box<dyn SftpHandle>),
            Err(err) => {
                warn!(key, error = %err, "sftp unavailable for session");
                None
            }
        };
        Ok(SessionResources {
            shell: Some(Box::new(RusshShell(tokio::sync::Mutex::new(shell)))),
            sftp,
            client: Some(Box::new(RusshClient(conn))),
        })
    }
}

struct RusshShell(tokio::sync::Mutex<ShellChannel>);

#[async_trait]
impl ShellStream for RusshShell {
    async fn write(&self, data: &[u8]) -> Result<()> {
        self.0.lock().await.send(data).await
    }

    async fn end(&self) -> Result<()> {
        self.0.lock().await.end().await
    }

    async fn destroy(&self) {
        self.0.lock().await.destroy();
    }
}

struct RusshSftp(RemoteFs);

#[async_trait]
impl SftpHandle for RusshSftp {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        self.0.list(path).await
    }

    async fn end(&self) -> Result<()> {
        self.0.close().await
    }
}

struct RusshClient(SshConnection);

#[async_trait]
impl ClientHandle for RusshClient {
    async fn end(&self) -> Result<()> {
        self.0.close().await
    }
}
