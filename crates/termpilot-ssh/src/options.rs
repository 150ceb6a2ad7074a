use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use zeroize::Zeroizing;

/// Who to log in as and with which secret.
#[derive(Clone, Debug)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

impl SshTarget {
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub enum Credential {
    Password(Zeroizing<String>),
    KeyFile {
        path: PathBuf,
        passphrase: Option<Zeroizing<String>>,
    },
    Agent,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Only hosts already present in known_hosts are accepted.
    Strict,
    /// Unknown hosts are learned; changed keys are still rejected.
    #[default]
    AcceptNew,
    InsecureAcceptAny,
}

impl FromStr for HostKeyPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(HostKeyPolicy::Strict),
            "accept-new" | "accept_new" | "" => Ok(HostKeyPolicy::AcceptNew),
            "insecure" | "insecure-accept-any" => Ok(HostKeyPolicy::InsecureAcceptAny),
            other => Err(format!("unknown host key policy: {other}")),
        }
    }
}

impl fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HostKeyPolicy::Strict => "strict",
            HostKeyPolicy::AcceptNew => "accept-new",
            HostKeyPolicy::InsecureAcceptAny => "insecure-accept-any",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PtySize {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

impl Default for PtySize {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            cols: 120,
            rows: 40,
        }
    }
}

/// Transport-wide knobs shared by every connection.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts: PathBuf,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    pub pty: PtySize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host_key_policy: HostKeyPolicy::default(),
            known_hosts: default_known_hosts(),
            keepalive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pty: PtySize::default(),
        }
    }
}

impl ConnectOptions {
    pub(crate) fn client_config(&self) -> russh::client::Config {
        russh::client::Config {
            keepalive_interval: (!self.keepalive.is_zero()).then_some(self.keepalive),
            keepalive_max: 3,
            ..Default::default()
        }
    }
}

pub fn default_known_hosts() -> PathBuf {
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"));
    match home {
        Some(home) => PathBuf::from(home).join(".ssh").join("known_hosts"),
        None => PathBuf::from("known_hosts"),
    }
}
