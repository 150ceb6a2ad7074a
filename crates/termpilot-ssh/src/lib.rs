mod auth;
mod host_keys;

pub mod client;
pub mod options;
pub mod sftp;

pub use client::{ExecOutput, ShellChannel, SshConnection};
pub use options::{default_known_hosts, ConnectOptions, Credential, HostKeyPolicy, PtySize, SshTarget};
pub use sftp::{RemoteEntry, RemoteFs};
