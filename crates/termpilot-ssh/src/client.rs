use crate::auth::authenticate;
use crate::host_keys::HostKeyVerifier;
use crate::options::{ConnectOptions, SshTarget};
use crate::sftp::RemoteFs;
use anyhow::{Context, Result};
use russh::client::{self, Handle};
use russh::{ChannelMsg, ChannelWriteHalf, Disconnect};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

/// Output of one `exec` channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    /// Set when the remote process was killed by a signal.
    pub exit_signal: Option<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if let Some(signal) = &self.exit_signal {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&format!("terminated by signal {signal}"));
        }
        text
    }

    fn absorb(&mut self, msg: ChannelMsg) {
        match msg {
            ChannelMsg::Data { data } => self.stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, .. } => self.stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => self.exit_code = Some(exit_status as i32),
            ChannelMsg::ExitSignal { signal_name, .. } => {
                self.exit_signal = Some(format!("{signal_name:?}"))
            }
            _ => {}
        }
    }
}

/// One authenticated SSH connection. Clones share the same socket.
#[derive(Clone)]
pub struct SshConnection {
    handle: Arc<Mutex<Handle<HostKeyVerifier>>>,
    options: Arc<ConnectOptions>,
    label: Arc<str>,
}

impl SshConnection {
    pub async fn open(target: &SshTarget, options: ConnectOptions) -> Result<Self> {
        let verifier = HostKeyVerifier {
            host: target.host.clone(),
            port: target.port,
            policy: options.host_key_policy,
            known_hosts: options.known_hosts.clone(),
        };
        let label = target.label();
        let connecting = client::connect(
            Arc::new(options.client_config()),
            (target.host.as_str(), target.port),
            verifier,
        );
        let mut handle = tokio::time::timeout(options.connect_timeout, connecting)
            .await
            .map_err(|_| anyhow::anyhow!("timed out connecting to {label}"))?
            .with_context(|| format!("cannot reach {label}"))?;

        authenticate(&mut handle, &target.username, &target.credential).await?;
        debug!(target = %label, "ssh connection ready");

        Ok(Self {
            handle: Arc::new(Mutex::new(handle)),
            options: Arc::new(options),
            label: label.into(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Runs `command` on a fresh channel and waits for it to close.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let channel = self.handle.lock().await.channel_open_session().await?;
        channel.exec(true, command).await?;
        let (mut reader, _writer) = channel.split();
        let mut out = ExecOutput::default();
        while let Some(msg) = reader.wait().await {
            if matches!(msg, ChannelMsg::Close) {
                break;
            }
            out.absorb(msg);
        }
        Ok(out)
    }

    pub async fn open_shell(&self) -> Result<ShellChannel> {
        let channel = self.handle.lock().await.channel_open_session().await?;
        let pty = &self.options.pty;
        channel
            .request_pty(true, &pty.term, pty.cols, pty.rows, 0, 0, &[])
            .await?;
        channel.request_shell(true).await?;

        let (mut reader, writer) = channel.split();
        let (tx, rx) = mpsc::channel(256);
        let pump = tokio::spawn(async move {
            while let Some(msg) = reader.wait().await {
                let chunk = match msg {
                    ChannelMsg::Data { data } => data.to_vec(),
                    ChannelMsg::ExtendedData { data, .. } => data.to_vec(),
                    ChannelMsg::Eof | ChannelMsg::Close => break,
                    _ => continue,
                };
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        Ok(ShellChannel {
            writer,
            output: rx,
            pump,
        })
    }

    pub async fn open_sftp(&self) -> Result<RemoteFs> {
        let channel = self.handle.lock().await.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        RemoteFs::over(channel.into_stream()).await
    }

    pub async fn close(&self) -> Result<()> {
        self.handle
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "closed by user", "en")
            .await?;
        debug!(target = %self.label, "ssh connection closed");
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        self.handle.lock().await.is_closed()
    }
}

/// Interactive PTY shell. Output is pumped by a background task.
pub struct ShellChannel {
    writer: ChannelWriteHalf<client::Msg>,
    output: mpsc::Receiver<Vec<u8>>,
    pump: JoinHandle<()>,
}

impl ShellChannel {
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.writer.make_writer().write_all(data).await?;
        Ok(())
    }

    pub async fn resize(&mut self, cols: u32, rows: u32) -> Result<()> {
        self.writer.window_change(cols, rows, 0, 0).await?;
        Ok(())
    }

    /// `None` once the remote side has closed the shell.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.output.recv().await
    }

    /// Graceful close: EOF then channel close.
    pub async fn end(&mut self) -> Result<()> {
        self.writer.eof().await?;
        self.writer.close().await?;
        Ok(())
    }

    pub fn destroy(&mut self) {
        self.pump.abort();
        self.output.close();
    }
}

impl Drop for ShellChannel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
