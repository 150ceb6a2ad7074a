use anyhow::Result;
use russh_sftp::client::SftpSession;
use std::cmp::Ordering;
use tokio::io::{AsyncRead, AsyncWrite};

/// One row of a remote directory listing, as shown in the files panel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub permissions: Option<u32>,
    /// Unix seconds.
    pub modified: Option<u64>,
}

pub struct RemoteFs {
    sftp: SftpSession,
}

impl RemoteFs {
    pub async fn over<S>(stream: S) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Ok(Self {
            sftp: SftpSession::new(stream).await?,
        })
    }

    /// Lists `dir` with directories first, each group sorted by name.
    pub async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        for item in self.sftp.read_dir(dir).await? {
            let name = item.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let meta = item.metadata();
            let kind = meta.file_type();
            entries.push(RemoteEntry {
                path: join_remote(dir, &name),
                name,
                size: meta.size.unwrap_or(0),
                is_dir: kind.is_dir(),
                is_symlink: kind.is_symlink(),
                permissions: meta.permissions,
                modified: meta.mtime.map(u64::from),
            });
        }
        entries.sort_by(listing_order);
        Ok(entries)
    }

    pub async fn close(&self) -> Result<()> {
        self.sftp.close().await?;
        Ok(())
    }
}

fn listing_order(a: &RemoteEntry, b: &RemoteEntry) -> Ordering {
    b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name))
}

pub fn join_remote(dir: &str, name: &str) -> String {
    match dir {
        "" => name.to_string(),
        d if d.ends_with('/') => format!("{d}{name}"),
        d => format!("{d}/{name}"),
    }
}
