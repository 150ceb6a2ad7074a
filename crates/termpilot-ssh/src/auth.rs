use crate::host_keys::HostKeyVerifier;
use crate::options::Credential;
use anyhow::{bail, Result};
use russh::client::{AuthResult, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{load_secret_key, Algorithm, HashAlg};
use std::sync::Arc;
use tracing::debug;

type Session = Handle<HostKeyVerifier>;

pub(crate) async fn authenticate(handle: &mut Session, username: &str, credential: &Credential) -> Result<()> {
    let accepted = match credential {
        Credential::Password(password) => {
            let res = handle
                .authenticate_password(username, password.as_str())
                .await?;
            matches!(res, AuthResult::Success)
        }
        Credential::KeyFile { path, passphrase } => {
            let key = load_secret_key(path, passphrase.as_ref().map(|p| p.as_str()))
                .map_err(|e| anyhow::anyhow!("cannot load {}: {e}", path.display()))?;
            let hash = rsa_hash(handle, key.algorithm()).await?;
            let res = handle
                .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), hash))
                .await?;
            matches!(res, AuthResult::Success)
        }
        Credential::Agent => with_agent(handle, username).await?,
    };
    if !accepted {
        bail!("authentication rejected for {username}");
    }
    Ok(())
}

/// RSA keys need the strongest SHA-2 variant the server offers.
async fn rsa_hash(handle: &Session, algorithm: Algorithm) -> Result<Option<HashAlg>> {
    if matches!(algorithm, Algorithm::Rsa { .. }) {
        Ok(handle.best_supported_rsa_hash().await?.flatten())
    } else {
        Ok(None)
    }
}

async fn with_agent(handle: &mut Session, username: &str) -> Result<bool> {
    #[cfg(unix)]
    let mut agent = russh::keys::agent::client::AgentClient::connect_env().await?;

    #[cfg(windows)]
    let mut agent = {
        let pipe = std::env::var("SSH_AUTH_SOCK")
            .unwrap_or_else(|_| r"\\.\pipe\openssh-ssh-agent".to_string());
        let stream = tokio::net::windows::named_pipe::ClientOptions::new().open(pipe)?;
        russh::keys::agent::client::AgentClient::connect(stream)
    };

    let identities = agent.request_identities().await?;
    debug!(count = identities.len(), "trying agent identities");
    for key in identities {
        let hash = rsa_hash(handle, key.algorithm()).await?;
        let res = handle
            .authenticate_publickey_with(username, key, hash, &mut agent)
            .await?;
        if matches!(res, AuthResult::Success) {
            return Ok(true);
        }
    }
    Ok(false)
}
