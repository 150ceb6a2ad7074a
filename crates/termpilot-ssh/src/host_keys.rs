use crate::options::HostKeyPolicy;
use russh::keys::known_hosts::learn_known_hosts_path;
use russh::keys::{check_known_hosts_path, PublicKey};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Lookup {
    Known,
    Unknown,
    /// Host is listed with a different key, or the file could not be read.
    Conflict(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    Accept,
    Learn,
    Reject,
}

pub(crate) fn decide(policy: HostKeyPolicy, lookup: &Lookup) -> Verdict {
    match (policy, lookup) {
        (HostKeyPolicy::InsecureAcceptAny, _) => Verdict::Accept,
        (_, Lookup::Known) => Verdict::Accept,
        (HostKeyPolicy::AcceptNew, Lookup::Unknown) => Verdict::Learn,
        _ => Verdict::Reject,
    }
}

/// russh handler that checks server keys against a known_hosts file.
#[derive(Clone)]
pub(crate) struct HostKeyVerifier {
    pub host: String,
    pub port: u16,
    pub policy: HostKeyPolicy,
    pub known_hosts: PathBuf,
}

impl HostKeyVerifier {
    fn verify(&self, key: &PublicKey) -> anyhow::Result<bool> {
        let lookup = if self.policy == HostKeyPolicy::InsecureAcceptAny {
            Lookup::Unknown
        } else {
            match check_known_hosts_path(&self.host, self.port, key, &self.known_hosts) {
                Ok(true) => Lookup::Known,
                Ok(false) => Lookup::Unknown,
                Err(err) => Lookup::Conflict(err.to_string()),
            }
        };
        match decide(self.policy, &lookup) {
            Verdict::Accept => {
                if self.policy == HostKeyPolicy::InsecureAcceptAny {
                    warn!(host = %self.host, port = self.port, "host key not verified");
                }
                Ok(true)
            }
            Verdict::Learn => {
                learn_known_hosts_path(&self.host, self.port, key, &self.known_hosts)?;
                info!(host = %self.host, port = self.port, "learned new host key");
                Ok(true)
            }
            Verdict::Reject => {
                match lookup {
                    Lookup::Conflict(reason) => {
                        warn!(host = %self.host, port = self.port, %reason, "host key rejected")
                    }
                    _ => warn!(host = %self.host, port = self.port, "unknown host rejected"),
                }
                Ok(false)
            }
        }
    }
}

impl russh::client::Handler for HostKeyVerifier {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        self.verify(server_public_key)
    }
}
