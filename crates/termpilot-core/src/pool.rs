use crate::bridge::{CommandBridge, ExecuteOptions};
use crate::connection::ConnectionId;
use crate::error::CoreError;
use crate::metrics::{parse_batch_output, SystemMetrics, BATCH_SCRIPT};
use crate::transport::{ConnectParams, Transport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use termpilot_config::PoolConfig;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub fn pool_key(id: &str) -> String {
    format!("{id}#pool")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolStatus {
    Connected,
    Error,
}

#[derive(Clone, Debug)]
pub struct PoolEntry {
    pub connection_id: ConnectionId,
    pub params: ConnectParams,
    pub status: PoolStatus,
    pub last_used: Instant,
    pub error_count: u32,
    pub is_executing: bool,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthCheck {
    pub healthy: bool,
    pub error_count: u32,
    pub status: PoolStatus,
}

/// Persistent side connections used for cheap periodic polling.
pub struct ConnectionPool {
    transport: Arc<dyn Transport>,
    bridge: Arc<CommandBridge>,
    entries: Mutex<HashMap<ConnectionId, PoolEntry>>,
    config: PoolConfig,
    heartbeat_command: String,
}

impl ConnectionPool {
    pub fn new(
        transport: Arc<dyn Transport>,
        bridge: Arc<CommandBridge>,
        config: PoolConfig,
        heartbeat_command: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            bridge,
            entries: Mutex::new(HashMap::new()),
            config,
            heartbeat_command: heartbeat_command.into(),
        }
    }

    pub async fn create_persistent_connection(
        &self,
        id: &str,
        params: ConnectParams,
    ) -> Result<(), CoreError> {
        self.transport
            .connect(&pool_key(id), &params)
            .await
            .map_err(|e| CoreError::Ssh(e.to_string()))?;
        let entry = PoolEntry {
            connection_id: id.to_string(),
            params,
            status: PoolStatus::Connected,
            last_used: Instant::now(),
            error_count: 0,
            is_executing: false,
            last_error: None,
        };
        self.entries.lock().insert(id.to_string(), entry);
        info!(connection_id = %id, "pool entry created");
        Ok(())
    }

    /// Runs the diagnostic script once. Returns `None` without touching the
    /// transport when the entry is missing, quarantined, or still busy with
    /// the previous poll; also `None` when the poll itself fails.
    pub async fn execute_batch_command(&self, id: &str) -> Option<SystemMetrics> {
        {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(id)?;
            if entry.is_executing || entry.status == PoolStatus::Error {
                return None;
            }
            entry.is_executing = true;
            entry.last_used = Instant::now();
        }

        let result = self
            .bridge
            .dispatch(&pool_key(id), BATCH_SCRIPT, &ExecuteOptions::monitor())
            .await;
        let parsed = if result.success {
            parse_batch_output(&result.output).map_err(|e| e.to_string())
        } else {
            Err(result
                .error
                .unwrap_or_else(|| "diagnostic command failed".to_string()))
        };

        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id)?;
        entry.is_executing = false;
        match parsed {
            Ok(metrics) => {
                Self::record_success(entry);
                Some(metrics)
            }
            Err(err) => {
                self.record_failure(entry, err);
                None
            }
        }
    }

    pub async fn check_connection_health(&self, id: &str) -> Result<HealthCheck, CoreError> {
        {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(id).ok_or(CoreError::NotFound)?;
            entry.last_used = Instant::now();
        }

        let result = self
            .bridge
            .dispatch(&pool_key(id), &self.heartbeat_command, &ExecuteOptions::monitor())
            .await;

        let mut entries = self.entries.lock();
        let entry = entries.get_mut(id).ok_or(CoreError::NotFound)?;
        if result.success {
            Self::record_success(entry);
        } else {
            let err = result
                .error
                .unwrap_or_else(|| "heartbeat failed".to_string());
            self.record_failure(entry, err);
        }
        Ok(HealthCheck {
            healthy: result.success,
            error_count: entry.error_count,
            status: entry.status,
        })
    }

    /// Closes the pooled connection (best effort) and drops the entry even
    /// when the close fails. Returns whether an entry existed.
    pub async fn close_persistent_connection(&self, id: &str) -> bool {
        if !self.entries.lock().contains_key(id) {
            return false;
        }
        let key = pool_key(id);
        self.transport.disconnect(&key).await;
        self.bridge.release(&key);
        self.entries.lock().remove(id);
        debug!(connection_id = %id, "pool entry closed");
        true
    }

    /// Evicts entries that are quarantined or idle past the configured
    /// limit. Returns the evicted ids.
    pub async fn cleanup(&self) -> Vec<ConnectionId> {
        let limit = Duration::from_secs(self.config.idle_evict_secs);
        let stale: Vec<ConnectionId> = self
            .entries
            .lock()
            .values()
            .filter(|e| {
                !e.is_executing
                    && (e.status == PoolStatus::Error || e.last_used.elapsed() >= limit)
            })
            .map(|e| e.connection_id.clone())
            .collect();
        for id in &stale {
            info!(connection_id = %id, "evicting pool entry");
            self.close_persistent_connection(id).await;
        }
        stale
    }

    pub fn start_cleanup(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = Duration::from_secs(self.config.cleanup_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.cleanup().await;
                    }
                }
            }
        })
    }

    pub fn entry(&self, id: &str) -> Option<PoolEntry> {
        self.entries.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn record_success(entry: &mut PoolEntry) {
        entry.error_count = 0;
        entry.last_error = None;
        entry.status = PoolStatus::Connected;
    }

    fn record_failure(&self, entry: &mut PoolEntry, err: String) {
        entry.error_count += 1;
        warn!(
            connection_id = %entry.connection_id,
            error_count = entry.error_count,
            error = %err,
            "pool command failed"
        );
        entry.last_error = Some(err);
        if entry.error_count >= self.config.max_errors {
            entry.status = PoolStatus::Error;
        }
    }
}
