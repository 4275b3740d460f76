//! The explicitly constructed server context.
//!
//! Everything that would otherwise be process-global (the room registry,
//! the instance counter, the credential store, the blacklist) hangs off one
//! [`ServerContext`] shared by the listener, every session and the admin
//! API.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use parley_shared::{InstanceId, ReasonCode};
use parley_store::{Blacklist, CredentialStore};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rooms::RoomRegistry;

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    transfers_relayed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    pub rejected: u64,
    pub transfers_relayed: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

pub struct ServerContext {
    pub config: ServerConfig,
    pub registry: RoomRegistry,
    pub credentials: Arc<CredentialStore>,
    pub blacklist: Arc<Blacklist>,
    next_instance: AtomicU64,
    counters: Counters,
    shutdown: watch::Sender<bool>,
    started_at: DateTime<Utc>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, credentials: CredentialStore, blacklist: Blacklist) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry: RoomRegistry::new(),
            credentials: Arc::new(credentials),
            blacklist: Arc::new(blacklist),
            next_instance: AtomicU64::new(1),
            counters: Counters::default(),
            shutdown,
            started_at: Utc::now(),
        }
    }

    /// Open the credential store and blacklist named in `config`.
    pub fn open(config: ServerConfig) -> Result<Self, ServerError> {
        let credentials = CredentialStore::open(&config.credentials_path)?;
        let blacklist = Blacklist::load(&config.blacklist_path)?;
        Ok(Self::new(config, credentials, blacklist))
    }

    pub fn next_instance_id(&self) -> InstanceId {
        InstanceId(self.next_instance.fetch_add(1, Ordering::Relaxed))
    }

    pub fn record_accepted(&self) {
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transfer(&self) {
        self.counters.transfers_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            transfers_relayed: self.counters.transfers_relayed.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        }
    }

    pub fn is_blacklisted(&self, ip: &IpAddr) -> bool {
        self.blacklist.contains(ip)
    }

    /// Ask one session to close with `reason`.
    pub async fn disconnect(&self, id: InstanceId, reason: ReasonCode) -> bool {
        self.registry.disconnect(id, reason).await
    }

    /// Disconnect one session with `KICKED`.
    pub async fn kick(&self, id: InstanceId) -> bool {
        let found = self.disconnect(id, ReasonCode::Kicked).await;
        if found {
            info!(instance = %id, "Session kicked");
        }
        found
    }

    /// Persist `ip` in the blacklist and disconnect every session coming
    /// from it. Returns how many sessions were told to close.
    pub async fn blacklist_address(&self, ip: IpAddr) -> Result<usize, ServerError> {
        let blacklist = self.blacklist.clone();
        tokio::task::spawn_blocking(move || blacklist.add(ip))
            .await
            .map_err(|e| ServerError::Internal(format!("blacklist task failed: {e}")))??;

        let mut closed = 0;
        for id in self.registry.sessions_from(ip).await {
            if self.registry.disconnect(id, ReasonCode::Blacklisted).await {
                closed += 1;
            }
        }
        warn!(%ip, sessions = closed, "Address blacklisted");
        Ok(closed)
    }

    pub async fn unblacklist_address(&self, ip: IpAddr) -> Result<bool, ServerError> {
        let blacklist = self.blacklist.clone();
        let removed = tokio::task::spawn_blocking(move || blacklist.remove(&ip))
            .await
            .map_err(|e| ServerError::Internal(format!("blacklist task failed: {e}")))??;
        Ok(removed)
    }

    /// Stop accepting and close every session with `SERVER_CLOSED`.
    /// Calling it again is harmless.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let sessions = self.registry.disconnect_all(ReasonCode::ServerClosed).await;
        info!(sessions, "Server shutting down");
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_context(dir: &TempDir) -> ServerContext {
        let config = ServerConfig {
            credentials_path: dir.path().join("accounts.db"),
            blacklist_path: dir.path().join("blacklist.txt"),
            ..ServerConfig::default()
        };
        ServerContext::open(config).unwrap()
    }

    #[test]
    fn test_instance_ids_are_monotonic() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let a = ctx.next_instance_id();
        let b = ctx.next_instance_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_blacklist_persists() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        assert_eq!(ctx.blacklist_address(ip).await.unwrap(), 0);
        assert!(ctx.is_blacklisted(&ip));

        let reopened = test_context(&dir);
        assert!(reopened.is_blacklisted(&ip));
        assert!(reopened.unblacklist_address(ip).await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_sets_signal() {
        let dir = TempDir::new().unwrap();
        let ctx = test_context(&dir);
        let signal = ctx.shutdown_signal();

        ctx.shutdown().await;
        assert!(ctx.is_shutting_down());
        assert!(*signal.borrow());
    }
}
