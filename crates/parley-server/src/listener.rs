//! TCP accept loop and per-connection admission.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use parley_shared::commands::connection_denied;
use parley_shared::{InstanceId, ReasonCode};

use crate::context::ServerContext;
use crate::rooms::SessionHandle;
use crate::session::{CloseCause, Session};
use crate::transport::{finish_writer, spawn_writer, Outbound};

/// Back-off after a failed `accept`, so a persistent error (e.g. out of
/// file descriptors) does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Listener {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
}

impl Listener {
    pub async fn bind(ctx: Arc<ServerContext>) -> io::Result<Self> {
        let listener = TcpListener::bind(ctx.config.listen_addr()).await?;
        info!(addr = %listener.local_addr()?, "Chat listener bound");
        Ok(Self { ctx, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the context's shutdown signal fires.
    pub async fn run(self) {
        let mut shutdown = self.ctx.shutdown_signal();
        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %addr, error = %e, "Could not disable Nagle");
                        }
                        tokio::spawn(handle_connection(self.ctx.clone(), stream, addr));
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
        info!("Chat listener stopped");
    }
}

/// Admit one connection and run its session to the end.
///
/// Returns `None` if the connection was refused at admission (blacklisted,
/// server full or shutting down), otherwise how the session ended.
pub async fn handle_connection<S>(
    ctx: Arc<ServerContext>,
    stream: S,
    addr: SocketAddr,
) -> Option<CloseCause>
where
    S: AsyncRead + AsyncWrite + Send + Sync + 'static,
{
    let instance = ctx.next_instance_id();
    let (reader, writer) = tokio::io::split(stream);
    let (outbound, writer_task) = spawn_writer(writer, instance);

    let (close_tx, close_rx) = watch::channel(None);
    let handle = SessionHandle {
        instance_id: instance,
        addr,
        outbound: outbound.clone(),
        close: close_tx,
    };
    let admitted = ctx
        .registry
        .admit(handle, ctx.config.max_connections, |ip| ctx.is_blacklisted(ip))
        .await;
    if let Err(reason) = admitted {
        info!(peer = %addr, reason = %reason, "Connection refused at admission");
        refuse(&ctx, outbound, writer_task, instance, reason).await;
        return None;
    }

    ctx.record_accepted();
    info!(instance = %instance, peer = %addr, "Connection accepted");

    let session = Session::new(ctx, instance, addr, reader, outbound, close_rx);
    Some(session.run(writer_task).await)
}

async fn refuse(
    ctx: &ServerContext,
    outbound: Outbound,
    writer: JoinHandle<()>,
    instance: InstanceId,
    reason: ReasonCode,
) {
    ctx.record_rejected();
    let _ = outbound.send(connection_denied(reason).into());
    drop(outbound);
    finish_writer(writer, instance).await;
}

async fn shutdown_requested(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|stopping| *stopping).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::codec::read_entity;
    use parley_shared::{CommandCode, Entity};
    use tempfile::TempDir;
    use tokio::io::duplex;

    use crate::config::ServerConfig;

    fn context(dir: &TempDir, max_connections: usize) -> Arc<ServerContext> {
        let config = ServerConfig {
            max_connections,
            credentials_path: dir.path().join("accounts.db"),
            blacklist_path: dir.path().join("blacklist.txt"),
            ..ServerConfig::default()
        };
        Arc::new(ServerContext::open(config).unwrap())
    }

    fn peer(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 40000))
    }

    async fn expect_denied(client: &mut tokio::io::DuplexStream, reason: ReasonCode) {
        let Some(Entity::Command(cmd)) = read_entity(client).await.unwrap() else {
            panic!("expected a command");
        };
        assert_eq!(cmd.code, CommandCode::ConnectionDenied);
        assert_eq!(cmd.reason, Some(reason));
    }

    #[tokio::test]
    async fn test_blacklisted_peer_refused() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 0);
        ctx.blacklist_address(peer(7).ip()).await.unwrap();

        let (mut client, server) = duplex(64 * 1024);
        let outcome = handle_connection(ctx.clone(), server, peer(7)).await;

        assert!(outcome.is_none());
        expect_denied(&mut client, ReasonCode::Blacklisted).await;
        assert_eq!(ctx.stats().rejected, 1);
        assert_eq!(ctx.registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_capacity_counts_unauthenticated_sessions() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 1);

        // First connection sits in Authenticating and holds the only slot.
        let (_first_client, first_server) = duplex(64 * 1024);
        let first = tokio::spawn(handle_connection(ctx.clone(), first_server, peer(1)));
        while ctx.registry.session_count().await == 0 {
            tokio::task::yield_now().await;
        }

        let (mut client, server) = duplex(64 * 1024);
        let outcome = handle_connection(ctx.clone(), server, peer(2)).await;
        assert!(outcome.is_none());
        expect_denied(&mut client, ReasonCode::ServerFull).await;

        ctx.shutdown().await;
        let cause = first.await.unwrap();
        assert_eq!(
            cause,
            Some(CloseCause::Suspended(ReasonCode::ServerClosed))
        );
    }

    #[tokio::test]
    async fn test_refused_while_shutting_down() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, 0);
        ctx.shutdown().await;

        let (mut client, server) = duplex(64 * 1024);
        assert!(handle_connection(ctx, server, peer(3)).await.is_none());
        expect_denied(&mut client, ReasonCode::ServerClosed).await;
    }

    #[tokio::test]
    async fn test_listener_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            bind_addr: [127, 0, 0, 1].into(),
            port: 0,
            credentials_path: dir.path().join("accounts.db"),
            blacklist_path: dir.path().join("blacklist.txt"),
            ..ServerConfig::default()
        };
        let ctx = Arc::new(ServerContext::open(config).unwrap());
        let listener = Listener::bind(ctx.clone()).await.unwrap();
        let task = tokio::spawn(listener.run());

        ctx.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
