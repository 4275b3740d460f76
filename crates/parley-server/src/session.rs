//! Per-connection state machine.
//!
//! A session walks `Connecting → Authenticating → Verified → Active →
//! Closing → Closed`. It reads entities off its half of the stream, while
//! everything it sends (and everything other sessions send to it) goes
//! through the outbound queue drained by the writer task.
//!
//! Closing always funnels through [`Session::close`], whether the cause is
//! local (protocol fault, lost connection, client quit) or external (kick,
//! blacklist, shutdown delivered through the close signal).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use parley_shared::codec::read_entity;
use parley_shared::commands::{connection_denied, connection_suspended, ConnectionGrant, ConnectionRequest};
use parley_shared::{
    Command, CommandCode, Entity, EntityHeader, InstanceId, Message, ProtocolError, ReasonCode,
    TransferChunk, TransferId, UserId,
};

use crate::auth::{authenticate, AuthOutcome};
use crate::context::ServerContext;
use crate::transport::{finish_writer, Outbound};

/// Announced transfers a session may keep open at once. Announcing one
/// more forgets the oldest.
pub const MAX_OPEN_TRANSFERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Verified,
    Active,
    Closing,
    Closed,
}

/// Why a session is ending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The client sent `CONNECTION_SUSPENDED` itself.
    ClientQuit,
    /// EOF or an I/O error on the stream.
    Lost(String),
    /// A `CONNECTION_DENIED` carrying the reason was already sent.
    Denied(ReasonCode),
    /// The server ends the session and tells the client why.
    Suspended(ReasonCode),
}

impl CloseCause {
    fn violation() -> Self {
        Self::Suspended(ReasonCode::ProtocolViolation)
    }

    /// Reason code used when logging the close.
    pub fn reason(&self) -> ReasonCode {
        match self {
            Self::ClientQuit | Self::Lost(_) => ReasonCode::ConnectionLost,
            Self::Denied(reason) | Self::Suspended(reason) => *reason,
        }
    }
}

struct Identity {
    username: String,
    user_id: UserId,
}

pub struct Session<R> {
    ctx: Arc<ServerContext>,
    instance: InstanceId,
    addr: SocketAddr,
    reader: R,
    outbound: Outbound,
    close_rx: watch::Receiver<Option<ReasonCode>>,
    state: SessionState,
    /// Bytes still expected for each open transfer this session announced,
    /// oldest first.
    transfers: VecDeque<(TransferId, u64)>,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin + Send + Sync,
{
    pub fn new(
        ctx: Arc<ServerContext>,
        instance: InstanceId,
        addr: SocketAddr,
        reader: R,
        outbound: Outbound,
        close_rx: watch::Receiver<Option<ReasonCode>>,
    ) -> Self {
        Self {
            ctx,
            instance,
            addr,
            reader,
            outbound,
            close_rx,
            state: SessionState::Connecting,
            transfers: VecDeque::new(),
        }
    }

    /// Drive the session to completion. The session must already be
    /// admitted into the registry; `writer` is the task draining its
    /// outbound queue.
    pub async fn run(mut self, writer: JoinHandle<()>) -> CloseCause {
        let cause = match self.authenticate().await {
            Ok(identity) => match self.activate(&identity).await {
                Ok(()) => self.active_loop(&identity).await,
                Err(cause) => cause,
            },
            Err(cause) => cause,
        };
        self.close(cause, writer).await
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            instance = %self.instance,
            from = ?self.state,
            to = ?next,
            "Session state change"
        );
        self.state = next;
    }

    fn send(&self, entity: Entity) {
        if self.outbound.send(entity).is_err() {
            debug!(instance = %self.instance, "Outbound queue closed");
        }
    }

    /// Next entity from the client, or the cause that ends the session.
    async fn next_entity(&mut self) -> Result<Entity, CloseCause> {
        let (instance, addr) = (self.instance, self.addr);
        tokio::select! {
            biased;

            reason = close_requested(&mut self.close_rx) => {
                Err(CloseCause::Suspended(reason))
            }

            read = read_entity(&mut self.reader) => match read {
                Ok(Some(entity)) => Ok(entity),
                Ok(None) => Err(CloseCause::Lost("peer closed the connection".into())),
                Err(e) if e.is_io() => Err(CloseCause::Lost(e.to_string())),
                Err(e) => {
                    warn!(instance = %instance, peer = %addr, error = %e, "Undecodable entity");
                    Err(CloseCause::violation())
                }
            },
        }
    }

    async fn authenticate(&mut self) -> Result<Identity, CloseCause> {
        self.transition(SessionState::Authenticating);
        let deadline = Instant::now() + self.ctx.config.login_timeout;

        loop {
            let entity = match timeout_at(deadline, self.next_entity()).await {
                Ok(next) => next?,
                Err(_) => {
                    info!(instance = %self.instance, peer = %self.addr, "Login timed out");
                    return Err(CloseCause::Suspended(ReasonCode::LoginTimeout));
                }
            };

            let cmd = match entity {
                Entity::Command(cmd) => cmd,
                other => {
                    warn!(instance = %self.instance, kind = ?other.kind(), "Entity before authentication");
                    return Err(CloseCause::violation());
                }
            };
            match cmd.code {
                CommandCode::ConnectionRequest => {}
                CommandCode::ConnectionSuspended => return Err(CloseCause::ClientQuit),
                code => {
                    warn!(instance = %self.instance, code = %code, "Command before authentication");
                    return Err(CloseCause::violation());
                }
            }

            let request = ConnectionRequest::from_command(&cmd).map_err(|e| self.malformed(e))?;
            match authenticate(&self.ctx.credentials, request).await {
                AuthOutcome::Authenticated { username } => {
                    return Ok(Identity {
                        username,
                        user_id: UserId::generate(),
                    });
                }
                AuthOutcome::Denied { reason } => {
                    info!(instance = %self.instance, reason = %reason, "Connection request denied");
                    self.send(connection_denied(reason).into());
                    if reason == ReasonCode::IncompatibleClient {
                        return Err(CloseCause::Denied(reason));
                    }
                }
            }
        }
    }

    /// Issue the identity, then announce the newcomer.
    async fn activate(&mut self, identity: &Identity) -> Result<(), CloseCause> {
        let ctx = self.ctx.clone();
        let registry = &ctx.registry;
        if !registry
            .mark_verified(self.instance, &identity.username, identity.user_id)
            .await
        {
            return Err(CloseCause::Lost("session vanished from registry".into()));
        }
        self.transition(SessionState::Verified);

        self.send(
            ConnectionGrant {
                username: identity.username.clone(),
                user_id: identity.user_id,
                instance_id: self.instance,
            }
            .into_command()
            .into(),
        );
        info!(
            instance = %self.instance,
            peer = %self.addr,
            username = %identity.username,
            user = %identity.user_id.short(),
            "Session authorized"
        );

        let announcement = Message::new(
            EntityHeader::server(),
            format!("{} connected", identity.username),
        );
        registry
            .broadcast_from(self.instance, &Entity::from(announcement))
            .await;
        registry.broadcast_snapshot().await;

        self.transition(SessionState::Active);
        Ok(())
    }

    async fn active_loop(&mut self, identity: &Identity) -> CloseCause {
        loop {
            let entity = match self.next_entity().await {
                Ok(entity) => entity,
                Err(cause) => return cause,
            };

            if *entity.sender_id() != identity.user_id {
                return self.tampered(&entity).await;
            }

            let routed = match entity {
                Entity::Message(_) => {
                    self.ctx.registry.broadcast_from(self.instance, &entity).await;
                    Ok(())
                }
                Entity::TransferChunk(chunk) => {
                    self.relay_chunk(chunk).await;
                    Ok(())
                }
                Entity::Command(cmd) => self.dispatch(cmd).await,
            };
            if let Err(cause) = routed {
                return cause;
            }
        }
    }

    async fn tampered(&self, entity: &Entity) -> CloseCause {
        warn!(
            instance = %self.instance,
            peer = %self.addr,
            claimed = %entity.sender_id().short(),
            "Sender ID does not match the issued identity"
        );
        if self.ctx.config.blacklist_on_tamper {
            if let Err(e) = self.ctx.blacklist_address(self.addr.ip()).await {
                warn!(peer = %self.addr, error = %e, "Failed to blacklist tampering peer");
            }
        }
        CloseCause::Suspended(ReasonCode::InconsistentUserId)
    }

    async fn dispatch(&mut self, cmd: Command) -> Result<(), CloseCause> {
        let ctx = self.ctx.clone();
        let registry = &ctx.registry;

        if let Some(availability) = cmd.code.availability() {
            registry.set_availability(self.instance, availability).await;
            registry.broadcast_snapshot().await;
            return Ok(());
        }

        match cmd.code {
            CommandCode::PrivateChatroomRequest => {
                let target = InstanceId(cmd.int(0).map_err(|e| self.malformed(e))?);
                if !registry.request_private(self.instance, target).await {
                    debug!(instance = %self.instance, target = %target, "Private chatroom request refused");
                    registry.refuse_private(self.instance, target).await;
                }
            }
            CommandCode::PrivateChatroomAuthorized => {
                let requester = InstanceId(cmd.int(0).map_err(|e| self.malformed(e))?);
                if registry.accept_private(requester, self.instance).await.is_some() {
                    registry.broadcast_snapshot().await;
                }
            }
            CommandCode::PrivateChatroomDenied => {
                let requester = InstanceId(cmd.int(0).map_err(|e| self.malformed(e))?);
                registry.deny_private(requester, self.instance).await;
            }
            CommandCode::PrivateChatroomExit => {
                if registry.exit_private(self.instance).await.is_none() {
                    debug!(instance = %self.instance, "Exit requested outside a private room");
                }
            }
            CommandCode::FileTransfer => self.announce_transfer(cmd).await?,
            CommandCode::ConnectionSuspended => return Err(CloseCause::ClientQuit),
            code => {
                warn!(instance = %self.instance, code = %code, "Unexpected command from client");
                return Err(CloseCause::violation());
            }
        }
        Ok(())
    }

    async fn announce_transfer(&mut self, cmd: Command) -> Result<(), CloseCause> {
        let manifest = cmd.manifest(0).map_err(|e| self.malformed(e))?;
        let id = manifest.transfer_id;

        if manifest.total_bytes > self.ctx.config.max_transfer_bytes {
            warn!(
                instance = %self.instance,
                transfer = %id,
                size = manifest.total_bytes,
                max = self.ctx.config.max_transfer_bytes,
                "Transfer too large, not relayed"
            );
            return Ok(());
        }
        if self.transfers.iter().any(|(open, _)| *open == id) {
            warn!(instance = %self.instance, transfer = %id, "Duplicate transfer manifest dropped");
            return Ok(());
        }

        info!(
            instance = %self.instance,
            transfer = %id,
            file = %manifest.filename,
            size = manifest.total_bytes,
            "File transfer announced"
        );
        if manifest.total_bytes > 0 {
            if self.transfers.len() >= MAX_OPEN_TRANSFERS {
                if let Some((stale, _)) = self.transfers.pop_front() {
                    debug!(instance = %self.instance, transfer = %stale, "Oldest open transfer forgotten");
                }
            }
            self.transfers.push_back((id, manifest.total_bytes));
        }
        self.ctx.registry.broadcast_global(&Entity::from(cmd)).await;
        self.ctx.record_transfer();
        Ok(())
    }

    async fn relay_chunk(&mut self, chunk: TransferChunk) {
        let len = chunk.data.len();
        let id = chunk.transfer_id;
        let Some(slot) = self.transfers.iter().position(|(open, _)| *open == id) else {
            warn!(instance = %self.instance, transfer = %id, "Chunk for unannounced transfer dropped");
            return;
        };
        let remaining = &mut self.transfers[slot].1;
        if len > self.ctx.config.max_chunk_size || len as u64 > *remaining {
            warn!(
                instance = %self.instance,
                transfer = %id,
                len,
                remaining = *remaining,
                "Chunk exceeds transfer limits, dropped"
            );
            return;
        }

        *remaining -= len as u64;
        if *remaining == 0 {
            self.transfers.remove(slot);
            debug!(instance = %self.instance, transfer = %id, "Transfer fully relayed");
        }
        self.ctx
            .registry
            .broadcast_from(self.instance, &Entity::from(chunk))
            .await;
    }

    fn malformed(&self, error: ProtocolError) -> CloseCause {
        warn!(instance = %self.instance, error = %error, "Malformed command");
        CloseCause::violation()
    }

    async fn close(mut self, cause: CloseCause, writer: JoinHandle<()>) -> CloseCause {
        self.transition(SessionState::Closing);

        if let CloseCause::Suspended(reason) = &cause {
            self.send(connection_suspended(*reason).into());
        }

        let ctx = self.ctx.clone();
        let registry = &ctx.registry;
        if let Some(departure) = registry.leave(self.instance).await {
            if departure.was_verified {
                let farewell = Message::new(
                    EntityHeader::server(),
                    format!("{} disconnected", departure.username),
                );
                registry.broadcast(&Entity::from(farewell), departure.room).await;
                registry.broadcast_snapshot().await;
            }
        }

        match &cause {
            CloseCause::Lost(detail) => {
                info!(instance = %self.instance, peer = %self.addr, detail = %detail, "Connection lost")
            }
            other => {
                info!(instance = %self.instance, peer = %self.addr, reason = %other.reason(), "Session closed")
            }
        }

        // The writer stops once the last sender is gone; ours goes here.
        let Self {
            instance, outbound, ..
        } = self;
        drop(outbound);
        finish_writer(writer, instance).await;

        debug!(instance = %instance, to = ?SessionState::Closed, "Session state change");
        cause
    }
}

/// Resolves once an external close has been requested.
async fn close_requested(close: &mut watch::Receiver<Option<ReasonCode>>) -> ReasonCode {
    let requested = close.wait_for(Option::is_some).await.ok().and_then(|r| *r);
    match requested {
        Some(reason) => reason,
        // Sender gone without a reason: leave it to the stream to end us.
        None => std::future::pending().await,
    }
}
