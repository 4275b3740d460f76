//! Client side of a relay connection.
//!
//! [`Client::connect`] performs the `CONNECTION_REQUEST` handshake. On
//! success it spawns a writer task draining the outgoing queue and a reader
//! task that turns incoming entities into [`ClientEvent`]s. Incoming file
//! transfers are reassembled on a dedicated executor; chunks the relay
//! echoes back from our own transfers are ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_shared::codec::{read_entity, write_entity};
use parley_shared::commands::{private_chatroom, ConnectionGrant, ConnectionRequest, Credentials};
use parley_shared::{
    Availability, Command, CommandArg, CommandCode, Entity, EntityHeader, InstanceId, Message,
    ReasonCode, TransferChunk, TransferId, TransferManifest, UserId,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::transfer::{NoopObserver, TransferExecutor, TransferObserver};

/// How long `disconnect` waits for queued entities to be flushed.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Result of the connection handshake.
pub enum AuthOutcome {
    Authenticated {
        client: Client,
        events: mpsc::Receiver<ClientEvent>,
    },
    Denied {
        reason: ReasonCode,
    },
}

impl std::fmt::Debug for AuthOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Authenticated { client, .. } => f
                .debug_struct("Authenticated")
                .field("username", &client.grant.username)
                .field("instance_id", &client.grant.instance_id)
                .finish_non_exhaustive(),
            Self::Denied { reason } => f.debug_struct("Denied").field("reason", reason).finish(),
        }
    }
}

pub struct Client {
    grant: ConnectionGrant,
    config: ClientConfig,
    outbound: mpsc::Sender<Entity>,
    sender: TransferExecutor,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Client {
    pub async fn connect(
        addr: impl ToSocketAddrs,
        credentials: Credentials,
        config: ClientConfig,
    ) -> Result<AuthOutcome> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream, credentials, config).await
    }

    /// Run the handshake over an already established stream.
    pub async fn handshake<S>(
        stream: S,
        credentials: Credentials,
        config: ClientConfig,
    ) -> Result<AuthOutcome>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let request = ConnectionRequest::new(credentials).into_command();
        write_entity(&mut writer, &Entity::from(request)).await?;

        let reply = tokio::time::timeout(config.handshake_timeout, await_grant(&mut reader))
            .await
            .map_err(|_| ClientError::HandshakeTimeout)??;

        let grant = match reply {
            Ok(grant) => grant,
            Err(reason) => {
                info!(reason = %reason, "Connection denied");
                return Ok(AuthOutcome::Denied { reason });
            }
        };
        info!(
            username = %grant.username,
            instance = %grant.instance_id,
            "Connected"
        );

        let (outbound, outbound_rx) = mpsc::channel(config.outbound_buffer.max(1));
        let (events_tx, events) = mpsc::channel(config.event_buffer.max(1));

        let writer = tokio::spawn(write_loop(writer, outbound_rx));
        let inbound = Inbound {
            own_id: grant.user_id,
            events: events_tx,
            receiver: TransferExecutor::new(config.max_transfer_bytes),
            download_dir: config.download_dir.clone(),
            active: None,
        };
        let reader = tokio::spawn(inbound.run(reader));

        let client = Client {
            sender: TransferExecutor::new(config.max_transfer_bytes),
            grant,
            config,
            outbound,
            writer,
            reader,
        };
        Ok(AuthOutcome::Authenticated { client, events })
    }

    pub fn username(&self) -> &str {
        &self.grant.username
    }

    pub fn user_id(&self) -> UserId {
        self.grant.user_id
    }

    pub fn instance_id(&self) -> InstanceId {
        self.grant.instance_id
    }

    /// Header for an entity sent now under our issued identity.
    pub fn header(&self) -> EntityHeader {
        EntityHeader::new(self.grant.username.clone(), self.grant.user_id)
    }

    async fn send(&self, entity: Entity) -> Result<()> {
        self.outbound
            .send(entity)
            .await
            .map_err(|_| ClientError::Disconnected)
    }

    pub async fn send_message(&self, body: impl Into<String>) -> Result<()> {
        self.send(Message::new(self.header(), body).into()).await
    }

    pub async fn send_command(&self, code: CommandCode, args: Vec<CommandArg>) -> Result<()> {
        let cmd = args
            .into_iter()
            .fold(Command::new(self.header(), code), Command::with_arg);
        self.send(cmd.into()).await
    }

    pub async fn set_availability(&self, availability: Availability) -> Result<()> {
        let code = CommandCode::for_availability(availability)
            .ok_or(ClientError::InvalidAvailability(availability))?;
        self.send(Command::new(self.header(), code).into()).await
    }

    pub async fn request_private_room(&self, target: InstanceId) -> Result<()> {
        let cmd = private_chatroom(self.header(), CommandCode::PrivateChatroomRequest, target);
        self.send(cmd.into()).await
    }

    /// Accept or turn down a private chatroom request from `requester`.
    pub async fn answer_private_room(&self, requester: InstanceId, accept: bool) -> Result<()> {
        let code = if accept {
            CommandCode::PrivateChatroomAuthorized
        } else {
            CommandCode::PrivateChatroomDenied
        };
        self.send(private_chatroom(self.header(), code, requester).into())
            .await
    }

    pub async fn exit_private_room(&self) -> Result<()> {
        self.send(Command::new(self.header(), CommandCode::PrivateChatroomExit).into())
            .await
    }

    pub async fn send_file(&self, path: &Path) -> Result<TransferManifest> {
        self.send_file_with(path, &NoopObserver).await
    }

    pub async fn send_file_with(
        &self,
        path: &Path,
        observer: &dyn TransferObserver,
    ) -> Result<TransferManifest> {
        let manifest = self
            .sender
            .send_file(path, self.config.chunk_size, &self.header(), &self.outbound, observer)
            .await?;
        Ok(manifest)
    }

    /// Say goodbye and tear the connection down.
    pub async fn disconnect(self) {
        let quit = Command::new(self.header(), CommandCode::ConnectionSuspended);
        let _ = self.outbound.send(quit.into()).await;
        drop(self.outbound);

        let writer_abort = self.writer.abort_handle();
        if tokio::time::timeout(DISCONNECT_GRACE, self.writer).await.is_err() {
            writer_abort.abort();
        }
        let reader_abort = self.reader.abort_handle();
        if tokio::time::timeout(DISCONNECT_GRACE, self.reader).await.is_err() {
            reader_abort.abort();
        }
        info!(username = %self.grant.username, "Disconnected");
    }
}

/// Wait for the server's verdict on our connection request.
async fn await_grant<R>(reader: &mut R) -> Result<std::result::Result<ConnectionGrant, ReasonCode>>
where
    R: AsyncRead + Unpin,
{
    loop {
        let Some(entity) = read_entity(reader).await? else {
            return Err(ClientError::Disconnected);
        };
        let Entity::Command(cmd) = entity else {
            debug!("Ignoring entity received before authorization");
            continue;
        };
        match cmd.code {
            CommandCode::ConnectionAuthorized => {
                return Ok(Ok(ConnectionGrant::from_command(&cmd)?));
            }
            CommandCode::ConnectionDenied | CommandCode::ConnectionSuspended => {
                return Ok(Err(cmd.reason.unwrap_or(ReasonCode::ConnectionLost)));
            }
            code => debug!(code = %code, "Ignoring command received before authorization"),
        }
    }
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::Receiver<Entity>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(entity) = outbound.recv().await {
        if let Err(e) = write_entity(&mut writer, &entity).await {
            warn!(error = %e, "Write failed, closing connection");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

struct Inbound {
    own_id: UserId,
    events: mpsc::Sender<ClientEvent>,
    receiver: TransferExecutor,
    download_dir: PathBuf,
    /// Chunk route of the transfer currently being received.
    active: Option<(TransferId, mpsc::UnboundedSender<TransferChunk>)>,
}

impl Inbound {
    async fn run<R>(mut self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let reason = loop {
            match read_entity(&mut reader).await {
                Ok(Some(entity)) => {
                    if let Some(reason) = self.route(entity).await {
                        break Some(reason);
                    }
                }
                Ok(None) => break None,
                Err(e) => {
                    warn!(error = %e, "Connection failed");
                    break None;
                }
            }
        };
        let _ = self.events.send(ClientEvent::Disconnected { reason }).await;
    }

    /// Returns the reason once the server has suspended the connection.
    async fn route(&mut self, entity: Entity) -> Option<ReasonCode> {
        match entity {
            Entity::Message(message) => self.emit(ClientEvent::MessageReceived(message)).await,
            Entity::TransferChunk(chunk) => self.route_chunk(chunk),
            Entity::Command(cmd) => match cmd.code {
                CommandCode::ConnectedUsers => match cmd.users(0) {
                    Ok(users) => self.emit(ClientEvent::PresenceChanged(users.to_vec())).await,
                    Err(e) => warn!(error = %e, "Malformed user list"),
                },
                CommandCode::FileTransfer => self.start_transfer(cmd).await,
                CommandCode::ConnectionSuspended => {
                    return Some(cmd.reason.unwrap_or(ReasonCode::ConnectionLost));
                }
                _ => self.emit(ClientEvent::CommandReceived(cmd)).await,
            },
        }
        None
    }

    async fn emit(&self, event: ClientEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Event receiver dropped");
        }
    }

    fn route_chunk(&mut self, chunk: TransferChunk) {
        if chunk.header.sender_id == self.own_id {
            return;
        }
        match &self.active {
            Some((id, route)) if *id == chunk.transfer_id => {
                if route.send(chunk).is_err() {
                    self.active = None;
                }
            }
            _ => debug!(transfer = %chunk.transfer_id, "Chunk for no active transfer"),
        }
    }

    async fn start_transfer(&mut self, cmd: Command) {
        if cmd.header.sender_id == self.own_id {
            return;
        }
        let manifest = match cmd.manifest(0) {
            Ok(manifest) => manifest.clone(),
            Err(e) => {
                warn!(error = %e, "Malformed transfer manifest");
                return;
            }
        };

        let slot = match self.receiver.begin() {
            Ok(slot) => slot,
            Err(error) => {
                warn!(transfer = %manifest.transfer_id, "Receiver busy, transfer refused");
                self.emit(ClientEvent::TransferFailed { manifest, error }).await;
                return;
            }
        };

        let (route, mut chunks) = mpsc::unbounded_channel();
        self.active = Some((manifest.transfer_id, route));

        let events = self.events.clone();
        let dir = self.download_dir.clone();
        tokio::spawn(async move {
            let event = match slot
                .receive(&manifest, &mut chunks, &dir, &NoopObserver)
                .await
            {
                Ok(path) => ClientEvent::FileReceived { manifest, path },
                Err(error) => ClientEvent::TransferFailed { manifest, error },
            };
            let _ = events.send(event).await;
        });
    }
}
