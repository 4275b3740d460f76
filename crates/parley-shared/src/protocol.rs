//! Wire entities exchanged between clients and the relay.
//!
//! Every unit on the wire is an [`Entity`]: a [`Message`], a [`Command`] or a
//! [`TransferChunk`]. The encoded body starts with an [`EntityKind`]
//! discriminator so a receiver can dispatch without knowing what to expect
//! next; the kind-specific struct follows, bincode-encoded.
//!
//! Command and reason codes carry fixed integer identifiers. They are the
//! only part of the format that other implementations must match exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::SERVER_SENDER_NAME;
use crate::error::ProtocolError;
use crate::types::{Availability, TransferId, UserId, UserSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntityKind {
    Message = 0x01,
    Command = 0x02,
    TransferChunk = 0x03,
}

impl EntityKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Message),
            0x02 => Some(Self::Command),
            0x03 => Some(Self::TransferChunk),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Command => "command",
            Self::TransferChunk => "transfer chunk",
        }
    }
}

// ---------------------------------------------------------------------------
// Code tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum CommandCode {
    ConnectionRequest = 1,
    ConnectionAuthorized = 2,
    ConnectionDenied = 3,
    ConnectedUsers = 4,
    ClientAvailabilityAvailable = 5,
    ClientAvailabilityBusy = 6,
    ClientAvailabilityAway = 7,
    ClientAvailabilityAppearOffline = 8,
    PrivateChatroomRequest = 9,
    PrivateChatroomAuthorized = 10,
    PrivateChatroomDenied = 11,
    PrivateChatroomExit = 12,
    FileTransfer = 13,
    ConnectionSuspended = 14,
}

impl CommandCode {
    pub fn name(self) -> &'static str {
        match self {
            Self::ConnectionRequest => "CONNECTION_REQUEST",
            Self::ConnectionAuthorized => "CONNECTION_AUTHORIZED",
            Self::ConnectionDenied => "CONNECTION_DENIED",
            Self::ConnectedUsers => "CONNECTED_USERS",
            Self::ClientAvailabilityAvailable => "CLIENT_AVAILABILITY_AVAILABLE",
            Self::ClientAvailabilityBusy => "CLIENT_AVAILABILITY_BUSY",
            Self::ClientAvailabilityAway => "CLIENT_AVAILABILITY_AWAY",
            Self::ClientAvailabilityAppearOffline => "CLIENT_AVAILABILITY_APPEAR_OFFLINE",
            Self::PrivateChatroomRequest => "PRIVATE_CHATROOM_REQUEST",
            Self::PrivateChatroomAuthorized => "PRIVATE_CHATROOM_AUTHORIZED",
            Self::PrivateChatroomDenied => "PRIVATE_CHATROOM_DENIED",
            Self::PrivateChatroomExit => "PRIVATE_CHATROOM_EXIT",
            Self::FileTransfer => "FILE_TRANSFER",
            Self::ConnectionSuspended => "CONNECTION_SUSPENDED",
        }
    }

    /// Availability requested by a `CLIENT_AVAILABILITY_*` code.
    pub fn availability(self) -> Option<Availability> {
        match self {
            Self::ClientAvailabilityAvailable => Some(Availability::Available),
            Self::ClientAvailabilityBusy => Some(Availability::Busy),
            Self::ClientAvailabilityAway => Some(Availability::Away),
            Self::ClientAvailabilityAppearOffline => Some(Availability::AppearOffline),
            _ => None,
        }
    }

    /// Inverse of [`CommandCode::availability`]. `Offline` is server-side only.
    pub fn for_availability(availability: Availability) -> Option<Self> {
        match availability {
            Availability::Available => Some(Self::ClientAvailabilityAvailable),
            Availability::Busy => Some(Self::ClientAvailabilityBusy),
            Availability::Away => Some(Self::ClientAvailabilityAway),
            Availability::AppearOffline => Some(Self::ClientAvailabilityAppearOffline),
            Availability::Offline => None,
        }
    }

    /// Codes only the server may originate.
    pub fn is_server_only(self) -> bool {
        matches!(
            self,
            Self::ConnectionAuthorized | Self::ConnectionDenied | Self::ConnectedUsers
        )
    }
}

impl From<CommandCode> for u16 {
    fn from(code: CommandCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for CommandCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let code = match value {
            1 => Self::ConnectionRequest,
            2 => Self::ConnectionAuthorized,
            3 => Self::ConnectionDenied,
            4 => Self::ConnectedUsers,
            5 => Self::ClientAvailabilityAvailable,
            6 => Self::ClientAvailabilityBusy,
            7 => Self::ClientAvailabilityAway,
            8 => Self::ClientAvailabilityAppearOffline,
            9 => Self::PrivateChatroomRequest,
            10 => Self::PrivateChatroomAuthorized,
            11 => Self::PrivateChatroomDenied,
            12 => Self::PrivateChatroomExit,
            13 => Self::FileTransfer,
            14 => Self::ConnectionSuspended,
            other => return Err(ProtocolError::UnknownCommand(other)),
        };
        Ok(code)
    }
}

impl std::fmt::Display for CommandCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ReasonCode {
    Kicked = 1,
    Blacklisted = 2,
    ServerFull = 3,
    ServerClosed = 4,
    RoomClosed = 5,
    InconsistentUserId = 6,
    IncompatibleClient = 7,
    IncorrectCredentials = 8,
    UsernameEmailAlreadyExists = 9,
    ProtocolViolation = 10,
    ConnectionLost = 11,
    LoginTimeout = 12,
}

impl ReasonCode {
    pub fn name(self) -> &'static str {
        match self {
            Self::Kicked => "KICKED",
            Self::Blacklisted => "BLACKLISTED",
            Self::ServerFull => "SERVER_FULL",
            Self::ServerClosed => "SERVER_CLOSED",
            Self::RoomClosed => "ROOM_CLOSED",
            Self::InconsistentUserId => "INCONSISTENT_USER_ID",
            Self::IncompatibleClient => "INCOMPATIBLE_CLIENT",
            Self::IncorrectCredentials => "INCORRECT_CREDENTIALS",
            Self::UsernameEmailAlreadyExists => "USERNAME_EMAIL_ALREADY_EXISTS",
            Self::ProtocolViolation => "PROTOCOL_VIOLATION",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::LoginTimeout => "LOGIN_TIMEOUT",
        }
    }
}

impl From<ReasonCode> for u16 {
    fn from(code: ReasonCode) -> u16 {
        code as u16
    }
}

impl TryFrom<u16> for ReasonCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let code = match value {
            1 => Self::Kicked,
            2 => Self::Blacklisted,
            3 => Self::ServerFull,
            4 => Self::ServerClosed,
            5 => Self::RoomClosed,
            6 => Self::InconsistentUserId,
            7 => Self::IncompatibleClient,
            8 => Self::IncorrectCredentials,
            9 => Self::UsernameEmailAlreadyExists,
            10 => Self::ProtocolViolation,
            11 => Self::ConnectionLost,
            12 => Self::LoginTimeout,
            other => return Err(ProtocolError::UnknownReason(other)),
        };
        Ok(code)
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

/// Fields shared by every entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityHeader {
    pub sender_name: String,
    pub sender_id: UserId,
    pub timestamp: DateTime<Utc>,
}

impl EntityHeader {
    pub fn new(sender_name: impl Into<String>, sender_id: UserId) -> Self {
        Self {
            sender_name: sender_name.into(),
            sender_id,
            timestamp: Utc::now(),
        }
    }

    pub fn server() -> Self {
        Self::new(SERVER_SENDER_NAME, UserId::UNASSIGNED)
    }
}

/// A chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    header: EntityHeader,
    body: String,
}

impl Message {
    pub fn new(header: EntityHeader, body: impl Into<String>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    pub fn header(&self) -> &EntityHeader {
        &self.header
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// Announces a file before its first chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferManifest {
    pub transfer_id: TransferId,
    pub total_bytes: u64,
    pub chunk_size_hint: u32,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandArg {
    Text(String),
    Bool(bool),
    Int(u64),
    Users(Vec<UserSummary>),
    Manifest(TransferManifest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub header: EntityHeader,
    pub code: CommandCode,
    pub args: Vec<CommandArg>,
    pub reason: Option<ReasonCode>,
}

impl Command {
    pub fn new(header: EntityHeader, code: CommandCode) -> Self {
        Self {
            header,
            code,
            args: Vec::new(),
            reason: None,
        }
    }

    pub fn with_arg(mut self, arg: CommandArg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_reason(mut self, reason: ReasonCode) -> Self {
        self.reason = Some(reason);
        self
    }

    fn arg(&self, index: usize) -> Result<&CommandArg, ProtocolError> {
        self.args.get(index).ok_or(ProtocolError::BadArgument {
            code: self.code.name(),
            index,
        })
    }

    fn mistyped(&self, index: usize) -> ProtocolError {
        ProtocolError::BadArgument {
            code: self.code.name(),
            index,
        }
    }

    pub fn text(&self, index: usize) -> Result<&str, ProtocolError> {
        match self.arg(index)? {
            CommandArg::Text(s) => Ok(s),
            _ => Err(self.mistyped(index)),
        }
    }

    pub fn flag(&self, index: usize) -> Result<bool, ProtocolError> {
        match self.arg(index)? {
            CommandArg::Bool(b) => Ok(*b),
            _ => Err(self.mistyped(index)),
        }
    }

    pub fn int(&self, index: usize) -> Result<u64, ProtocolError> {
        match self.arg(index)? {
            CommandArg::Int(n) => Ok(*n),
            _ => Err(self.mistyped(index)),
        }
    }

    pub fn users(&self, index: usize) -> Result<&[UserSummary], ProtocolError> {
        match self.arg(index)? {
            CommandArg::Users(users) => Ok(users),
            _ => Err(self.mistyped(index)),
        }
    }

    pub fn manifest(&self, index: usize) -> Result<&TransferManifest, ProtocolError> {
        match self.arg(index)? {
            CommandArg::Manifest(m) => Ok(m),
            _ => Err(self.mistyped(index)),
        }
    }
}

/// Raw slice of a file in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferChunk {
    pub header: EntityHeader,
    pub transfer_id: TransferId,
    pub filename: String,
    pub data: Vec<u8>,
}

/// One unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Message(Message),
    Command(Command),
    TransferChunk(TransferChunk),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Message(_) => EntityKind::Message,
            Self::Command(_) => EntityKind::Command,
            Self::TransferChunk(_) => EntityKind::TransferChunk,
        }
    }

    pub fn header(&self) -> &EntityHeader {
        match self {
            Self::Message(m) => m.header(),
            Self::Command(c) => &c.header,
            Self::TransferChunk(t) => &t.header,
        }
    }

    pub fn sender_id(&self) -> &UserId {
        &self.header().sender_id
    }

    /// Serialize to a kind-prefixed body (without the length prefix).
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = match self {
            Self::Message(m) => bincode::serialize(m),
            Self::Command(c) => bincode::serialize(c),
            Self::TransferChunk(t) => bincode::serialize(t),
        }
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;

        let mut out = Vec::with_capacity(1 + body.len());
        out.push(self.kind() as u8);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Inverse of [`Entity::encode`].
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&kind_byte, body) = data.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let kind = EntityKind::from_byte(kind_byte).ok_or(ProtocolError::UnknownKind(kind_byte))?;
        let body_err = |source| ProtocolError::Body {
            kind: kind.label(),
            source,
        };

        let entity = match kind {
            EntityKind::Message => Self::Message(bincode::deserialize(body).map_err(body_err)?),
            EntityKind::Command => Self::Command(bincode::deserialize(body).map_err(body_err)?),
            EntityKind::TransferChunk => {
                Self::TransferChunk(bincode::deserialize(body).map_err(body_err)?)
            }
        };
        Ok(entity)
    }
}

impl From<Message> for Entity {
    fn from(m: Message) -> Self {
        Self::Message(m)
    }
}

impl From<Command> for Entity {
    fn from(c: Command) -> Self {
        Self::Command(c)
    }
}

impl From<TransferChunk> for Entity {
    fn from(t: TransferChunk) -> Self {
        Self::TransferChunk(t)
    }
}
