//! # parley-shared
//!
//! Wire protocol and primitives shared by the Parley relay and its clients:
//! entity types, stable command/reason codes, stream framing, identifiers and
//! the salted password hash.

pub mod codec;
pub mod commands;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::{
    Command, CommandArg, CommandCode, Entity, EntityHeader, EntityKind, Message, ReasonCode,
    TransferChunk, TransferManifest,
};
pub use types::{Availability, InstanceId, TransferId, UserId, UserSummary};
