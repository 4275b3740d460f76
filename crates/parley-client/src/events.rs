use std::path::PathBuf;

use parley_shared::{Command, Message, ReasonCode, TransferManifest, UserSummary};

use crate::error::TransferError;

/// Everything the connection reports to the presentation layer.
#[derive(Debug)]
pub enum ClientEvent {
    /// Fresh `CONNECTED_USERS` snapshot.
    PresenceChanged(Vec<UserSummary>),
    MessageReceived(Message),
    FileReceived {
        manifest: TransferManifest,
        path: PathBuf,
    },
    TransferFailed {
        manifest: TransferManifest,
        error: TransferError,
    },
    /// Any other command, e.g. private-chatroom traffic.
    CommandReceived(Command),
    /// The connection is gone. `reason` is set when the server said why.
    Disconnected { reason: Option<ReasonCode> },
}
