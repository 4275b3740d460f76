use thiserror::Error;

use parley_shared::{Availability, ProtocolError};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Another transfer is already active on this executor")]
    ConcurrentTransfer,

    #[error("No chunk received for {idle_secs} seconds")]
    TransferTimedOut { idle_secs: u64 },

    #[error("Chunk stream ended before the transfer completed")]
    Interrupted,

    #[error("Received more than the {expected} bytes announced")]
    Overflow { expected: u64 },

    #[error("File is {size} bytes, limit is {max}")]
    TransferTooLarge { size: u64, max: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Server did not answer the connection request in time")]
    HandshakeTimeout,

    #[error("Connection closed")]
    Disconnected,

    #[error("{0} cannot be requested by a client")]
    InvalidAvailability(Availability),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
