//! # parley-client
//!
//! Client side of the Parley relay protocol: connection handshake, an
//! event stream for the presentation layer, and the chunked file-transfer
//! executor.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod transfer;

pub use config::ClientConfig;
pub use connection::{AuthOutcome, Client};
pub use error::{ClientError, TransferError};
pub use events::ClientEvent;
pub use transfer::{NoopObserver, TransferExecutor, TransferObserver, TransferProgress};

pub use parley_shared::commands::Credentials;
