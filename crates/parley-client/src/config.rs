use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{DEFAULT_CHUNK_SIZE, MAX_TRANSFER_SIZE};

/// Client-side settings. The GUI layer owns persistence; this is just the
/// in-memory shape handed to [`crate::Client::connect`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bytes per outgoing transfer chunk.
    pub chunk_size: usize,
    /// Largest file sent or accepted.
    pub max_transfer_bytes: u64,
    /// Where received files are written.
    pub download_dir: PathBuf,
    /// How long to wait for `CONNECTION_AUTHORIZED` / `CONNECTION_DENIED`.
    pub handshake_timeout: Duration,
    /// Capacity of the event channel handed to the caller.
    pub event_buffer: usize,
    /// Capacity of the outgoing entity queue.
    pub outbound_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_transfer_bytes: MAX_TRANSFER_SIZE,
            download_dir: PathBuf::from("./downloads"),
            handshake_timeout: Duration::from_secs(10),
            event_buffer: 256,
            outbound_buffer: 64,
        }
    }
}
