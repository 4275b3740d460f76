/// Version string exchanged in `CONNECTION_REQUEST`. Peers must match exactly.
pub const PROTOCOL_VERSION: &str = "parley/1.0";

/// Application name
pub const APP_NAME: &str = "Parley";

/// Display name used for server-originated entities
pub const SERVER_SENDER_NAME: &str = "Server";

/// Length in bytes of user IDs and transfer IDs (hex-encoded as 64 chars)
pub const TOKEN_SIZE: usize = 32;

/// Per-account salt size in bytes
pub const SALT_SIZE: usize = 16;

/// Random characters appended to `"Guest"` for disposable usernames
pub const GUEST_SUFFIX_LEN: usize = 16;

/// Prefix of disposable guest usernames
pub const GUEST_PREFIX: &str = "Guest";

/// Maximum encoded frame body in bytes (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default file-transfer chunk size in bytes
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Largest chunk size a producer may use; keeps chunks well inside one frame
pub const MAX_CHUNK_SIZE: usize = 512 * 1024;

/// Maximum file transfer size in bytes (50 MiB)
pub const MAX_TRANSFER_SIZE: u64 = 50 * 1024 * 1024;

/// Poll granularity of the transfer consumer, in seconds
pub const TRANSFER_POLL_SECS: u64 = 1;

/// Consecutive empty polls before a transfer is abandoned
pub const TRANSFER_IDLE_POLLS: u32 = 120;

/// Default TCP port of the relay
pub const DEFAULT_PORT: u16 = 4444;

/// Default admin HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8081;
