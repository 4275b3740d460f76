use thiserror::Error;

/// Malformed or unrecognised wire data. Fatal to the session that read it.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown entity kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Unknown command code: {0}")]
    UnknownCommand(u16),

    #[error("Unknown reason code: {0}")]
    UnknownReason(u16),

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Truncated or malformed {kind} body: {source}")]
    Body {
        kind: &'static str,
        #[source]
        source: bincode::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Missing or mistyped argument {index} for {code}")]
    BadArgument { code: &'static str, index: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the error came from the transport rather than the bytes on it.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
