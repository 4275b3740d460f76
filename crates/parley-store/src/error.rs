use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Reading, writing or renaming a store file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A line of the credential store is not a valid record.
    #[error("Corrupt record on line {line}: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// A stored salt or hash is not valid hex.
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Serializing a record failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Caller supplied an unusable field (empty, or too long).
    #[error("Invalid {field}")]
    InvalidInput { field: &'static str },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
