use std::path::PathBuf;

/// The primary error type for all operations in the `libernet` crate.
///
/// Absent blocks are *not* errors; store and codec APIs return `Ok(None)`
/// for those so callers can collect missing-block lists.
#[derive(Debug, thiserror::Error)]
pub enum LibernetError {
    /// An I/O error, with the path where it happened when known.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },

    /// A URL that does not match any of the four recognized shapes.
    #[error("invalid block URL: {0}")]
    InvalidUrl(String),

    /// An identifier that is not 64 lowercase hex characters.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Stored bytes whose digest does not match the URL they decode under.
    #[error("corrupt block for {url}")]
    CorruptBlock { url: String },

    /// A block larger than the configured maximum.
    #[error("block of {size} bytes exceeds maximum of {max}")]
    BlockTooLarge { size: usize, max: usize },

    /// An error during serialization or deserialization of JSON structures.
    #[error("serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An HTTP request to a peer failed at the transport level.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A store was used after `shutdown()`.
    #[error("store has been shut down")]
    Shutdown,

    /// Bad user input or a violated operating assumption, with a human message.
    #[error("{0}")]
    Invariant(String),
}

impl LibernetError {
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        LibernetError::Io {
            source,
            path: path.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LibernetError>;
