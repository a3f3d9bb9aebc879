//! Error taxonomy for the process registry.
//!
//! Every failure a registry operation can surface falls into one of these
//! classes. The MCP dispatcher maps them onto JSON-RPC error objects; the
//! CLI reports them through `anyhow` with context attached.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// An unknown process id, or a missing data directory.
    #[error("not found: {0}")]
    NotFound(String),
    /// A malformed argument, such as an unparsable timestamp.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// An operation whose preconditions are not met (e.g. killing a
    /// process that is not running).
    #[error("{0}")]
    InvalidState(String),
    /// A filesystem fault while reading or writing registry state.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// A malformed message at the wire boundary.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RegistryError {
    /// Wraps a JSON parse failure of an on-disk file. A half-written or
    /// hand-edited record is treated as an I/O fault, not a protocol one.
    pub fn corrupt(path: &std::path::Path, err: serde_json::Error) -> Self {
        RegistryError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("malformed JSON in {}: {}", path.display(), err),
        ))
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
