use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared by every engine component.
///
/// Codec and chunker code never retries internally; transient conditions
/// surface as `Io` and are the transport adapter's problem.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("unexpected end of input: {0}")]
    UnexpectedEof(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid session state: {0}")]
    SessionState(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the caller may retry the operation verbatim.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}
