use http::StatusCode;
use thiserror::Error;

/// Terminal faults surfaced to HTTP clients.
///
/// `Clone` is required: a cache entry records its terminal error once and
/// every current and future consumer of that entry receives its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServeError {
    #[error("file not found")]
    NotFound,

    #[error("not a regular file")]
    NotAFile,

    #[error("path is a directory")]
    IsDirectory,

    #[error("invalid range: {0}")]
    InvalidRange(RangeFault),

    #[error("disk read failed: {0}")]
    ReadFailed(String),

    #[error("internal error")]
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeFault {
    /// The range start was absent or did not parse as an integer.
    UnparsableStart,
    /// Start or end fell outside the representation, or end <= start.
    OutOfBounds,
}

impl std::fmt::Display for RangeFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeFault::UnparsableStart => write!(f, "missing or non-numeric start"),
            RangeFault::OutOfBounds => write!(f, "offset out of bounds"),
        }
    }
}

impl ServeError {
    /// HTTP status this fault maps to. 401 for non-regular files mirrors the
    /// historical behavior of this server family, not an auth semantic.
    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::NotFound => StatusCode::NOT_FOUND,
            ServeError::NotAFile | ServeError::IsDirectory => StatusCode::UNAUTHORIZED,
            ServeError::InvalidRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            ServeError::ReadFailed(_) | ServeError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
