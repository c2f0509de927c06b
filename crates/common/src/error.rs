use thiserror::Error;

/// Canonical SFL error taxonomy used across crates.
///
/// Classification guidance:
/// - [`SflError::StageNotStarted`]: lookup of a shuffle stage nobody registered
/// - [`SflError::StageCorrupted`]: schema conflict or any write/flush/commit
///   failure; the offending stage has already been marked corrupted
/// - [`SflError::QuotaExceeded`]: application wrote past its byte budget
/// - [`SflError::InvalidState`]: internal invariant violation (a scheduling
///   bug, not a user error)
/// - [`SflError::Io`]: raw filesystem IO failures from std APIs
#[derive(Debug, Error)]
pub enum SflError {
    /// No stage state exists for the requested shuffle.
    ///
    /// Fatal to the caller but recoverable at the service level: the client
    /// can register the stage and retry.
    #[error("shuffle stage not started: {0}")]
    StageNotStarted(String),

    /// The stage's outputs must not be consumed.
    ///
    /// Raised on re-registration conflicts and on any exception escaping the
    /// write/flush/commit paths. Absorbing: once a stage carries this status
    /// nothing clears it.
    #[error("shuffle stage corrupted: {0}")]
    StageCorrupted(String),

    /// The application wrote more bytes than its configured budget allows.
    #[error("application wrote too much data: {0}")]
    QuotaExceeded(String),

    /// Internal invariant violation; a programming error, never caught and
    /// recovered internally.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard SFL result alias.
pub type Result<T> = std::result::Result<T, SflError>;
