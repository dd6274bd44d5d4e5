//! Error types for `sftp-core`.
//!
//! All fallible operations in the core library return [`CoreResult<T>`],
//! which is an alias for `Result<T, CoreError>`.

use std::path::PathBuf;

/// Unified error type for all core operations.
///
/// Each variant captures just enough context for the caller to display a
/// meaningful message, map it to an SFTP status code, or take corrective
/// action. See `crate::handler` for the mapping onto
/// `russh_sftp::protocol::StatusCode`.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Username/password pair did not authenticate.
    #[error("authentication failed")]
    AuthFailed,

    /// A resolved host path escaped the session's home subtree.
    #[error("path escapes jail: {0}")]
    PathEscape(String),

    /// The target path does not exist.
    #[error("not found: {0}")]
    NotFound(PathBuf),

    /// An I/O error that doesn't fit a more specific variant.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The identity store returned an error or is unreachable.
    #[error("store error: {0}")]
    Store(String),

    /// Malformed or unexpected SFTP/SSH wire data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration detected at startup.
    #[error("config error: {0}")]
    Config(String),
}

/// Convenience alias used throughout `sftp-core`.
pub type CoreResult<T> = Result<T, CoreError>;
