//! Error types for oslog-stream.
//!
//! All errors are strongly typed using thiserror so callers can tell an
//! unavailable private framework apart from a stream the system refused to
//! create, and decide whether re-running setup makes sense.

use std::path::PathBuf;

use thiserror::Error;

use crate::message::StreamId;

/// Errors raised while loading the logging library or resolving its symbols.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Library {} could not be loaded: {message}", .path.display())]
    LibraryUnavailable {
        path: PathBuf,
        message: String,
    },

    #[error("Symbol '{symbol}' is missing: {message}")]
    SymbolMissing {
        symbol: String,
        message: String,
    },
}

/// Errors raised by the stream handle state machine.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Activity stream creation for pid {pid} returned a null handle")]
    CreationFailed {
        pid: i32,
    },

    #[error("Activity stream has not been opened")]
    NotOpened,

    #[error("Activity stream {id:?} was cancelled")]
    Cancelled {
        id: Option<StreamId>,
    },
}

/// Errors raised by the dispatch bridge.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Delivery context '{path}' is disconnected")]
    Disconnected {
        path: String,
    },

    #[error("Failed to spawn delivery thread: {message}")]
    SpawnFailed {
        message: String,
    },
}

/// Top-level error type for oslog-stream.
#[derive(Debug, Error)]
pub enum LogStreamError {
    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {reason}")]
    Config {
        reason: String,
    },
}

impl LogStreamError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Returns true if the library or one of its symbols was unavailable.
    #[must_use]
    pub const fn is_resolve(&self) -> bool {
        matches!(self, Self::Resolve(_))
    }

    /// Returns true if this is a stream lifecycle error.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Returns true if this is a dispatch error.
    #[must_use]
    pub const fn is_dispatch(&self) -> bool {
        matches!(self, Self::Dispatch(_))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Returns true if re-running setup may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Resolve(_) => true,
            Self::Stream(e) => matches!(e, StreamError::CreationFailed { .. }),
            Self::Dispatch(e) => matches!(e, DispatchError::SpawnFailed { .. }),
            Self::Config { .. } => false,
        }
    }
}

/// Result type alias for oslog-stream operations.
pub type LogStreamResult<T> = Result<T, LogStreamError>;
