//! # Error Handling
//!
//! Error types for Chronicle storage operations.
//!
//! Expected read outcomes (a missing event, a deleted stream) are not errors:
//! they are variants of [`ReadEventResult`](crate::types::ReadEventResult) and
//! friends. The variants here are failures the caller has to act on.
//!
//! ## Categories
//!
//! 1. **Fatal**: `CorruptedChunk`, index corruption. The node refuses to
//!    continue with the affected file until it is repaired.
//! 2. **Caller faults**: `WrongExpectedVersion`, `StreamDeleted` on write.
//! 3. **I/O**: `WriteError`, `Io`. Surfaced once, never retried internally.

use std::fmt;

use thiserror::Error;

use crate::types::ExpectedVersion;

/// Result type alias for Chronicle operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for Chronicle
#[derive(Error, Debug)]
pub enum Error {
    // Log errors
    #[error("Corrupted chunk #{chunk_number} at offset {offset}: {reason}")]
    CorruptedChunk { chunk_number: u32, offset: u64, reason: String },

    #[error("Write failed: {message}")]
    WriteError { message: String, source: Option<std::io::Error> },

    #[error("Record not found at position {position}")]
    NotFound { position: u64 },

    #[error("Checkpoint '{name}' error: {message}")]
    Checkpoint { name: String, message: String },

    // Stream errors
    #[error("Wrong expected version for stream '{stream}': expected {expected}, actual {actual}")]
    WrongExpectedVersion { stream: String, expected: ExpectedVersion, actual: StreamVersion },

    #[error("Stream '{stream}' is deleted")]
    StreamDeleted { stream: String },

    // Index errors
    #[error("PTable error: {message}")]
    PTable { message: String, source: Option<Box<dyn std::error::Error + Send + Sync>> },

    #[error("Index manifest error: {message}")]
    IndexManifest { message: String, source: Option<Box<dyn std::error::Error + Send + Sync>> },

    #[error("Scavenge failed: {reason}")]
    Scavenge { reason: String },

    // System errors
    #[error("IO error: {message}")]
    Io { message: String, source: std::io::Error },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("{component} is shut down")]
    Shutdown { component: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Current version of a stream as reported by a failed expected-version check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamVersion {
    NoStream,
    Deleted,
    At(i32),
}

impl fmt::Display for StreamVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamVersion::NoStream => write!(f, "no stream"),
            StreamVersion::Deleted => write!(f, "deleted"),
            StreamVersion::At(n) => write!(f, "{}", n),
        }
    }
}

impl Error {
    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::CorruptedChunk { .. } => false,
            Error::PTable { .. } => false,
            Error::IndexManifest { .. } => false,
            Error::Checkpoint { .. } => false,
            Error::WriteError { .. } => false,
            Error::Io { .. } => false,
            Error::Shutdown { .. } => false,
            _ => true,
        }
    }

    /// Get error code for monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::CorruptedChunk { .. } => "CORRUPTED_CHUNK",
            Error::WriteError { .. } => "WRITE_ERROR",
            Error::NotFound { .. } => "NOT_FOUND",
            Error::Checkpoint { .. } => "CHECKPOINT_ERROR",
            Error::WrongExpectedVersion { .. } => "WRONG_EXPECTED_VERSION",
            Error::StreamDeleted { .. } => "STREAM_DELETED",
            Error::PTable { .. } => "PTABLE_ERROR",
            Error::IndexManifest { .. } => "INDEX_MANIFEST_ERROR",
            Error::Scavenge { .. } => "SCAVENGE_ERROR",
            Error::Io { .. } => "IO_ERROR",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Shutdown { .. } => "SHUTDOWN",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Wrap an I/O failure on the append path.
    pub fn write(message: impl Into<String>, source: std::io::Error) -> Self {
        Error::WriteError { message: message.into(), source: Some(source) }
    }

    pub fn corrupted(chunk_number: u32, offset: u64, reason: impl Into<String>) -> Self {
        Error::CorruptedChunk { chunk_number, offset, reason: reason.into() }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

/// Extension trait for adding context to results
pub trait ResultExt<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| match e {
            Error::Io { message, source } => Error::Io {
                message: format!("{}: {}", f(), message),
                source,
            },
            other => other,
        })
    }
}
