//! Unified error type for reelhouse.
//!
//! All crates funnel their failures into [`Error`], which carries enough
//! context for API handlers to derive an HTTP status code via
//! [`Error::http_status`] and for background workers to decide whether a
//! failure is worth retrying via [`Error::class`].

use std::fmt;

/// Unified error type covering all failure modes in reelhouse.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found (or has been removed).
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "entry", "session").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// The entry exists but is not servable yet.
    #[error("Not ready: {0}")]
    NotReady(String),

    /// The request was malformed (bad range header, path traversal, ...).
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A byte range lies entirely outside the resource.
    #[error("Range not satisfiable for resource of {size} bytes")]
    RangeNotSatisfiable {
        /// Total size of the resource.
        size: u64,
    },

    /// Configuration or input failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The store is locked by another writer; retried internally before
    /// surfacing.
    #[error("Store busy: {0}")]
    StoreBusy(String),

    /// The store's on-disk state is damaged. Fatal to the store instance.
    #[error("Store corrupt: {0}")]
    StoreCorrupt(String),

    /// The store is being rebuilt after corruption or a format change.
    #[error("Store is recovering")]
    StoreRecovering,

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An external tool (ffprobe) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Metadata extraction failed.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// An operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff (file momentarily locked, store busy, deadline hit).
    Transient,
    /// The file is not readable as media; the entry stays `Pending`.
    PermanentExtraction,
    /// Fatal to the store instance; triggers a full reindex.
    StoreCorruption,
    /// Malformed client request; answered with a client error, never retried.
    ProtocolViolation,
    /// Unknown or removed resource.
    NotFound,
    /// Anything else.
    Internal,
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::NotReady(_) => 503,
            Error::Protocol(_) => 400,
            Error::RangeNotSatisfiable { .. } => 416,
            Error::Validation(_) => 400,
            Error::StoreBusy(_) => 503,
            Error::StoreCorrupt(_) => 503,
            Error::StoreRecovering => 503,
            Error::Database { .. } => 500,
            Error::Io { .. } => 500,
            Error::Tool { .. } => 502,
            Error::Extraction(_) => 422,
            Error::Timeout(_) => 503,
            Error::Internal(_) => 500,
        }
    }

    /// Classify this error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::StoreBusy(_) | Error::Timeout(_) | Error::Io { .. } | Error::Tool { .. } => {
                ErrorClass::Transient
            }
            Error::StoreRecovering | Error::NotReady(_) => ErrorClass::Transient,
            Error::Extraction(_) => ErrorClass::PermanentExtraction,
            Error::StoreCorrupt(_) => ErrorClass::StoreCorruption,
            Error::Protocol(_) | Error::RangeNotSatisfiable { .. } | Error::Validation(_) => {
                ErrorClass::ProtocolViolation
            }
            Error::NotFound { .. } => ErrorClass::NotFound,
            Error::Database { .. } | Error::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether a caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = Error::not_found("entry", "song.mp3");
        assert_eq!(err.to_string(), "entry not found: song.mp3");
        assert_eq!(err.http_status(), 404);
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[test]
    fn not_ready_is_transient() {
        let err = Error::NotReady("pending".into());
        assert_eq!(err.http_status(), 503);
        assert!(err.is_retryable());
    }

    #[test]
    fn protocol_violation_is_not_retryable() {
        let err = Error::Protocol("bad range".into());
        assert_eq!(err.http_status(), 400);
        assert_eq!(err.class(), ErrorClass::ProtocolViolation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn range_not_satisfiable_display() {
        let err = Error::RangeNotSatisfiable { size: 10 };
        assert_eq!(
            err.to_string(),
            "Range not satisfiable for resource of 10 bytes"
        );
        assert_eq!(err.http_status(), 416);
    }

    #[test]
    fn store_errors_classified() {
        assert_eq!(
            Error::StoreBusy("locked".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            Error::StoreCorrupt("malformed".into()).class(),
            ErrorClass::StoreCorruption
        );
        assert_eq!(Error::StoreRecovering.http_status(), 503);
    }

    #[test]
    fn io_from_std() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Io { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn tool_display() {
        let err = Error::tool("ffprobe", "exit code 1");
        assert_eq!(err.to_string(), "Tool error [ffprobe]: exit code 1");
        assert_eq!(err.http_status(), 502);
    }

    #[test]
    fn extraction_is_permanent() {
        let err = Error::Extraction("not media".into());
        assert_eq!(err.class(), ErrorClass::PermanentExtraction);
        assert!(!err.is_retryable());
    }

    #[test]
    fn database_display() {
        let err = Error::database("connection refused");
        assert!(err.to_string().contains("connection refused"));
        assert_eq!(err.http_status(), 500);
    }
}
