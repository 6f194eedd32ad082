//! Unified error types for the crate.
//!
//! Each external collaborator gets its own enum ([`EmbedError`], [`IndexError`],
//! [`CheckpointError`]); [`GeoError`] is the top-level type returned by the
//! public API and converts from all of them.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by an embedding backend.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// Transport/HTTP client error.
    #[error("embedding transport error: {0}")]
    Transport(String),

    /// Non-successful HTTP status from the embedding service.
    #[error("embedding service returned {status}: {snippet}")]
    HttpStatus { status: u16, snippet: String },

    /// Response could not be decoded or had the wrong shape.
    #[error("embedding decode error: {0}")]
    Decode(String),

    /// The service returned a different number of vectors than inputs.
    #[error("embedding count mismatch: got {got}, want {want}")]
    CountMismatch { got: usize, want: usize },

    /// Vector dimensionality differs from the expected one.
    #[error("embedding vector size mismatch: got {got}, want {want}")]
    VectorSizeMismatch { got: usize, want: usize },

    /// The call exceeded the configured timeout.
    #[error("embedding call timed out after {0:?}")]
    Timeout(Duration),
}

impl EmbedError {
    /// Network failures, timeouts, throttling and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            EmbedError::Transport(_) | EmbedError::Timeout(_) => true,
            EmbedError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for EmbedError {
    fn from(e: reqwest::Error) -> Self {
        EmbedError::Transport(e.to_string())
    }
}

/// Errors produced by the vector index.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Network/service failure; the same request may succeed later.
    #[error("index transport error: {0}")]
    Transport(String),

    /// The call exceeded the configured timeout.
    #[error("index call timed out after {0:?}")]
    Timeout(Duration),

    /// The request was rejected and retrying it cannot help.
    #[error("index rejected request: {0}")]
    Rejected(String),

    /// The target collection does not exist.
    #[error("collection '{0}' not found")]
    MissingCollection(String),

    /// A vector does not match the collection dimensionality.
    #[error("index vector size mismatch: got {got}, want {want}")]
    VectorSizeMismatch { got: usize, want: usize },
}

impl IndexError {
    /// Whether the failed request is worth repeating.
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexError::Transport(_) | IndexError::Timeout(_))
    }
}

impl From<qdrant_client::QdrantError> for IndexError {
    fn from(e: qdrant_client::QdrantError) -> Self {
        use qdrant_client::QdrantError as Q;
        use tonic::Code;

        match &e {
            Q::ResponseError { status } | Q::ResourceExhaustedError { status, .. } => {
                match status.code() {
                    Code::Unavailable
                    | Code::DeadlineExceeded
                    | Code::ResourceExhausted
                    | Code::Aborted
                    | Code::Internal
                    | Code::Unknown
                    | Code::Cancelled => IndexError::Transport(e.to_string()),
                    _ => IndexError::Rejected(e.to_string()),
                }
            }
            Q::Io(_) => IndexError::Transport(e.to_string()),
            _ => IndexError::Rejected(e.to_string()),
        }
    }
}

/// Errors produced by a checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// I/O failure while persisting the checkpoint document.
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),

    /// The checkpoint document could not be serialized.
    #[error("checkpoint encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The store's internal lock was poisoned by a panicking writer.
    #[error("checkpoint store lock poisoned")]
    Poisoned,
}

/// Top-level error for geo-store operations.
#[derive(Debug, Error)]
pub enum GeoError {
    /// I/O or filesystem errors (source stream).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unsupported configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Invalid query parameters.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Embedding backend failure.
    #[error(transparent)]
    Embed(#[from] EmbedError),

    /// Vector index failure.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Checkpoint store failure.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Upload retries were exhausted.
    #[error("upload failed after {attempts} attempts: {source}")]
    UploadExhausted {
        attempts: u32,
        #[source]
        source: IndexError,
    },

    /// Another writer moved the checkpoint underneath this run.
    #[error("checkpoint for '{collection}' moved: expected {expected}, found {found}")]
    CheckpointConflict {
        collection: String,
        expected: u64,
        found: u64,
    },

    /// The run was stopped between chunks.
    #[error("ingestion cancelled; last committed position {last_committed}")]
    Cancelled { last_committed: u64 },

    /// Terminal ingestion failure. The checkpoint remains at `last_committed`.
    #[error("ingestion aborted at position {last_committed}: {source}")]
    Aborted {
        last_committed: u64,
        #[source]
        source: Box<GeoError>,
    },
}

impl GeoError {
    /// Last committed position carried by a terminal ingestion error.
    pub fn last_committed(&self) -> Option<u64> {
        match self {
            GeoError::Aborted { last_committed, .. } | GeoError::Cancelled { last_committed } => {
                Some(*last_committed)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qdrant_client::QdrantError;
    use tonic::Status;

    fn from_status(status: Status) -> IndexError {
        IndexError::from(QdrantError::from(status))
    }

    #[test]
    fn qdrant_rejections_are_not_transient() {
        let dim = from_status(Status::invalid_argument(
            "Wrong input: Vector dimension error: expected dim: 384, got 16",
        ));
        assert!(matches!(dim, IndexError::Rejected(_)), "{dim:?}");
        assert!(!dim.is_transient());

        for status in [
            Status::not_found("Collection `tweets` doesn't exist!"),
            Status::failed_precondition("collection is being deleted"),
            Status::permission_denied("api key"),
        ] {
            assert!(!from_status(status).is_transient());
        }
    }

    #[test]
    fn qdrant_outages_are_transient() {
        for status in [
            Status::unavailable("connection refused"),
            Status::deadline_exceeded("slow"),
            Status::resource_exhausted("too many requests"),
            Status::internal("segment flush failed"),
        ] {
            let e = from_status(status);
            assert!(matches!(e, IndexError::Transport(_)), "{e:?}");
            assert!(e.is_transient());
        }

        let io = IndexError::from(QdrantError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(io.is_transient());
    }

    #[test]
    fn qdrant_conversion_errors_are_rejections() {
        let e = IndexError::from(QdrantError::ConversionError("sparse into dense".into()));
        assert!(!e.is_transient());
    }
}
