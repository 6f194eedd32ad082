//! Reliable upload of chunks into the vector index.

use std::time::Duration;

use tracing::debug;

use crate::config::RetryPolicy;
use crate::errors::{GeoError, IndexError};
use crate::index::VectorIndex;
use crate::record::IndexedPoint;
use crate::retry::{retry_with_backoff, with_timeout};

/// Idempotent batch upsert with bounded retry.
///
/// The whole batch is re-sent on every attempt; upserting the same ids twice
/// is harmless. Only transient failures are retried.
pub struct IndexWriter<'a> {
    index: &'a dyn VectorIndex,
    policy: RetryPolicy,
    timeout: Option<Duration>,
}

impl<'a> IndexWriter<'a> {
    pub fn new(index: &'a dyn VectorIndex, policy: RetryPolicy, timeout: Option<Duration>) -> Self {
        Self {
            index,
            policy,
            timeout,
        }
    }

    /// Uploads `points`, returning how many were sent.
    ///
    /// # Errors
    /// - `GeoError::UploadExhausted` once every attempt failed transiently
    /// - `GeoError::Index` for a non-transient rejection
    pub async fn upload(&self, points: &[IndexedPoint]) -> Result<usize, GeoError> {
        if points.is_empty() {
            return Ok(0);
        }
        debug!(
            target: "geo_store::ingest",
            collection = self.index.collection(),
            points = points.len(),
            "uploading batch"
        );

        let index = self.index;
        let timeout = self.timeout;
        let res = retry_with_backoff(
            &self.policy,
            "upsert",
            move || with_timeout(timeout, index.upsert(points), IndexError::Timeout),
            IndexError::is_transient,
        )
        .await;

        match res {
            Ok(n) => Ok(n),
            Err(f) if f.error.is_transient() => Err(GeoError::UploadExhausted {
                attempts: f.attempts,
                source: f.error,
            }),
            Err(f) => Err(GeoError::Index(f.error)),
        }
    }
}
