//! Resumable chunked ingestion: read NDJSON → embed → upsert → checkpoint.
//!
//! Chunks are processed strictly one after another. The checkpoint moves to a
//! chunk's last consumed position only after the chunk's upsert succeeded, so
//! a crash at any point leaves the index ahead of (or equal to) the checkpoint
//! and a resumed run re-sends at most one chunk. Re-sent points overwrite
//! themselves because point ids are source positions.

use std::io::BufRead;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::{CoordinateOrder, DistanceKind, GeoConfig, RetryPolicy, VectorSpace};
use crate::embed::{EmbeddingsProvider, probe_dimension};
use crate::errors::{EmbedError, GeoError, IndexError};
use crate::index::VectorIndex;
use crate::progress::{NoopProgress, Progress};
use crate::record::{IndexedPoint, PointPayload, Record};
use crate::retry::{retry_with_backoff, with_timeout};
use crate::stream::{RecordStream, SkipStats, StreamItem};
use crate::writer::IndexWriter;

/// Payload fields that get a float index when the collection is created.
pub const GEO_PAYLOAD_FIELDS: [&str; 2] = ["latitude", "longitude"];

/// Ingestion state machine; every transition is logged at debug level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestState {
    NotStarted,
    Streaming,
    ChunkFull,
    Encoding,
    Uploading,
    CheckpointWritten,
    /// Flushing the trailing partial chunk.
    Draining,
    Done,
    Aborted,
}

/// Knobs of one ingestion run.
#[derive(Clone, Debug)]
pub struct IngestOptions {
    pub chunk_size: usize,
    pub resume: bool,
    pub coordinate_order: CoordinateOrder,
    pub upload_retry: RetryPolicy,
    pub embed_retry: RetryPolicy,
    pub call_timeout: Option<Duration>,
}

impl IngestOptions {
    pub fn from_config(cfg: &GeoConfig) -> Self {
        Self {
            chunk_size: cfg.chunk_size,
            resume: cfg.resume,
            coordinate_order: cfg.coordinate_order,
            upload_retry: cfg.upload_retry,
            embed_retry: cfg.embed_retry,
            call_timeout: cfg.call_timeout,
        }
    }
}

/// Summary of a finished run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub collection: String,
    /// First source position read by this run.
    pub start_position: u64,
    /// Checkpoint value when the run ended.
    pub last_committed: u64,
    /// Chunks uploaded and committed.
    pub chunks: u64,
    /// Records uploaded.
    pub records: u64,
    pub skipped: SkipStats,
}

/// Drives Record Stream → Embedding Encoder → Index Writer → Checkpoint Store.
pub struct Ingestor<'a> {
    index: &'a dyn VectorIndex,
    embedder: &'a dyn EmbeddingsProvider,
    checkpoints: &'a dyn CheckpointStore,
    progress: &'a dyn Progress,
    options: IngestOptions,
    cancel: Option<watch::Receiver<bool>>,
}

impl<'a> Ingestor<'a> {
    pub fn new(
        index: &'a dyn VectorIndex,
        embedder: &'a dyn EmbeddingsProvider,
        checkpoints: &'a dyn CheckpointStore,
        options: IngestOptions,
    ) -> Self {
        Self {
            index,
            embedder,
            checkpoints,
            progress: &NoopProgress,
            options,
            cancel: None,
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn Progress) -> Self {
        self.progress = progress;
        self
    }

    /// Stops the run between chunks once the receiver observes `true`.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancel_requested(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Creates the collection on first use.
    ///
    /// The vector size comes from a probe encoding; the metric is always
    /// cosine. Float payload indexes on latitude/longitude are requested on
    /// every run and are best-effort.
    pub async fn ensure_collection(&self) -> Result<(), GeoError> {
        let timeout = self.options.call_timeout;
        let exists = with_timeout(timeout, self.index.collection_exists(), IndexError::Timeout).await?;
        if exists {
            debug!("Collection '{}' already exists", self.index.collection());
        } else {
            let size =
                with_timeout(timeout, probe_dimension(self.embedder), EmbedError::Timeout).await?;
            info!(
                target: "geo_store::ingest",
                collection = self.index.collection(),
                size,
                model = self.embedder.model_id(),
                "creating collection"
            );
            with_timeout(
                timeout,
                self.index.create_collection(&VectorSpace {
                    size,
                    distance: DistanceKind::Cosine,
                }),
                IndexError::Timeout,
            )
            .await?;
        }

        for field in GEO_PAYLOAD_FIELDS {
            if let Err(e) =
                with_timeout(timeout, self.index.create_payload_index(field), IndexError::Timeout).await
            {
                warn!("Payload index '{field}' not created (ignored): {e}");
            }
        }
        Ok(())
    }

    /// Ingests the NDJSON file at `path`.
    pub async fn run_file(&self, path: impl AsRef<Path>) -> Result<IngestReport, GeoError> {
        let path = path.as_ref();
        // Fail before touching the index when the source is missing.
        let file = std::fs::File::open(path)?;
        info!("Ingesting {:?} into '{}'", path, self.index.collection());
        self.run(std::io::BufReader::new(file)).await
    }

    /// Ingests NDJSON lines from `reader`, resuming after the stored checkpoint.
    ///
    /// # Errors
    /// - `GeoError::Cancelled` when stopped through the cancel channel
    /// - `GeoError::Aborted` for any other failure; the checkpoint is left at
    ///   `last_committed`
    pub async fn run<R: BufRead>(&self, reader: R) -> Result<IngestReport, GeoError> {
        let collection = self.index.collection().to_string();
        let stored = self.checkpoints.read(&collection)?;
        let start = if self.options.resume { stored + 1 } else { 1 };

        let mut report = IngestReport {
            collection,
            start_position: start,
            last_committed: stored,
            ..Default::default()
        };
        let mut state = IngestState::NotStarted;

        match self.drive(reader, &mut report, &mut state).await {
            Ok(()) => {
                enter(&mut state, IngestState::Done, &report.collection);
                info!(
                    target: "geo_store::ingest",
                    collection = %report.collection,
                    last_committed = report.last_committed,
                    chunks = report.chunks,
                    records = report.records,
                    skipped = report.skipped.total(),
                    "ingestion finished"
                );
                self.progress
                    .finish(&format!("done, checkpoint at {}", report.last_committed));
                Ok(report)
            }
            Err(e @ GeoError::Cancelled { .. }) => {
                warn!(
                    target: "geo_store::ingest",
                    collection = %report.collection,
                    last_committed = report.last_committed,
                    "ingestion cancelled"
                );
                self.progress.finish("cancelled");
                Err(e)
            }
            Err(e) => {
                enter(&mut state, IngestState::Aborted, &report.collection);
                tracing::error!(
                    target: "geo_store::ingest",
                    collection = %report.collection,
                    last_committed = report.last_committed,
                    error = %e,
                    "ingestion aborted"
                );
                self.progress.finish("aborted");
                Err(GeoError::Aborted {
                    last_committed: report.last_committed,
                    source: Box::new(e),
                })
            }
        }
    }

    async fn drive<R: BufRead>(
        &self,
        reader: R,
        report: &mut IngestReport,
        state: &mut IngestState,
    ) -> Result<(), GeoError> {
        self.ensure_collection().await?;

        let chunk_size = self.options.chunk_size.max(1);
        let stream = RecordStream::new(reader, report.start_position, self.options.coordinate_order);
        let mut chunk: Vec<Record> = Vec::with_capacity(chunk_size);
        // Last position consumed by this run; skipped lines count.
        let mut consumed = report.start_position.saturating_sub(1);

        enter(state, IngestState::Streaming, &report.collection);
        for item in stream {
            let item = item?;
            consumed = item.position();
            match item {
                StreamItem::Record(r) => chunk.push(r),
                StreamItem::Skipped { position, reason } => {
                    trace!("line {position} skipped: {reason:?}");
                    report.skipped.record(reason);
                }
            }

            if chunk.len() == chunk_size {
                enter(state, IngestState::ChunkFull, &report.collection);
                self.commit_chunk(&chunk, consumed, report, state).await?;
                chunk.clear();
                enter(state, IngestState::Streaming, &report.collection);
            }
        }

        enter(state, IngestState::Draining, &report.collection);
        // Trailing skipped lines still move the checkpoint forward.
        if !chunk.is_empty() || consumed > report.last_committed {
            self.commit_chunk(&chunk, consumed, report, state).await?;
        }
        Ok(())
    }

    /// Encodes and uploads `chunk`, then commits `end` as the new checkpoint.
    async fn commit_chunk(
        &self,
        chunk: &[Record],
        end: u64,
        report: &mut IngestReport,
        state: &mut IngestState,
    ) -> Result<(), GeoError> {
        if self.cancel_requested() {
            return Err(GeoError::Cancelled {
                last_committed: report.last_committed,
            });
        }

        if !chunk.is_empty() {
            enter(state, IngestState::Encoding, &report.collection);
            let texts: Vec<String> = chunk.iter().map(|r| r.text.clone()).collect();
            let vectors = self.encode(&texts).await?;

            enter(state, IngestState::Uploading, &report.collection);
            let points: Vec<IndexedPoint> = chunk
                .iter()
                .zip(vectors)
                .map(|(r, vector)| IndexedPoint {
                    id: r.position,
                    vector,
                    payload: PointPayload::from(r),
                })
                .collect();
            IndexWriter::new(
                self.index,
                self.options.upload_retry,
                self.options.call_timeout,
            )
            .upload(&points)
            .await?;
        }

        let expected = report.last_committed;
        // A non-resumed run never moves the checkpoint backwards.
        let new = expected.max(end);
        if new != expected {
            let swapped = self
                .checkpoints
                .compare_and_swap(&report.collection, expected, new)?;
            if !swapped {
                let found = self.checkpoints.read(&report.collection)?;
                return Err(GeoError::CheckpointConflict {
                    collection: report.collection.clone(),
                    expected,
                    found,
                });
            }
            report.last_committed = new;
        }
        enter(state, IngestState::CheckpointWritten, &report.collection);

        if !chunk.is_empty() {
            report.chunks += 1;
            report.records += chunk.len() as u64;
        }
        let first = chunk.first().map(|r| r.position).unwrap_or(end);
        info!(
            target: "geo_store::ingest",
            collection = %report.collection,
            chunk = report.chunks,
            first,
            last = end,
            records = chunk.len(),
            checkpoint = report.last_committed,
            "chunk committed"
        );
        self.progress.chunk(
            chunk.len() as u64,
            &format!("checkpoint {}", report.last_committed),
        );
        Ok(())
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, GeoError> {
        let embedder = self.embedder;
        let timeout = self.options.call_timeout;
        let vectors = retry_with_backoff(
            &self.options.embed_retry,
            "embed",
            move || with_timeout(timeout, embedder.embed(texts), EmbedError::Timeout),
            EmbedError::is_transient,
        )
        .await
        .map_err(|f| GeoError::Embed(f.error))?;

        if vectors.len() != texts.len() {
            return Err(EmbedError::CountMismatch {
                got: vectors.len(),
                want: texts.len(),
            }
            .into());
        }
        Ok(vectors)
    }
}

fn enter(state: &mut IngestState, next: IngestState, collection: &str) {
    debug!(target: "geo_store::ingest", collection, from = ?*state, to = ?next, "state");
    *state = next;
}
