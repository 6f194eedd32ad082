//! Geotagged text store: resumable ingestion + hybrid retrieval over Qdrant.
//!
//! This crate provides a clean API to:
//! - Ingest a newline-delimited JSON source in checkpointed chunks
//! - Retrieve records near a point, ranked by text similarity or by distance
//!   plus centroid similarity
//! - Report simple collection metrics
//!
//! The design is flat (no deep nesting) and splits responsibilities into focused modules.

pub mod checkpoint;
pub mod config;
pub mod embed;
pub mod errors;
pub mod geo;
pub mod index;
pub mod ingest;
pub mod metrics;
pub mod progress;
pub mod record;
pub mod retrieve;
pub mod retry;
pub mod stream;
pub mod writer;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::{
    CoordinateOrder, DistanceKind, EmbeddingBackend, EmbeddingConfig, GeoConfig, RetryPolicy,
    SearchConfig, VectorSpace,
};
pub use embed::{EmbeddingsProvider, HashingEmbedder, OllamaEmbedder};
pub use errors::{CheckpointError, EmbedError, GeoError, IndexError};
pub use index::{MemoryIndex, QdrantIndex, VectorIndex};
pub use ingest::{IngestOptions, IngestReport, IngestState, Ingestor};
pub use progress::{IndicatifProgress, NoopProgress, Progress};
pub use record::{GeoQuery, HybridResult, IndexedPoint, PointPayload, Record, SearchResult};
pub use retrieve::{HybridRetriever, centroid};
pub use stream::{RecordStream, SkipReason, SkipStats, StreamItem};

use std::path::Path;

use tracing::{debug, trace};

/// High-level facade that wires configuration, index, encoder and checkpoints.
///
/// This is the single entry point recommended for application code.
pub struct GeoStore {
    cfg: GeoConfig,
    index: Box<dyn VectorIndex>,
    embedder: Box<dyn EmbeddingsProvider>,
    checkpoints: Box<dyn CheckpointStore>,
}

impl GeoStore {
    /// Constructs a store backed by Qdrant, the configured embedding provider
    /// and a file checkpoint.
    ///
    /// # Errors
    /// Returns `GeoError::Config` if the configuration or a client is invalid.
    pub fn new(cfg: GeoConfig) -> Result<Self, GeoError> {
        trace!("GeoStore::new collection={}", cfg.collection);
        let index = QdrantIndex::new(&cfg)?;
        let embedder = embed::provider_from_config(&cfg.embedding, cfg.call_timeout)?;
        let checkpoints = FileCheckpointStore::new(cfg.checkpoint_path.clone());
        Ok(Self {
            cfg,
            index: Box::new(index),
            embedder,
            checkpoints: Box::new(checkpoints),
        })
    }

    /// Assembles a store from explicit collaborators (offline runs, tests).
    pub fn from_parts(
        cfg: GeoConfig,
        index: Box<dyn VectorIndex>,
        embedder: Box<dyn EmbeddingsProvider>,
        checkpoints: Box<dyn CheckpointStore>,
    ) -> Self {
        Self {
            cfg,
            index,
            embedder,
            checkpoints,
        }
    }

    pub fn config(&self) -> &GeoConfig {
        &self.cfg
    }

    pub fn index(&self) -> &dyn VectorIndex {
        self.index.as_ref()
    }

    /// An ingestor configured from this store; attach progress or a cancel
    /// channel before running it.
    pub fn ingestor(&self) -> Ingestor<'_> {
        Ingestor::new(
            self.index.as_ref(),
            self.embedder.as_ref(),
            self.checkpoints.as_ref(),
            IngestOptions::from_config(&self.cfg),
        )
    }

    /// Ingests the configured source file.
    ///
    /// # Errors
    /// See [`Ingestor::run`].
    pub async fn ingest(&self) -> Result<IngestReport, GeoError> {
        self.ingest_file(&self.cfg.source_path).await
    }

    /// Ingests records from an explicit NDJSON path.
    pub async fn ingest_file(&self, path: impl AsRef<Path>) -> Result<IngestReport, GeoError> {
        debug!("GeoStore::ingest_file path={:?}", path.as_ref());
        self.ingestor().run_file(path).await
    }

    /// A retriever using the configured search options.
    pub fn retriever(&self) -> HybridRetriever<'_> {
        HybridRetriever::new(self.index.as_ref(), self.embedder.as_ref())
            .with_bbox_prefilter(self.cfg.search.bbox_prefilter)
            .with_timeout(self.cfg.call_timeout)
    }

    /// A query around a point using the configured defaults.
    pub fn query_around(&self, latitude: f64, longitude: f64) -> GeoQuery {
        GeoQuery::around(latitude, longitude, &self.cfg.search)
    }

    /// Runs a hybrid search.
    ///
    /// # Errors
    /// See [`HybridRetriever::search`].
    pub async fn search(&self, query: &GeoQuery) -> Result<HybridResult, GeoError> {
        trace!("GeoStore::search text={}", query.text().is_some());
        self.retriever().search(query).await
    }

    /// Total number of points in the collection.
    pub async fn total_points(&self) -> Result<u64, GeoError> {
        metrics::total_points(self.index.as_ref(), self.cfg.call_timeout).await
    }

    /// Number of distinct stored locations.
    pub async fn unique_locations(&self) -> Result<usize, GeoError> {
        metrics::unique_locations(self.index.as_ref(), self.cfg.call_timeout).await
    }

    /// Last committed source position of the collection.
    pub fn checkpoint(&self) -> Result<u64, GeoError> {
        Ok(self.checkpoints.read(&self.cfg.collection)?)
    }
}
