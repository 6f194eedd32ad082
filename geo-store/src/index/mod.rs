//! Vector index abstraction.
//!
//! [`VectorIndex`] is the narrow contract the ingestor and the retriever need
//! from a vector database. Each instance is bound to one collection.
//! [`QdrantIndex`] talks to a Qdrant server; [`MemoryIndex`] keeps everything
//! in process.

use async_trait::async_trait;

use crate::config::VectorSpace;
use crate::errors::IndexError;
use crate::geo::GeoBox;
use crate::record::IndexedPoint;

pub mod memory;
pub mod qdrant;

pub use memory::MemoryIndex;
pub use qdrant::QdrantIndex;

/// Payload as read back from the index; any field may be missing.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoredPayload {
    pub document: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl StoredPayload {
    /// Both coordinates, when present.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }
}

/// A point returned by a query, scroll or lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexPoint {
    pub id: u64,
    /// Similarity score; only set by [`VectorIndex::query_by_vector`].
    pub score: Option<f32>,
    pub payload: StoredPayload,
    pub vector: Option<Vec<f32>>,
}

/// One page of a scroll; `next` is the cursor of the following page.
#[derive(Clone, Debug, Default)]
pub struct ScrollPage {
    pub points: Vec<IndexPoint>,
    pub next: Option<u64>,
}

/// Operations the core needs from the vector index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Name of the bound collection.
    fn collection(&self) -> &str;

    async fn collection_exists(&self) -> Result<bool, IndexError>;

    async fn create_collection(&self, space: &VectorSpace) -> Result<(), IndexError>;

    /// Creates a float payload index on `field`. May fail if it already exists.
    async fn create_payload_index(&self, field: &str) -> Result<(), IndexError>;

    /// Inserts or overwrites points by id. Returns the number of points sent.
    async fn upsert(&self, points: &[IndexedPoint]) -> Result<usize, IndexError>;

    /// Nearest points to `vector`, best score first.
    async fn query_by_vector(
        &self,
        vector: &[f32],
        limit: usize,
        with_vectors: bool,
    ) -> Result<Vec<IndexPoint>, IndexError>;

    /// Enumerates points in id order starting at `cursor`, optionally
    /// restricted to a latitude/longitude box.
    async fn scroll(
        &self,
        limit: usize,
        cursor: Option<u64>,
        filter: Option<&GeoBox>,
        with_vectors: bool,
    ) -> Result<ScrollPage, IndexError>;

    /// Points with the given ids (missing ids are omitted), vectors included.
    async fn retrieve(&self, ids: &[u64]) -> Result<Vec<IndexPoint>, IndexError>;

    /// Number of points in the collection.
    async fn count(&self) -> Result<u64, IndexError>;
}
