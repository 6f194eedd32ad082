//! In-process vector index.
//!
//! Exact (brute force) similarity over a `BTreeMap` keyed by point id. Used by
//! the test suite and for offline runs; semantics follow the Qdrant adapter:
//! upsert overwrites by id, scroll walks ids in ascending order, and creating
//! an existing payload index fails.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::config::{DistanceKind, VectorSpace};
use crate::errors::IndexError;
use crate::geo::GeoBox;
use crate::index::{IndexPoint, ScrollPage, StoredPayload, VectorIndex};
use crate::record::IndexedPoint;

struct Entry {
    vector: Option<Vec<f32>>,
    payload: StoredPayload,
}

struct Collection {
    space: VectorSpace,
    points: BTreeMap<u64, Entry>,
    payload_indexes: BTreeSet<String>,
}

pub struct MemoryIndex {
    name: String,
    inner: Mutex<Option<Collection>>,
}

impl MemoryIndex {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            name: collection.into(),
            inner: Mutex::new(None),
        }
    }

    /// Stores a point with an arbitrary (possibly incomplete) payload.
    ///
    /// Creates the collection with the vector's dimension if needed.
    pub fn insert_raw(
        &self,
        id: u64,
        vector: Option<Vec<f32>>,
        payload: StoredPayload,
    ) -> Result<(), IndexError> {
        let mut guard = self.lock()?;
        let coll = guard.get_or_insert_with(|| Collection {
            space: VectorSpace {
                size: vector.as_ref().map(Vec::len).unwrap_or(0),
                distance: DistanceKind::Cosine,
            },
            points: BTreeMap::new(),
            payload_indexes: BTreeSet::new(),
        });
        if let Some(v) = &vector {
            check_dim(v.len(), coll.space.size)?;
        }
        coll.points.insert(id, Entry { vector, payload });
        Ok(())
    }

    /// Ids currently stored, ascending.
    pub fn ids(&self) -> Vec<u64> {
        match self.inner.lock() {
            Ok(g) => g
                .as_ref()
                .map(|c| c.points.keys().copied().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    /// Payload indexes created so far.
    pub fn payload_indexes(&self) -> Vec<String> {
        match self.inner.lock() {
            Ok(g) => g
                .as_ref()
                .map(|c| c.payload_indexes.iter().cloned().collect())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Collection>>, IndexError> {
        self.inner
            .lock()
            .map_err(|_| IndexError::Rejected("memory index lock poisoned".into()))
    }

    fn missing(&self) -> IndexError {
        IndexError::MissingCollection(self.name.clone())
    }
}

fn check_dim(got: usize, want: usize) -> Result<(), IndexError> {
    if got != want {
        return Err(IndexError::VectorSizeMismatch { got, want });
    }
    Ok(())
}

fn similarity(distance: DistanceKind, a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match distance {
        DistanceKind::Dot => dot,
        DistanceKind::Cosine => {
            let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if na == 0.0 || nb == 0.0 {
                0.0
            } else {
                dot / (na * nb)
            }
        }
        // Qdrant reports the raw L2 distance for Euclid; smaller is better,
        // so negate it to keep "higher is closer" ordering here.
        DistanceKind::Euclid => -a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
    }
}

fn to_point(id: u64, e: &Entry, score: Option<f32>, with_vectors: bool) -> IndexPoint {
    IndexPoint {
        id,
        score,
        payload: e.payload.clone(),
        vector: if with_vectors { e.vector.clone() } else { None },
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn collection(&self) -> &str {
        &self.name
    }

    async fn collection_exists(&self) -> Result<bool, IndexError> {
        Ok(self.lock()?.is_some())
    }

    async fn create_collection(&self, space: &VectorSpace) -> Result<(), IndexError> {
        let mut guard = self.lock()?;
        if guard.is_some() {
            return Err(IndexError::Rejected(format!(
                "collection '{}' already exists",
                self.name
            )));
        }
        *guard = Some(Collection {
            space: space.clone(),
            points: BTreeMap::new(),
            payload_indexes: BTreeSet::new(),
        });
        debug!("MemoryIndex: created '{}' size={}", self.name, space.size);
        Ok(())
    }

    async fn create_payload_index(&self, field: &str) -> Result<(), IndexError> {
        let mut guard = self.lock()?;
        let coll = guard.as_mut().ok_or_else(|| self.missing())?;
        if !coll.payload_indexes.insert(field.to_string()) {
            return Err(IndexError::Rejected(format!(
                "payload index '{field}' already exists"
            )));
        }
        Ok(())
    }

    async fn upsert(&self, points: &[IndexedPoint]) -> Result<usize, IndexError> {
        let mut guard = self.lock()?;
        let coll = guard.as_mut().ok_or_else(|| self.missing())?;
        // Validate the whole batch first so a rejected batch writes nothing.
        for p in points {
            check_dim(p.vector.len(), coll.space.size)?;
        }
        for p in points {
            coll.points.insert(
                p.id,
                Entry {
                    vector: Some(p.vector.clone()),
                    payload: StoredPayload {
                        document: Some(p.payload.document.clone()),
                        latitude: Some(p.payload.latitude),
                        longitude: Some(p.payload.longitude),
                    },
                },
            );
        }
        Ok(points.len())
    }

    async fn query_by_vector(
        &self,
        vector: &[f32],
        limit: usize,
        with_vectors: bool,
    ) -> Result<Vec<IndexPoint>, IndexError> {
        let guard = self.lock()?;
        let coll = guard.as_ref().ok_or_else(|| self.missing())?;
        check_dim(vector.len(), coll.space.size)?;

        let mut scored: Vec<(u64, f32)> = coll
            .points
            .iter()
            .filter_map(|(id, e)| {
                e.vector
                    .as_ref()
                    .map(|v| (*id, similarity(coll.space.distance, vector, v)))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(id, s)| to_point(id, &coll.points[&id], Some(s), with_vectors))
            .collect())
    }

    async fn scroll(
        &self,
        limit: usize,
        cursor: Option<u64>,
        filter: Option<&GeoBox>,
        with_vectors: bool,
    ) -> Result<ScrollPage, IndexError> {
        let guard = self.lock()?;
        let coll = guard.as_ref().ok_or_else(|| self.missing())?;

        let mut matching = coll
            .points
            .range(cursor.unwrap_or(0)..)
            .filter(|(_, e)| match filter {
                None => true,
                Some(b) => e
                    .payload
                    .coordinates()
                    .map(|(lat, lon)| b.contains(lat, lon))
                    .unwrap_or(false),
            });

        let mut points = Vec::with_capacity(limit.min(coll.points.len()));
        for (id, e) in matching.by_ref().take(limit) {
            points.push(to_point(*id, e, None, with_vectors));
        }
        let next = matching.next().map(|(id, _)| *id);
        Ok(ScrollPage { points, next })
    }

    async fn retrieve(&self, ids: &[u64]) -> Result<Vec<IndexPoint>, IndexError> {
        let guard = self.lock()?;
        let coll = guard.as_ref().ok_or_else(|| self.missing())?;
        Ok(ids
            .iter()
            .filter_map(|id| coll.points.get(id).map(|e| to_point(*id, e, None, true)))
            .collect())
    }

    async fn count(&self) -> Result<u64, IndexError> {
        let guard = self.lock()?;
        let coll = guard.as_ref().ok_or_else(|| self.missing())?;
        Ok(coll.points.len() as u64)
    }
}
