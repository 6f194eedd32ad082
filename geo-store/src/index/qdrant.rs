//! Thin adapter around `qdrant-client` to isolate API usage.
//!
//! This facade concentrates all Qdrant interactions behind [`VectorIndex`],
//! hiding away the verbose builder pattern and keeping the rest of the crate
//! decoupled from `qdrant-client`. Point ids are the integer record positions.

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CountPointsBuilder, CreateCollectionBuilder, CreateFieldIndexCollectionBuilder,
    Distance, FieldType, Filter, GetPointsBuilder, PointId, PointStruct, Range,
    ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, Value as QValue,
    VectorParamsBuilder, VectorsOutput, point_id::PointIdOptions, vectors_output,
};
use qdrant_client::{Payload, Qdrant};
use tracing::{debug, info};

use crate::config::{DistanceKind, GeoConfig, VectorSpace};
use crate::errors::{GeoError, IndexError};
use crate::geo::GeoBox;
use crate::index::{IndexPoint, ScrollPage, StoredPayload, VectorIndex};
use crate::record::IndexedPoint;

/// A facade over the Qdrant client bound to one collection.
pub struct QdrantIndex {
    client: Qdrant,
    collection: String,
}

impl QdrantIndex {
    /// Creates a new facade from the given configuration.
    ///
    /// Uses the builder-based API of `qdrant-client` and supports optional
    /// API key authentication and a per-request timeout.
    pub fn new(cfg: &GeoConfig) -> Result<Self, GeoError> {
        cfg.validate()?;

        let mut builder = Qdrant::from_url(&cfg.qdrant_url);
        if let Some(key) = &cfg.qdrant_api_key {
            builder = builder.api_key(key.clone());
        }
        if let Some(t) = cfg.call_timeout {
            builder = builder.timeout(t);
        }
        let client = builder
            .build()
            .map_err(|e| GeoError::Config(format!("qdrant client build: {e}")))?;

        Ok(Self {
            client,
            collection: cfg.collection.clone(),
        })
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn collection_exists(&self) -> Result<bool, IndexError> {
        Ok(self.client.collection_exists(&self.collection).await?)
    }

    async fn create_collection(&self, space: &VectorSpace) -> Result<(), IndexError> {
        info!(
            "Creating collection '{}' with size={} distance={:?}",
            self.collection, space.size, space.distance
        );

        let distance = match space.distance {
            DistanceKind::Cosine => Distance::Cosine,
            DistanceKind::Dot => Distance::Dot,
            DistanceKind::Euclid => Distance::Euclid,
        };

        self.client
            .create_collection(
                CreateCollectionBuilder::new(&self.collection)
                    .vectors_config(VectorParamsBuilder::new(space.size as u64, distance)),
            )
            .await?;

        info!("Collection '{}' created successfully", self.collection);
        Ok(())
    }

    async fn create_payload_index(&self, field: &str) -> Result<(), IndexError> {
        self.client
            .create_field_index(
                CreateFieldIndexCollectionBuilder::new(&self.collection, field, FieldType::Float)
                    .wait(true),
            )
            .await?;
        debug!("Payload index '{field}' ready on '{}'", self.collection);
        Ok(())
    }

    async fn upsert(&self, points: &[IndexedPoint]) -> Result<usize, IndexError> {
        if points.is_empty() {
            debug!("No points provided for upsert");
            return Ok(0);
        }

        let mut structs = Vec::with_capacity(points.len());
        for p in points {
            let json = serde_json::to_value(&p.payload)
                .map_err(|e| IndexError::Rejected(format!("payload encode: {e}")))?;
            let payload = Payload::try_from(json)
                .map_err(|e| IndexError::Rejected(format!("payload convert: {e}")))?;
            structs.push(PointStruct::new(p.id, p.vector.clone(), payload));
        }

        debug!(
            "Upserting {} points into collection '{}'",
            structs.len(),
            self.collection
        );
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, structs).wait(true))
            .await?;

        Ok(points.len())
    }

    async fn query_by_vector(
        &self,
        vector: &[f32],
        limit: usize,
        with_vectors: bool,
    ) -> Result<Vec<IndexPoint>, IndexError> {
        let res = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, vector.to_vec(), limit as u64)
                    .with_payload(true)
                    .with_vectors(with_vectors),
            )
            .await?;

        let out: Vec<IndexPoint> = res
            .result
            .into_iter()
            .filter_map(|sp| {
                Some(IndexPoint {
                    id: numeric_id(sp.id)?,
                    score: Some(sp.score),
                    payload: stored_payload(&sp.payload),
                    vector: dense_vector(sp.vectors),
                })
            })
            .collect();

        debug!("Search completed: {} hits returned", out.len());
        Ok(out)
    }

    async fn scroll(
        &self,
        limit: usize,
        cursor: Option<u64>,
        filter: Option<&GeoBox>,
        with_vectors: bool,
    ) -> Result<ScrollPage, IndexError> {
        let mut builder = ScrollPointsBuilder::new(&self.collection)
            .limit(limit.min(u32::MAX as usize) as u32)
            .with_payload(true)
            .with_vectors(with_vectors);
        if let Some(c) = cursor {
            builder = builder.offset(PointId::from(c));
        }
        if let Some(b) = filter {
            builder = builder.filter(box_filter(b));
        }

        let res = self.client.scroll(builder).await?;
        let points = res
            .result
            .into_iter()
            .filter_map(|rp| {
                Some(IndexPoint {
                    id: numeric_id(rp.id)?,
                    score: None,
                    payload: stored_payload(&rp.payload),
                    vector: dense_vector(rp.vectors),
                })
            })
            .collect();

        Ok(ScrollPage {
            points,
            next: numeric_id(res.next_page_offset),
        })
    }

    async fn retrieve(&self, ids: &[u64]) -> Result<Vec<IndexPoint>, IndexError> {
        let pids: Vec<PointId> = ids.iter().map(|&i| PointId::from(i)).collect();
        let res = self
            .client
            .get_points(
                GetPointsBuilder::new(&self.collection, pids)
                    .with_payload(true)
                    .with_vectors(true),
            )
            .await?;

        Ok(res
            .result
            .into_iter()
            .filter_map(|rp| {
                Some(IndexPoint {
                    id: numeric_id(rp.id)?,
                    score: None,
                    payload: stored_payload(&rp.payload),
                    vector: dense_vector(rp.vectors),
                })
            })
            .collect())
    }

    async fn count(&self) -> Result<u64, IndexError> {
        let res = self
            .client
            .count(CountPointsBuilder::new(&self.collection).exact(true))
            .await?;
        Ok(res.result.map(|r| r.count).unwrap_or(0))
    }
}

/// Range conditions on the stored `latitude`/`longitude` payload fields.
fn box_filter(b: &GeoBox) -> Filter {
    Filter::must([
        Condition::range(
            "latitude",
            Range {
                gte: Some(b.min_lat),
                lte: Some(b.max_lat),
                ..Default::default()
            },
        ),
        Condition::range(
            "longitude",
            Range {
                gte: Some(b.min_lon),
                lte: Some(b.max_lon),
                ..Default::default()
            },
        ),
    ])
}

/// Extracts an integer point id; UUID ids are not produced by this crate.
fn numeric_id(id: Option<PointId>) -> Option<u64> {
    match id?.point_id_options? {
        PointIdOptions::Num(n) => Some(n),
        PointIdOptions::Uuid(_) => None,
    }
}

/// Reads the known payload fields; unexpected types map to `None`.
fn stored_payload(p: &HashMap<String, QValue>) -> StoredPayload {
    let number = |key: &str| {
        p.get(key).and_then(|v| match v.clone().into_json() {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
    };
    StoredPayload {
        document: p
            .get("document")
            .and_then(|v| v.clone().into_json().as_str().map(str::to_string)),
        latitude: number("latitude"),
        longitude: number("longitude"),
    }
}

#[allow(deprecated)]
fn dense_vector(v: Option<VectorsOutput>) -> Option<Vec<f32>> {
    match v?.vectors_options? {
        vectors_output::VectorsOptions::Vector(out) => Some(out.data),
        _ => None,
    }
}
