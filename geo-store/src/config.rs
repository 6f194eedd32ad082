//! Runtime configuration loaded from environment variables.
//!
//! Environment variables used (all optional):
//! - `QDRANT_URL` (default: "http://localhost:6334"), `QDRANT_API_KEY`
//! - `GEO_COLLECTION` (default: "tweets_collection")
//! - `GEO_SOURCE_PATH` (default: "datasets/text_coordinates_regions.jsonl")
//! - `GEO_CHECKPOINT_PATH` (default: ".upload_checkpoint.json")
//! - `GEO_CHUNK_SIZE` (default: 500), `GEO_RESUME` (default: true)
//! - `GEO_COORDINATE_ORDER` ("lon_lat" | "lat_lon" | "auto"; default: "lon_lat")
//! - `UPLOAD_MAX_ATTEMPTS` (default: 5), `EMBED_MAX_ATTEMPTS` (default: 1)
//! - `RETRY_BASE_MS` (default: 1000), `CALL_TIMEOUT_SECS` (default: 60, 0 = off)
//! - `EMBEDDING_PROVIDER` ("ollama" | "hashing"), `EMBEDDING_MODEL`, `OLLAMA_URL`, `EMBEDDING_DIM`
//! - `SEARCH_RADIUS_KM` (50), `SEARCH_TOP_K` (5), `SEARCH_CANDIDATES` (1000),
//!   `SEARCH_BBOX_PREFILTER` (true)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::GeoError;

/// Distance function used for the vector space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceKind {
    /// Cosine similarity (the only metric the ingestion pipeline creates).
    Cosine,
    /// Dot product.
    Dot,
    /// Euclidean distance (L2).
    Euclid,
}

/// Describes the vector space of the collection.
#[derive(Clone, Debug)]
pub struct VectorSpace {
    /// Dimensionality of vectors.
    pub size: usize,
    /// Distance function.
    pub distance: DistanceKind,
}

/// Declared order of the two values in a source `coordinates` array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateOrder {
    /// `[longitude, latitude]` (GeoJSON order).
    LonLat,
    /// `[latitude, longitude]`.
    LatLon,
    /// Legacy heuristic: read as lon/lat, fall back to lat/lon when the first
    /// reading is out of range. Only for sources known to be inconsistent.
    Auto,
}

impl FromStr for CoordinateOrder {
    type Err = GeoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "lon_lat" | "lonlat" | "geojson" => Ok(CoordinateOrder::LonLat),
            "lat_lon" | "latlon" => Ok(CoordinateOrder::LatLon),
            "auto" => Ok(CoordinateOrder::Auto),
            other => Err(GeoError::Config(format!(
                "unknown coordinate order '{other}' (expected lon_lat, lat_lon or auto)"
            ))),
        }
    }
}

/// Which embedding backend to construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmbeddingBackend {
    /// Remote Ollama server.
    Ollama,
    /// Deterministic offline hashing encoder.
    Hashing,
}

impl FromStr for EmbeddingBackend {
    type Err = GeoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(EmbeddingBackend::Ollama),
            "hashing" | "hash" | "offline" => Ok(EmbeddingBackend::Hashing),
            other => Err(GeoError::Config(format!(
                "unknown embedding provider '{other}'"
            ))),
        }
    }
}

/// Bounded retry with exponential backoff and jitter.
///
/// The delay before retry `n` (1-based) is `base * 2^n + base * U(0,1)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. `1` disables retry.
    pub max_attempts: u32,
    /// Backoff unit.
    pub base: Duration,
}

impl RetryPolicy {
    /// Five attempts with a one second unit.
    pub fn upload_default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_secs(1),
        }
    }

    /// A single attempt: failures propagate immediately.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base: Duration::from_secs(1),
        }
    }
}

/// Embedding backend settings.
#[derive(Clone, Debug)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    /// Model identifier (e.g., "bge-m3").
    pub model: String,
    /// Base URL of the Ollama server.
    pub endpoint: String,
    /// Dimension of the offline hashing encoder.
    pub dim: usize,
}

/// Defaults for the hybrid retriever.
#[derive(Clone, Debug)]
pub struct SearchConfig {
    pub radius_km: f64,
    pub top_k: usize,
    pub candidates: usize,
    /// Pre-narrow the no-text path with a coarse bounding box on stored coordinates.
    pub bbox_prefilter: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            radius_km: 50.0,
            top_k: 5,
            candidates: 1000,
            bbox_prefilter: true,
        }
    }
}

/// Configuration for ingestion and retrieval.
#[derive(Clone, Debug)]
pub struct GeoConfig {
    /// Qdrant gRPC endpoint, e.g. `http://localhost:6334`.
    pub qdrant_url: String,
    /// Optional API key for Qdrant Cloud.
    pub qdrant_api_key: Option<String>,
    /// Target collection name.
    pub collection: String,
    /// NDJSON source of records.
    pub source_path: PathBuf,
    /// Checkpoint document path.
    pub checkpoint_path: PathBuf,
    /// Records per chunk.
    pub chunk_size: usize,
    /// Resume from the stored checkpoint.
    pub resume: bool,
    pub coordinate_order: CoordinateOrder,
    pub upload_retry: RetryPolicy,
    pub embed_retry: RetryPolicy,
    /// Timeout applied to every external call.
    pub call_timeout: Option<Duration>,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
}

impl GeoConfig {
    /// Creates a sane default config for a given collection name and Qdrant endpoint.
    pub fn new_default(url: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            qdrant_url: url.into(),
            qdrant_api_key: None,
            collection: collection.into(),
            source_path: PathBuf::from("datasets/text_coordinates_regions.jsonl"),
            checkpoint_path: PathBuf::from(".upload_checkpoint.json"),
            chunk_size: 500,
            resume: true,
            coordinate_order: CoordinateOrder::LonLat,
            upload_retry: RetryPolicy::upload_default(),
            embed_retry: RetryPolicy::no_retry(),
            call_timeout: Some(Duration::from_secs(60)),
            embedding: EmbeddingConfig {
                backend: EmbeddingBackend::Ollama,
                model: "bge-m3".to_string(),
                endpoint: "http://localhost:11434".to_string(),
                dim: 384,
            },
            search: SearchConfig::default(),
        }
    }

    /// Build configuration from environment variables.
    ///
    /// # Errors
    /// Returns `GeoError::Config` when a variable is present but unparsable,
    /// or when the resulting values fail [`GeoConfig::validate`].
    pub fn from_env() -> Result<Self, GeoError> {
        let mut cfg = Self::new_default(
            env_or("QDRANT_URL", "http://localhost:6334"),
            env_or("GEO_COLLECTION", "tweets_collection"),
        );

        cfg.qdrant_api_key = std::env::var("QDRANT_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        if let Ok(p) = std::env::var("GEO_SOURCE_PATH") {
            cfg.source_path = PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("GEO_CHECKPOINT_PATH") {
            cfg.checkpoint_path = PathBuf::from(p);
        }
        cfg.chunk_size = parse_env("GEO_CHUNK_SIZE", cfg.chunk_size)?;
        cfg.resume = parse_env("GEO_RESUME", cfg.resume)?;
        cfg.coordinate_order = parse_env("GEO_COORDINATE_ORDER", cfg.coordinate_order)?;

        let base = Duration::from_millis(parse_env("RETRY_BASE_MS", 1000u64)?);
        cfg.upload_retry = RetryPolicy {
            max_attempts: parse_env("UPLOAD_MAX_ATTEMPTS", 5u32)?,
            base,
        };
        cfg.embed_retry = RetryPolicy {
            max_attempts: parse_env("EMBED_MAX_ATTEMPTS", 1u32)?,
            base,
        };
        cfg.call_timeout = match parse_env("CALL_TIMEOUT_SECS", 60u64)? {
            0 => None,
            s => Some(Duration::from_secs(s)),
        };

        cfg.embedding = EmbeddingConfig {
            backend: parse_env("EMBEDDING_PROVIDER", cfg.embedding.backend)?,
            model: env_or("EMBEDDING_MODEL", &cfg.embedding.model),
            endpoint: env_or("OLLAMA_URL", &cfg.embedding.endpoint),
            dim: parse_env("EMBEDDING_DIM", cfg.embedding.dim)?,
        };

        cfg.search = SearchConfig {
            radius_km: parse_env("SEARCH_RADIUS_KM", cfg.search.radius_km)?,
            top_k: parse_env("SEARCH_TOP_K", cfg.search.top_k)?,
            candidates: parse_env("SEARCH_CANDIDATES", cfg.search.candidates)?,
            bbox_prefilter: parse_env("SEARCH_BBOX_PREFILTER", cfg.search.bbox_prefilter)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validates config values.
    pub fn validate(&self) -> Result<(), GeoError> {
        if self.qdrant_url.trim().is_empty() {
            return Err(GeoError::Config("qdrant_url is empty".into()));
        }
        if self.collection.trim().is_empty() {
            return Err(GeoError::Config("collection is empty".into()));
        }
        if self.chunk_size == 0 {
            return Err(GeoError::Config("chunk_size must be > 0".into()));
        }
        if self.upload_retry.max_attempts == 0 || self.embed_retry.max_attempts == 0 {
            return Err(GeoError::Config("retry max_attempts must be >= 1".into()));
        }
        if self.embedding.dim == 0 {
            return Err(GeoError::Config("EMBEDDING_DIM must be > 0".into()));
        }
        if !(self.search.radius_km.is_finite() && self.search.radius_km > 0.0) {
            return Err(GeoError::Config("SEARCH_RADIUS_KM must be > 0".into()));
        }
        if self.search.top_k == 0 || self.search.candidates == 0 {
            return Err(GeoError::Config(
                "SEARCH_TOP_K and SEARCH_CANDIDATES must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse `key` when present; a present but malformed value is an error.
fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, GeoError> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map_err(|_| GeoError::Config(format!("failed to parse env variable: {key} = '{v}'"))),
        Err(_) => Ok(default),
    }
}
