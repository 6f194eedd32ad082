//! Core data models used by the library.

use serde::{Deserialize, Serialize};

use crate::config::SearchConfig;
use crate::errors::GeoError;

/// A validated source record.
///
/// `position` is the 1-based physical line number in the source, so it is
/// stable across resumes even when earlier lines were skipped.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub position: u64,
    pub text: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Payload stored next to each vector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointPayload {
    pub document: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl From<&Record> for PointPayload {
    fn from(r: &Record) -> Self {
        Self {
            document: r.text.clone(),
            latitude: r.latitude,
            longitude: r.longitude,
        }
    }
}

/// A point as written by the Index Writer. `id` is the record position.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexedPoint {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

/// A single retrieval result. Never persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub document: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

/// Result of a hybrid search; the variant tells which path produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum HybridResult {
    /// Text query: vector hits inside the radius, best score first.
    RankedList { results: Vec<SearchResult> },
    /// No text: nearest points by distance, plus points similar to their centroid.
    #[serde(rename = "location_centroid")]
    LocationCentroidResult {
        nearest_by_location: Vec<SearchResult>,
        similar_texts_by_vector: Vec<SearchResult>,
    },
}

impl HybridResult {
    /// Whether no result of any kind was found.
    pub fn is_empty(&self) -> bool {
        match self {
            HybridResult::RankedList { results } => results.is_empty(),
            HybridResult::LocationCentroidResult {
                nearest_by_location,
                similar_texts_by_vector,
            } => nearest_by_location.is_empty() && similar_texts_by_vector.is_empty(),
        }
    }

    /// Document texts in presentation order (nearest before similar).
    pub fn documents(&self) -> Vec<&str> {
        match self {
            HybridResult::RankedList { results } => {
                results.iter().map(|r| r.document.as_str()).collect()
            }
            HybridResult::LocationCentroidResult {
                nearest_by_location,
                similar_texts_by_vector,
            } => nearest_by_location
                .iter()
                .chain(similar_texts_by_vector.iter())
                .map(|r| r.document.as_str())
                .collect(),
        }
    }

    /// Context handed to the summarization service: one document per line.
    pub fn context_text(&self) -> String {
        self.documents().join("\n")
    }
}

/// Query parameters for hybrid retrieval.
#[derive(Clone, Debug)]
pub struct GeoQuery {
    pub latitude: f64,
    pub longitude: f64,
    /// Optional query text; blank text selects the location path.
    pub text: Option<String>,
    pub radius_km: f64,
    pub top_k: usize,
    /// Candidate pool fetched before the distance filter.
    pub candidates: usize,
}

impl GeoQuery {
    /// A query around a point using the configured search defaults.
    pub fn around(latitude: f64, longitude: f64, defaults: &SearchConfig) -> Self {
        Self {
            latitude,
            longitude,
            text: None,
            radius_km: defaults.radius_km,
            top_k: defaults.top_k,
            candidates: defaults.candidates,
        }
    }

    /// Sets the query text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Non-blank query text, if any.
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    /// Validates the query point and limits.
    pub fn validate(&self) -> Result<(), GeoError> {
        if !crate::geo::is_valid_point(self.latitude, self.longitude) {
            return Err(GeoError::InvalidQuery(format!(
                "query point ({}, {}) is out of range",
                self.latitude, self.longitude
            )));
        }
        if !(self.radius_km.is_finite() && self.radius_km > 0.0) {
            return Err(GeoError::InvalidQuery("radius_km must be > 0".into()));
        }
        if self.top_k == 0 {
            return Err(GeoError::InvalidQuery("top_k must be >= 1".into()));
        }
        if self.candidates == 0 {
            return Err(GeoError::InvalidQuery("candidates must be >= 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(doc: &str) -> SearchResult {
        SearchResult {
            document: doc.to_string(),
            latitude: Some(1.0),
            longitude: Some(2.0),
            score: None,
            distance_km: Some(0.5),
        }
    }

    #[test]
    fn blank_text_counts_as_absent() {
        let q = GeoQuery::around(40.0, -73.0, &SearchConfig::default()).with_text("   ");
        assert_eq!(q.text(), None);
        let q = q.with_text(" joy ");
        assert_eq!(q.text(), Some("joy"));
    }

    #[test]
    fn documents_list_nearest_before_similar() {
        let r = HybridResult::LocationCentroidResult {
            nearest_by_location: vec![hit("a"), hit("b")],
            similar_texts_by_vector: vec![hit("c")],
        };
        assert_eq!(r.documents(), vec!["a", "b", "c"]);
        assert_eq!(r.context_text(), "a\nb\nc");
    }

    #[test]
    fn serialized_shape_is_tagged() {
        let r = HybridResult::RankedList {
            results: vec![hit("a")],
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["mode"], "ranked_list");
        assert_eq!(v["results"][0]["document"], "a");
        assert!(v["results"][0].get("score").is_none());
    }

    #[test]
    fn out_of_range_query_is_rejected() {
        let q = GeoQuery::around(95.0, 0.0, &SearchConfig::default());
        assert!(matches!(q.validate(), Err(GeoError::InvalidQuery(_))));
    }
}
