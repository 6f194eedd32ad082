//! Hybrid retrieval: vector similarity combined with great-circle filtering.
//!
//! With query text, the text is embedded and the candidate pool is filtered
//! by distance (ranked list). Without text, the pool comes from scrolling the
//! collection, the nearest points are returned together with points similar
//! to the centroid of their vectors.

use std::time::Duration;

use tracing::{debug, info, trace};

use crate::config::SearchConfig;
use crate::embed::EmbeddingsProvider;
use crate::errors::{EmbedError, GeoError, IndexError};
use crate::geo::{GeoBox, haversine_km};
use crate::index::{IndexPoint, VectorIndex};
use crate::record::{GeoQuery, HybridResult, SearchResult};
use crate::retry::with_timeout;

/// Largest page requested from the index while gathering scroll candidates.
const SCROLL_PAGE: usize = 256;

/// Read-only hybrid searcher over one collection.
pub struct HybridRetriever<'a> {
    index: &'a dyn VectorIndex,
    embedder: &'a dyn EmbeddingsProvider,
    bbox_prefilter: bool,
    timeout: Option<Duration>,
}

impl<'a> HybridRetriever<'a> {
    pub fn new(index: &'a dyn VectorIndex, embedder: &'a dyn EmbeddingsProvider) -> Self {
        Self {
            index,
            embedder,
            bbox_prefilter: SearchConfig::default().bbox_prefilter,
            timeout: None,
        }
    }

    /// Enables or disables the coarse bounding-box filter of the location path.
    pub fn with_bbox_prefilter(mut self, enabled: bool) -> Self {
        self.bbox_prefilter = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs the query. Blank or absent text selects the location path.
    ///
    /// An empty result (no point within the radius) is not an error.
    ///
    /// # Errors
    /// `GeoError::InvalidQuery` for bad parameters, otherwise embedding or
    /// index failures.
    pub async fn search(&self, query: &GeoQuery) -> Result<HybridResult, GeoError> {
        query.validate()?;
        let result = match query.text() {
            Some(text) => self.ranked_by_text(query, text).await?,
            None => self.nearest_and_similar(query).await?,
        };
        info!(
            target: "geo_store::search",
            collection = self.index.collection(),
            lat = query.latitude,
            lon = query.longitude,
            radius_km = query.radius_km,
            documents = result.documents().len(),
            "search finished"
        );
        Ok(result)
    }

    async fn ranked_by_text(&self, q: &GeoQuery, text: &str) -> Result<HybridResult, GeoError> {
        debug!(target: "geo_store::search", candidates = q.candidates, "text path");
        let vector = self.embed_query(text).await?;
        let hits = with_timeout(
            self.timeout,
            self.index.query_by_vector(&vector, q.candidates, false),
            IndexError::Timeout,
        )
        .await?;
        trace!("{} vector candidates before distance filter", hits.len());

        let mut within: Vec<(IndexPoint, f64)> = hits
            .into_iter()
            .filter_map(|p| {
                let d = distance_to(&p, q)?;
                (d <= q.radius_km).then_some((p, d))
            })
            .collect();
        within.sort_by(|(a, da), (b, db)| {
            score_of(b)
                .total_cmp(&score_of(a))
                .then_with(|| da.total_cmp(db))
        });
        within.truncate(q.top_k);

        Ok(HybridResult::RankedList {
            results: within
                .into_iter()
                .map(|(p, d)| to_result(p, Some(d)))
                .collect(),
        })
    }

    async fn nearest_and_similar(&self, q: &GeoQuery) -> Result<HybridResult, GeoError> {
        let bbox = if self.bbox_prefilter {
            GeoBox::around(q.latitude, q.longitude, q.radius_km)
        } else {
            None
        };
        debug!(
            target: "geo_store::search",
            candidates = q.candidates,
            bbox = bbox.is_some(),
            "location path"
        );

        let pool = self.scroll_candidates(q.candidates, bbox.as_ref()).await?;
        let mut within: Vec<(IndexPoint, f64)> = pool
            .into_iter()
            .filter_map(|p| {
                let d = distance_to(&p, q)?;
                (d <= q.radius_km).then_some((p, d))
            })
            .collect();
        within.sort_by(|(a, da), (b, db)| da.total_cmp(db).then_with(|| a.id.cmp(&b.id)));
        within.truncate(q.top_k);

        let centroid_vec = centroid(within.iter().filter_map(|(p, _)| p.vector.as_deref()));
        let nearest_by_location: Vec<SearchResult> = within
            .into_iter()
            .map(|(mut p, d)| {
                p.score = None;
                to_result(p, Some(d))
            })
            .collect();

        let similar_texts_by_vector = match centroid_vec {
            Some(c) => self.similar_to(&c, q).await?,
            None => Vec::new(),
        };

        Ok(HybridResult::LocationCentroidResult {
            nearest_by_location,
            similar_texts_by_vector,
        })
    }

    /// Pages through the collection until `want` points are gathered or it ends.
    async fn scroll_candidates(
        &self,
        want: usize,
        bbox: Option<&GeoBox>,
    ) -> Result<Vec<IndexPoint>, GeoError> {
        let mut pool: Vec<IndexPoint> = Vec::with_capacity(want.min(SCROLL_PAGE * 4));
        let mut cursor = None;
        while pool.len() < want {
            let limit = (want - pool.len()).min(SCROLL_PAGE);
            let page = with_timeout(
                self.timeout,
                self.index.scroll(limit, cursor, bbox, true),
                IndexError::Timeout,
            )
            .await?;
            let got = page.points.len();
            pool.extend(page.points);
            match page.next {
                Some(next) if got > 0 => cursor = Some(next),
                _ => break,
            }
        }
        pool.truncate(want);
        trace!("{} scroll candidates gathered", pool.len());
        Ok(pool)
    }

    /// Points closest to `centroid`; hits with coordinates must lie within the radius.
    async fn similar_to(&self, centroid: &[f32], q: &GeoQuery) -> Result<Vec<SearchResult>, GeoError> {
        let hits = with_timeout(
            self.timeout,
            self.index.query_by_vector(centroid, q.candidates, false),
            IndexError::Timeout,
        )
        .await?;

        Ok(hits
            .into_iter()
            .filter_map(|p| match distance_to(&p, q) {
                Some(d) if d > q.radius_km => None,
                d => Some(to_result(p, d)),
            })
            .take(q.top_k)
            .collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, GeoError> {
        let vectors = with_timeout(
            self.timeout,
            self.embedder.embed(&[text.to_string()]),
            EmbedError::Timeout,
        )
        .await?;
        let got = vectors.len();
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::CountMismatch { got, want: 1 }.into())
    }
}

/// Component-wise mean of `vectors`.
///
/// Vectors whose length differs from the first one are ignored. Returns `None`
/// when there is nothing to average.
pub fn centroid<'v>(vectors: impl IntoIterator<Item = &'v [f32]>) -> Option<Vec<f32>> {
    let mut sum: Vec<f64> = Vec::new();
    let mut n = 0usize;
    for v in vectors {
        if n == 0 {
            if v.is_empty() {
                continue;
            }
            sum = vec![0.0; v.len()];
        } else if v.len() != sum.len() {
            continue;
        }
        for (s, x) in sum.iter_mut().zip(v) {
            *s += f64::from(*x);
        }
        n += 1;
    }
    (n > 0).then(|| sum.into_iter().map(|s| (s / n as f64) as f32).collect())
}

fn distance_to(p: &IndexPoint, q: &GeoQuery) -> Option<f64> {
    let (lat, lon) = p.payload.coordinates()?;
    Some(haversine_km(q.latitude, q.longitude, lat, lon))
}

fn score_of(p: &IndexPoint) -> f32 {
    p.score.unwrap_or(f32::NEG_INFINITY)
}

fn to_result(p: IndexPoint, distance_km: Option<f64>) -> SearchResult {
    SearchResult {
        document: p.payload.document.unwrap_or_default(),
        latitude: p.payload.latitude,
        longitude: p.payload.longitude,
        score: p.score,
        distance_km,
    }
}
