//! Collection statistics.

use std::collections::HashSet;

use tracing::debug;

use crate::errors::{GeoError, IndexError};
use crate::index::VectorIndex;
use crate::retry::with_timeout;

/// Page size used when enumerating the whole collection.
const PAGE: usize = 10_000;

/// Number of points stored in the collection.
pub async fn total_points(
    index: &dyn VectorIndex,
    timeout: Option<std::time::Duration>,
) -> Result<u64, GeoError> {
    Ok(with_timeout(timeout, index.count(), IndexError::Timeout).await?)
}

/// Number of distinct `(latitude, longitude)` pairs, found by scrolling every point.
///
/// Points without both coordinates are not counted.
pub async fn unique_locations(
    index: &dyn VectorIndex,
    timeout: Option<std::time::Duration>,
) -> Result<usize, GeoError> {
    let mut seen: HashSet<(u64, u64)> = HashSet::new();
    let mut cursor = None;
    let mut pages = 0usize;
    loop {
        let page = with_timeout(
            timeout,
            index.scroll(PAGE, cursor, None, false),
            IndexError::Timeout,
        )
        .await?;
        pages += 1;
        for p in &page.points {
            if let Some((lat, lon)) = p.payload.coordinates() {
                // -0.0 and 0.0 are the same location.
                seen.insert(((lat + 0.0).to_bits(), (lon + 0.0).to_bits()));
            }
        }
        match page.next {
            Some(next) if !page.points.is_empty() => cursor = Some(next),
            _ => break,
        }
    }
    debug!(
        "unique_locations: {} locations over {} pages in '{}'",
        seen.len(),
        pages,
        index.collection()
    );
    Ok(seen.len())
}
