//! Tile feature selection: bounding-box intersection, zoom visibility, and
//! draw ordering.
use futures::TryStreamExt;
use once_cell::sync::Lazy;
use sqlx::query;

use crate::error::Result;
use crate::geometry::{visibility_threshold, BoundingBox};
use crate::store::{FeatureStore, IndexEntry, INDEX_TABLE, RTREE_TABLE};

/// Default cap on the number of features drawn into one tile.
pub const DEFAULT_QUERY_LIMIT: u32 = 1000;

// Bind order: bbox (min_lat, max_lat, min_lon, max_lon) twice, once for the
// R*Tree prune and once for the exact test, then zoom², then the limit.
// Ordering by area puts the largest features first so that finer detail is
// painted over them; `seq` keeps ties in insertion order.
static SELECT_SQL: Lazy<String> = Lazy::new(|| {
    format!(
        "SELECT f.id AS id, f.min_lat AS min_lat, f.max_lat AS max_lat,
                f.min_lon AS min_lon, f.max_lon AS max_lon, f.tags AS tags
         FROM {rtree} AS r
         JOIN {index} AS f ON f.id = r.id
         WHERE r.min_lat <= ?2 AND r.max_lat >= ?1 AND r.min_lon <= ?4 AND r.max_lon >= ?3
           AND f.min_lat <= ?2 AND f.max_lat >= ?1 AND f.min_lon <= ?4 AND f.max_lon >= ?3
           AND (f.max_lat - f.min_lat) * (f.max_lon - f.min_lon) <= ?5
         ORDER BY (f.max_lat - f.min_lat) * (f.max_lon - f.min_lon) DESC, f.seq ASC
         LIMIT ?6",
        rtree = RTREE_TABLE,
        index = INDEX_TABLE
    )
});

impl FeatureStore {
    /// Returns the features whose box intersects `bounds` and that are visible
    /// at `zoom`, largest box first, at most `limit` of them.
    pub async fn query(
        &self,
        bounds: &BoundingBox,
        zoom: u8,
        limit: u32,
    ) -> Result<Vec<IndexEntry>> {
        let mut rows = query(&SELECT_SQL)
            .bind(bounds.min_lat)
            .bind(bounds.max_lat)
            .bind(bounds.min_lon)
            .bind(bounds.max_lon)
            .bind(visibility_threshold(zoom))
            .bind(i64::from(limit))
            .fetch(&self.pool);

        let mut features = Vec::new();
        while let Some(row) = rows.try_next().await? {
            features.push(IndexEntry::from_row(&row)?);
        }

        Ok(features)
    }
}
