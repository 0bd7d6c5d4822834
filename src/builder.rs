//! Single-pass dataset builder.
//!
//! Features are written in batches, one transaction per batch, and each
//! feature inside its own savepoint. A failing feature rolls back only its own
//! rows; everything reported as stored before it is committed.
use futures::{Stream, TryStreamExt};
use sqlx::sqlite::SqliteConnection;
use sqlx::{Connection, Sqlite, Transaction};
use tracing::{debug, info, warn};

use crate::config::BuilderConfig;
use crate::error::{Error, Result};
use crate::geometry::{BoundingBox, Coordinate, Tags};
use crate::store::FeatureStore;

/// A line feature as read from a source extract.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceFeature {
    pub id: i64,
    pub coordinates: Vec<Coordinate>,
    pub tags: Tags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// At least one coordinate is the unresolved-position marker.
    UnresolvedPosition,
    EmptyGeometry,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored,
    Dropped(DropReason),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub stored: u64,
    pub dropped_unresolved: u64,
    pub dropped_empty: u64,
}

impl BuildSummary {
    pub fn seen(&self) -> u64 {
        self.stored + self.dropped_unresolved + self.dropped_empty
    }
}

pub struct DatasetBuilder {
    store: FeatureStore,
    batch_size: usize,
    progress_interval: u64,
    batch: Option<Transaction<'static, Sqlite>>,
    pending: usize,
    summary: BuildSummary,
}

impl DatasetBuilder {
    pub fn new(store: FeatureStore, config: &BuilderConfig) -> DatasetBuilder {
        DatasetBuilder {
            store,
            batch_size: config.batch_size.max(1),
            progress_interval: config.progress_interval.max(1),
            batch: None,
            pending: 0,
            summary: BuildSummary::default(),
        }
    }

    /// Ingests one feature under a caller-assigned id.
    ///
    /// Features containing an unresolved position are dropped whole and
    /// counted; nothing is written for them.
    pub async fn ingest(
        &mut self,
        id: i64,
        coordinates: &[Coordinate],
        tags: &Tags,
    ) -> Result<IngestOutcome> {
        let outcome = match BoundingBox::enclosing(coordinates) {
            Ok(bounds) => {
                self.write(id, &bounds, coordinates, tags).await?;
                self.summary.stored += 1;
                IngestOutcome::Stored
            }
            Err(Error::InvalidCoordinate { lat, lon }) => {
                debug!(id, lat, lon, "dropping feature with unresolved position");
                self.summary.dropped_unresolved += 1;
                IngestOutcome::Dropped(DropReason::UnresolvedPosition)
            }
            Err(Error::EmptyGeometry) => {
                debug!(id, "dropping feature without coordinates");
                self.summary.dropped_empty += 1;
                IngestOutcome::Dropped(DropReason::EmptyGeometry)
            }
            Err(e) => return Err(e),
        };

        if self.summary.seen() % self.progress_interval == 0 {
            info!(
                seen = self.summary.seen(),
                stored = self.summary.stored,
                last_id = id,
                "ingest progress"
            );
        }

        Ok(outcome)
    }

    /// Drains a feature stream into the store, then commits.
    pub async fn ingest_all<S>(mut self, features: S) -> Result<BuildSummary>
    where
        S: Stream<Item = Result<SourceFeature>>,
    {
        futures::pin_mut!(features);
        while let Some(feature) = features.try_next().await? {
            self.ingest(feature.id, &feature.coordinates, &feature.tags)
                .await?;
        }

        self.finish().await
    }

    /// Commits the last batch and reports what was ingested.
    pub async fn finish(mut self) -> Result<BuildSummary> {
        self.commit().await?;

        if self.summary.dropped_unresolved > 0 {
            warn!(
                count = self.summary.dropped_unresolved,
                "dropped features with unresolved positions"
            );
        }
        info!(
            stored = self.summary.stored,
            dropped_unresolved = self.summary.dropped_unresolved,
            dropped_empty = self.summary.dropped_empty,
            "build finished"
        );

        Ok(self.summary)
    }

    async fn write(
        &mut self,
        id: i64,
        bounds: &BoundingBox,
        coordinates: &[Coordinate],
        tags: &Tags,
    ) -> Result<()> {
        let mut batch = match self.batch.take() {
            Some(batch) => batch,
            None => self.store.begin().await?,
        };

        if let Err(e) = insert_feature(&mut batch, id, bounds, tags, coordinates).await {
            batch.commit().await?;
            debug!(features = self.pending, "committed batch before failing feature");
            self.pending = 0;
            return Err(e);
        }
        self.batch = Some(batch);
        self.pending += 1;

        if self.pending >= self.batch_size {
            self.commit().await?;
        }

        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if let Some(batch) = self.batch.take() {
            batch.commit().await?;
            debug!(features = self.pending, "committed batch");
        }
        self.pending = 0;
        Ok(())
    }
}

async fn insert_feature(
    batch: &mut SqliteConnection,
    id: i64,
    bounds: &BoundingBox,
    tags: &Tags,
    coordinates: &[Coordinate],
) -> Result<()> {
    // Dropping an uncommitted savepoint rolls back to it
    let mut savepoint = batch.begin().await?;
    FeatureStore::insert(&mut savepoint, id, bounds, tags, coordinates).await?;
    savepoint.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::UNRESOLVED_POSITION;

    fn config(batch_size: usize) -> BuilderConfig {
        BuilderConfig {
            batch_size,
            ..BuilderConfig::default()
        }
    }

    fn line(points: &[(f64, f64)]) -> Vec<Coordinate> {
        points.iter().map(|&(lat, lon)| Coordinate::new(lat, lon)).collect()
    }

    #[tokio::test]
    async fn test_ingest_stores_bounds_and_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::create(dir.path().join("map.db")).await.unwrap();
        let mut builder = DatasetBuilder::new(store.clone(), &config(2));

        let coordinates = line(&[(48.02, 11.65), (48.02, 11.90), (48.18, 11.90)]);
        let mut tags = Tags::new();
        tags.insert(String::from("class"), String::from("major"));

        assert_eq!(
            IngestOutcome::Stored,
            builder.ingest(7, &coordinates, &tags).await.unwrap()
        );
        let summary = builder.finish().await.unwrap();
        assert_eq!(1, summary.stored);

        let entry = store.index_entry(7).await.unwrap().unwrap();
        assert!(entry.bounds.min_lat <= entry.bounds.max_lat);
        assert!(entry.bounds.min_lon <= entry.bounds.max_lon);
        assert_eq!(tags, entry.tags);

        let stored = store.load_geometry(7).await.unwrap().unwrap();
        assert_eq!(coordinates, stored);
        assert!(stored.iter().all(|c| entry.bounds.contains(c)));
    }

    #[tokio::test]
    async fn test_unresolved_position_is_dropped_whole() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::create(dir.path().join("map.db")).await.unwrap();
        let mut builder = DatasetBuilder::new(store.clone(), &config(1));

        let bad = line(&[(1.0, 1.0), (UNRESOLVED_POSITION, 2.0), (3.0, 3.0)]);
        let good = line(&[(1.0, 1.0), (2.0, 2.0)]);

        assert_eq!(
            IngestOutcome::Dropped(DropReason::UnresolvedPosition),
            builder.ingest(1, &bad, &Tags::new()).await.unwrap()
        );
        assert_eq!(
            IngestOutcome::Stored,
            builder.ingest(2, &good, &Tags::new()).await.unwrap()
        );
        assert_eq!(
            IngestOutcome::Dropped(DropReason::EmptyGeometry),
            builder.ingest(3, &[], &Tags::new()).await.unwrap()
        );

        let summary = builder.finish().await.unwrap();
        assert_eq!(
            BuildSummary { stored: 1, dropped_unresolved: 1, dropped_empty: 1 },
            summary
        );

        assert_eq!(None, store.index_entry(1).await.unwrap());
        assert_eq!(None, store.load_geometry(1).await.unwrap());
        assert!(store.index_entry(2).await.unwrap().is_some());
        assert_eq!(1, store.len().await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_keeps_committed_batches() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::create(dir.path().join("map.db")).await.unwrap();
        let mut builder = DatasetBuilder::new(store.clone(), &config(2));
        let coordinates = line(&[(1.0, 1.0), (2.0, 2.0)]);

        for id in 1..=3 {
            builder.ingest(id, &coordinates, &Tags::new()).await.unwrap();
        }
        // Duplicate id fails while feature 3 sits in the open batch
        assert!(builder.ingest(3, &coordinates, &Tags::new()).await.is_err());
        drop(builder);

        assert_eq!(3, store.len().await.unwrap());
        assert!(store.index_entry(2).await.unwrap().is_some());
        assert!(store.index_entry(3).await.unwrap().is_some());
        assert!(store.load_geometry(3).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failure_keeps_stored_features_of_open_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::create(dir.path().join("map.db")).await.unwrap();
        let mut builder = DatasetBuilder::new(store.clone(), &BuilderConfig::default());
        let coordinates = line(&[(1.0, 1.0), (2.0, 2.0)]);

        for id in 1..=5 {
            assert_eq!(
                IngestOutcome::Stored,
                builder.ingest(id, &coordinates, &Tags::new()).await.unwrap()
            );
        }
        assert!(builder.ingest(5, &coordinates, &Tags::new()).await.is_err());
        assert_eq!(5, store.len().await.unwrap());

        // The builder stays usable and starts a fresh batch
        assert_eq!(
            IngestOutcome::Stored,
            builder.ingest(6, &coordinates, &Tags::new()).await.unwrap()
        );
        let summary = builder.finish().await.unwrap();
        assert_eq!(6, summary.stored);
        assert_eq!(6, store.len().await.unwrap());
    }

    #[tokio::test]
    async fn test_ingest_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = FeatureStore::create(dir.path().join("map.db")).await.unwrap();
        let builder = DatasetBuilder::new(store.clone(), &config(10));

        let features = (0..25).map(|id| {
            Ok(SourceFeature {
                id,
                coordinates: line(&[(0.0, 0.0), (0.1 * id as f64, 0.1)]),
                tags: Tags::new(),
            })
        });
        let summary = builder
            .ingest_all(futures::stream::iter(features))
            .await
            .unwrap();

        assert_eq!(25, summary.stored);
        assert_eq!(25, store.len().await.unwrap());
    }
}
