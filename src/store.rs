//! SQLite-backed feature store.
//!
//! Three tables make up a store:
//!
//! * `features` keeps the exact float64 bounding box, the JSON tags and the
//!   insertion sequence of every feature.
//! * `feature_rtree` is an R*Tree over the same boxes. SQLite stores R*Tree
//!   coordinates as 32-bit floats rounded outward, so it is only used to prune
//!   candidates; exact tests always run against `features`.
//! * `geometries` holds the encoded coordinate list, fetched only for
//!   features that are actually drawn.
use std::path::Path;

use once_cell::sync::Lazy;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{query, Row, Sqlite, Transaction};
use tracing::debug;

use crate::error::Result;
use crate::geometry::{decode_coordinates, encode_coordinates, BoundingBox, Coordinate, Tags};

pub(crate) const INDEX_TABLE: &str = "features";
pub(crate) const RTREE_TABLE: &str = "feature_rtree";
pub(crate) const GEOMETRY_TABLE: &str = "geometries";

const READ_CONNECTIONS: u32 = 8;

static SCHEMA: Lazy<Vec<String>> = Lazy::new(|| {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                seq INTEGER PRIMARY KEY,
                id INTEGER NOT NULL UNIQUE,
                min_lat REAL NOT NULL,
                max_lat REAL NOT NULL,
                min_lon REAL NOT NULL,
                max_lon REAL NOT NULL,
                tags TEXT NOT NULL
            )",
            INDEX_TABLE
        ),
        format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING rtree(id, min_lat, max_lat, min_lon, max_lon)",
            RTREE_TABLE
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY, coordinates TEXT NOT NULL)",
            GEOMETRY_TABLE
        ),
    ]
});

static INSERT_INDEX_SQL: Lazy<String> = Lazy::new(|| {
    format!(
        "INSERT INTO {} (id, min_lat, max_lat, min_lon, max_lon, tags) VALUES (?, ?, ?, ?, ?, ?)",
        INDEX_TABLE
    )
});

static INSERT_RTREE_SQL: Lazy<String> = Lazy::new(|| {
    format!(
        "INSERT INTO {} (id, min_lat, max_lat, min_lon, max_lon) VALUES (?, ?, ?, ?, ?)",
        RTREE_TABLE
    )
});

static INSERT_GEOMETRY_SQL: Lazy<String> = Lazy::new(|| {
    format!("INSERT INTO {} (id, coordinates) VALUES (?, ?)", GEOMETRY_TABLE)
});

/// A spatial index entry as persisted.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntry {
    pub id: i64,
    pub bounds: BoundingBox,
    pub tags: Tags,
}

/// Handle to an opened feature store. Cloning is cheap and shares the
/// underlying connection pool.
#[derive(Clone, Debug)]
pub struct FeatureStore {
    pub(crate) pool: SqlitePool,
}

impl FeatureStore {
    /// Opens (creating if necessary) a store for writing.
    pub async fn create<P: AsRef<Path>>(path: P) -> Result<FeatureStore> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        for statement in SCHEMA.iter() {
            query(statement).execute(&pool).await?;
        }

        debug!(path = ?path.as_ref(), "opened feature store for writing");
        Ok(FeatureStore { pool })
    }

    /// Opens an existing store for concurrent read-only access.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<FeatureStore> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .journal_mode(SqliteJournalMode::Delete)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(READ_CONNECTIONS)
            .connect_with(options)
            .await?;

        debug!(path = ?path.as_ref(), "opened feature store read-only");
        Ok(FeatureStore { pool })
    }

    pub(crate) async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Writes one index entry and its geometry record on `conn`, which is
    /// expected to be inside a transaction or savepoint.
    pub(crate) async fn insert(
        conn: &mut SqliteConnection,
        id: i64,
        bounds: &BoundingBox,
        tags: &Tags,
        coordinates: &[Coordinate],
    ) -> Result<()> {
        let tags = serde_json::to_string(tags)?;
        let geometry = encode_coordinates(coordinates);

        query(&INSERT_INDEX_SQL)
            .bind(id)
            .bind(bounds.min_lat)
            .bind(bounds.max_lat)
            .bind(bounds.min_lon)
            .bind(bounds.max_lon)
            .bind(tags)
            .execute(&mut *conn)
            .await?;
        query(&INSERT_RTREE_SQL)
            .bind(id)
            .bind(bounds.min_lat)
            .bind(bounds.max_lat)
            .bind(bounds.min_lon)
            .bind(bounds.max_lon)
            .execute(&mut *conn)
            .await?;
        query(&INSERT_GEOMETRY_SQL)
            .bind(id)
            .bind(geometry)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    /// Loads and decodes the coordinate list of a feature.
    pub async fn load_geometry(&self, id: i64) -> Result<Option<Vec<Coordinate>>> {
        let sql = format!("SELECT coordinates FROM {} WHERE id = ?", GEOMETRY_TABLE);
        let row = query(&sql).bind(id).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => {
                let record: String = row.try_get("coordinates")?;
                Ok(Some(decode_coordinates(&record)?))
            }
            None => Ok(None),
        }
    }

    /// Fetches the index entry of a single feature.
    pub async fn index_entry(&self, id: i64) -> Result<Option<IndexEntry>> {
        let sql = format!(
            "SELECT id, min_lat, max_lat, min_lon, max_lon, tags FROM {} WHERE id = ?",
            INDEX_TABLE
        );
        let row = query(&sql).bind(id).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => Ok(Some(IndexEntry::from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Number of indexed features.
    pub async fn len(&self) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", INDEX_TABLE);
        let row = query(&sql).fetch_one(&self.pool).await?;
        Ok(row.try_get(0)?)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl IndexEntry {
    pub(crate) fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<IndexEntry> {
        let tags: String = row.try_get("tags")?;
        Ok(IndexEntry {
            id: row.try_get("id")?,
            bounds: BoundingBox {
                min_lat: row.try_get("min_lat")?,
                max_lat: row.try_get("max_lat")?,
                min_lon: row.try_get("min_lon")?,
                max_lon: row.try_get("max_lon")?,
            },
            tags: serde_json::from_str(&tags)?,
        })
    }
}
