use std::path::PathBuf;

use crate::projection::TileAddress;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Coordinate ({lat}, {lon}) is an unresolved position.")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("Feature has no coordinates.")]
    EmptyGeometry,

    #[error("Feature store unavailable: {0}")]
    FeatureStoreUnavailable(#[from] sqlx::Error),

    #[error("Invalid geometry record: {0}")]
    GeometryDecode(String),

    #[error("Geometry record is not valid base64: {0}")]
    GeometryEncoding(#[from] base64::DecodeError),

    #[error("Invalid feature tags: {0}")]
    Tags(#[from] serde_json::Error),

    #[error("Invalid YAML in configuration: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to write cached tile {path:?}: {source}")]
    CacheWriteFailure {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("Image encoding failed: {0}")]
    ImageEncode(#[from] image::ImageError),

    #[error("Tile cache writer has been shut down.")]
    CacheClosed,

    #[error("Tile cache writer thread panicked.")]
    WorkerJoin,

    #[error("Rendering tile {address} exceeded the {timeout_ms} ms deadline.")]
    RenderTimeout { address: TileAddress, timeout_ms: u64 },

    #[error("Invalid tile resolution {0}.")]
    InvalidResolution(u32),

    #[error("Failed to read OSM extract: {0}")]
    Osm(#[from] osmpbf::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
