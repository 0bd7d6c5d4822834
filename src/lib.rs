//! # Tile Smith
//!
//! Tools for building a spatially indexed store of line features and rendering
//! raster map tiles from it on demand.
//!
//! ## Current features
//!
//! Given a regional OpenStreetMap extract, [`builder::DatasetBuilder`] streams
//! every way into a SQLite feature store (bounding box and tags in a spatial
//! index, coordinates in a separate geometry table). A [`render::TileEngine`]
//! then serves slippy map tiles: it selects the features overlapping the tile
//! that are visible at its zoom level, strokes them largest-first onto a
//! 256x256 canvas, and caches shallow-zoom tiles to disk as JPEG from a
//! background writer.
//!
//! ## Known Limitations
//!
//! Only line geometry with flat tags is supported, with a single stroke-only
//! style (wider strokes for major roads). The cache is append-only: tiles are
//! never invalidated or evicted, so rebuilding the store requires clearing the
//! cache directory by hand.
//!
//! The builder keeps every node location of the extract in memory while it
//! resolves ways.

#![deny(warnings)]

use async_trait::async_trait;

pub mod builder;
pub mod cache;
pub mod config;
pub mod error;
pub mod geometry;
pub mod osm;
pub mod projection;
pub mod query;
pub mod render;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use projection::TileAddress;
pub use render::{RasterBuffer, RenderResult, TileEngine};

/// This is the main trait exported by this crate. It is presently rather barebones,
/// but is open for future expansion if other tile sources become relevant.
#[async_trait]
pub trait TileSource: Send + Sync {
    /// Renders the raster tile for a slippy map tile in XYZ format, or returns
    /// a reference to the copy cached by an earlier request.
    async fn render_tile(&self, address: TileAddress) -> Result<RenderResult>;
}
