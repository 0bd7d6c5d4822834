//! Raster tile rendering.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tiny_skia::{Color, Paint, PathBuilder, Pixmap, Stroke, Transform};
use tracing::{debug, warn};

use crate::cache::{CachedTile, TileCache};
use crate::config::{CacheConfig, Config, RenderConfig};
use crate::error::{Error, Result};
use crate::geometry::{BoundingBox, Coordinate};
use crate::projection::{geo_to_tile, TileAddress};
use crate::store::FeatureStore;
use crate::TileSource;

/// Outcome of a tile request.
#[derive(Clone, Debug, PartialEq)]
pub enum RenderResult {
    /// The tile was rendered before and is on disk.
    Cached(CachedTile),
    /// The tile was drawn for this request.
    Rendered(RasterBuffer),
}

/// Packed 8-bit RGB pixels, row-major, no alpha.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RasterBuffer {
    width: u32,
    height: u32,
    rgb: Arc<[u8]>,
}

impl RasterBuffer {
    /// Wraps packed RGB data; `None` when the length does not match.
    pub fn new(width: u32, height: u32, rgb: Vec<u8>) -> Option<RasterBuffer> {
        if rgb.len() != width as usize * height as usize * 3 {
            return None;
        }

        Some(RasterBuffer {
            width,
            height,
            rgb: rgb.into(),
        })
    }

    /// Copies a pixmap's pixels, dropping alpha. tiny-skia stores RGBA, so no
    /// channel reordering is needed.
    fn from_pixmap(pixmap: &Pixmap) -> RasterBuffer {
        let mut rgb = Vec::with_capacity(pixmap.pixels().len() * 3);
        for pixel in pixmap.pixels() {
            let color = pixel.demultiply();
            rgb.extend_from_slice(&[color.red(), color.green(), color.blue()]);
        }

        RasterBuffer {
            width: pixmap.width(),
            height: pixmap.height(),
            rgb: rgb.into(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.rgb
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }

        let offset = (y as usize * self.width as usize + x as usize) * 3;
        Some([self.rgb[offset], self.rgb[offset + 1], self.rgb[offset + 2]])
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        JpegEncoder::new_with_quality(&mut bytes, quality).encode(
            &self.rgb,
            self.width,
            self.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(bytes)
    }
}

/// Affine map from one zoom level's tile space onto a tile's pixel grid:
/// translate by `(-x, -y)`, then scale by the resolution.
#[derive(Clone, Copy, Debug, PartialEq)]
struct TileTransform {
    origin_x: f64,
    origin_y: f64,
    scale: f64,
}

impl TileTransform {
    fn new(address: TileAddress, resolution: u32) -> TileTransform {
        TileTransform {
            origin_x: f64::from(address.x),
            origin_y: f64::from(address.y),
            scale: f64::from(resolution),
        }
    }

    fn apply(&self, x: f64, y: f64) -> (f32, f32) {
        (
            ((x - self.origin_x) * self.scale) as f32,
            ((y - self.origin_y) * self.scale) as f32,
        )
    }

    /// Projects a coordinate list into a pixel-space polyline. Positions
    /// outside the projection domain are skipped.
    fn polyline(&self, coordinates: &[Coordinate], zoom: u8) -> Option<tiny_skia::Path> {
        let mut builder = PathBuilder::new();
        for coordinate in coordinates {
            let Some((x, y)) = geo_to_tile(coordinate.lat, coordinate.lon, zoom) else {
                continue;
            };
            let (px, py) = self.apply(x, y);
            if builder.is_empty() {
                builder.move_to(px, py);
            } else {
                builder.line_to(px, py);
            }
        }

        builder.finish()
    }
}

/// Counters kept by a [`TileEngine`].
#[derive(Debug, Default)]
struct EngineCounters {
    tiles_drawn: AtomicU64,
    cache_hits: AtomicU64,
    persists_queued: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub tiles_drawn: u64,
    pub cache_hits: u64,
    pub persists_queued: u64,
}

/// Renders tiles from a feature store, backed by a tile cache.
pub struct TileEngine {
    store: FeatureStore,
    cache: TileCache,
    render: RenderConfig,
    cache_config: CacheConfig,
    counters: EngineCounters,
}

impl TileEngine {
    pub fn new(store: FeatureStore, cache: TileCache, config: &Config) -> TileEngine {
        TileEngine {
            store,
            cache,
            render: config.render.clone(),
            cache_config: config.cache.clone(),
            counters: EngineCounters::default(),
        }
    }

    /// Opens the configured store read-only and starts the cache writer.
    pub async fn open(config: &Config) -> Result<TileEngine> {
        let store = FeatureStore::open(&config.database).await?;
        let cache = TileCache::open(
            &config.cache.directory,
            config.cache.queue_capacity,
            config.cache.jpeg_quality,
        )?;
        Ok(TileEngine::new(store, cache, config))
    }

    pub fn store(&self) -> &FeatureStore {
        &self.store
    }

    pub fn cache(&self) -> &TileCache {
        &self.cache
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            tiles_drawn: self.counters.tiles_drawn.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            persists_queued: self.counters.persists_queued.load(Ordering::Relaxed),
        }
    }

    /// Drains pending cache writes and stops the writer.
    pub async fn shutdown(&self) -> Result<()> {
        self.cache.shutdown().await?;
        self.store.close().await;
        Ok(())
    }

    async fn draw(&self, address: TileAddress, bounds: &BoundingBox) -> Result<RasterBuffer> {
        let resolution = self.render.resolution;
        let mut pixmap =
            Pixmap::new(resolution, resolution).ok_or(Error::InvalidResolution(resolution))?;
        let transform = TileTransform::new(address, resolution);

        pixmap.fill(Color::WHITE);

        let features = self
            .store
            .query(bounds, address.zoom, self.render.query_limit)
            .await?;

        let mut paint = Paint::default();
        paint.set_color(Color::BLACK);
        paint.anti_alias = true;

        for feature in &features {
            let Some(coordinates) = self.store.load_geometry(feature.id).await? else {
                warn!(id = feature.id, "indexed feature has no geometry record");
                continue;
            };
            let Some(path) = transform.polyline(&coordinates, address.zoom) else {
                continue;
            };

            let stroke = Stroke {
                width: (self.render.stroke_width(&feature.tags) * transform.scale) as f32,
                ..Stroke::default()
            };
            pixmap.stroke_path(&path, &paint, &stroke, Transform::identity(), None);
        }

        self.counters.tiles_drawn.fetch_add(1, Ordering::Relaxed);
        debug!(tile = %address, features = features.len(), "drew tile");

        Ok(RasterBuffer::from_pixmap(&pixmap))
    }
}

#[async_trait]
impl TileSource for TileEngine {
    async fn render_tile(&self, address: TileAddress) -> Result<RenderResult> {
        let bounds = address.bounds();

        match self.cache.lookup(address).await {
            Ok(Some(tile)) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                debug!(tile = %address, "cache hit");
                return Ok(RenderResult::Cached(tile));
            }
            Ok(None) => {}
            Err(e) => warn!(tile = %address, "cache lookup failed, rendering: {}", e),
        }

        let raster = match self.render.timeout() {
            Some(deadline) => tokio::time::timeout(deadline, self.draw(address, &bounds))
                .await
                .map_err(|_| Error::RenderTimeout {
                    address,
                    timeout_ms: deadline.as_millis() as u64,
                })??,
            None => self.draw(address, &bounds).await?,
        };

        if self.cache_config.is_cacheable(address.zoom) {
            let tile = self.cache.reference(address);
            match self.cache.enqueue_persist(raster.clone(), tile).await {
                Ok(()) => {
                    self.counters.persists_queued.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => warn!(tile = %address, "tile not queued for caching: {}", e),
            }
        }

        Ok(RenderResult::Rendered(raster))
    }
}
