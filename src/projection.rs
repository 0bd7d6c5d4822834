//! Spherical Web-Mercator conversions between slippy-map tile space and
//! geographic coordinates.
//!
//! Both directions use the textbook formulas in double precision so that the
//! same tile address always produces the same geographic bounds (and therefore
//! the same cache key and the same feature selection).

use std::f64::consts::PI;
use std::fmt;

use crate::geometry::BoundingBox;

/// Converts a (possibly fractional) tile position to `(lon, lat)` in degrees.
///
/// Total over all real inputs; positions outside the tile grid simply map
/// outside the usual longitude/latitude ranges.
pub fn tile_to_geo(x: f64, y: f64, zoom: u8) -> (f64, f64) {
    let n = 2.0_f64.powi(zoom.into());
    let lon = x / n * 360.0 - 180.0;
    let lat_rad = (PI * (1.0 - 2.0 * y / n)).sinh().atan();
    let lat = lat_rad * 180.0 / PI;
    (lon, lat)
}

/// Converts a geographic position to fractional tile coordinates `(x, y)`.
///
/// Returns `None` when the longitude is outside `[-180, 180]` or the latitude
/// is outside `[-90, 90]`.
pub fn geo_to_tile(lat: f64, lon: f64, zoom: u8) -> Option<(f64, f64)> {
    if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
        return None;
    }

    let n = 2.0_f64.powi(zoom.into());
    let lat_rad = lat * PI / 180.0;
    let x = (lon + 180.0) / 360.0 * n;
    let y = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n;
    Some((x, y))
}

/// A slippy map tile in XYZ format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TileAddress {
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileAddress {
    pub fn new(zoom: u8, x: u32, y: u32) -> TileAddress {
        TileAddress { zoom, x, y }
    }

    /// The tile covering a geographic position, if the position is in domain.
    pub fn containing(lat: f64, lon: f64, zoom: u8) -> Option<TileAddress> {
        geo_to_tile(lat, lon, zoom)?;
        let (x, y) = slippy_map_tilenames::lonlat2tile(lon, lat, zoom);
        Some(TileAddress { zoom, x, y })
    }

    /// Geographic bounds of the tile, normalized so that min <= max on both
    /// axes (tile y grows southwards).
    pub fn bounds(&self) -> BoundingBox {
        let x = f64::from(self.x);
        let y = f64::from(self.y);
        let (lon_a, lat_a) = tile_to_geo(x, y, self.zoom);
        let (lon_b, lat_b) = tile_to_geo(x + 1.0, y + 1.0, self.zoom);

        BoundingBox {
            min_lat: lat_a.min(lat_b),
            max_lat: lat_a.max(lat_b),
            min_lon: lon_a.min(lon_b),
            max_lon: lon_a.max(lon_b),
        }
    }

    /// Deterministic on-disk key, `{zoom}_{x}_{y}`.
    pub fn cache_key(&self) -> String {
        format!("{}_{}_{}", self.zoom, self.x, self.y)
    }
}

impl fmt::Display for TileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use assert_approx_eq::assert_approx_eq;

    use super::*;

    #[test]
    fn test_tile_to_geo_origin() {
        let (lon, lat) = tile_to_geo(0.0, 0.0, 0);
        assert_approx_eq!(-180.0, lon, 1e-12);
        assert_approx_eq!(85.0511287798066, lat, 1e-9);

        let (lon, lat) = tile_to_geo(0.5, 0.5, 0);
        assert_approx_eq!(0.0, lon, 1e-12);
        assert_approx_eq!(0.0, lat, 1e-12);
    }

    #[test]
    fn test_round_trip() {
        for zoom in 0..=20u8 {
            let n = 1u32 << zoom;
            let samples = [0, n / 3, n / 2, n - 1];
            // Tile units are 2^zoom times coarser than the angles they round
            // trip through, so the rounding error grows past 1e-9 beyond zoom 16
            let tolerance = 1e-9 * f64::from((n >> 16).max(1));
            for &x in samples.iter() {
                for &y in samples.iter() {
                    let (lon, lat) = tile_to_geo(f64::from(x), f64::from(y), zoom);
                    let (tx, ty) = geo_to_tile(lat, lon, zoom).expect("in domain");
                    assert_approx_eq!(f64::from(x), tx, tolerance);
                    assert_approx_eq!(f64::from(y), ty, tolerance);
                }
            }
        }
    }

    #[test]
    fn test_round_trip_low_zoom_is_tight() {
        for zoom in 0..=10u8 {
            let (lon, lat) = tile_to_geo(1.0, 1.0, zoom);
            let (tx, ty) = geo_to_tile(lat, lon, zoom).expect("in domain");
            assert_approx_eq!(1.0, tx, 1e-9);
            assert_approx_eq!(1.0, ty, 1e-9);
        }
    }

    #[test]
    fn test_geo_to_tile_domain_guard() {
        assert_eq!(None, geo_to_tile(0.0, 180.5, 3));
        assert_eq!(None, geo_to_tile(0.0, -180.5, 3));
        assert_eq!(None, geo_to_tile(90.1, 0.0, 3));
        assert_eq!(None, geo_to_tile(-90.1, 0.0, 3));
        assert!(geo_to_tile(0.0, 180.0, 3).is_some());
        assert!(geo_to_tile(0.0, -180.0, 3).is_some());
    }

    #[test]
    fn test_bounds_are_normalized() {
        let bounds = TileAddress::new(10, 545, 355).bounds();
        assert!(bounds.min_lat < bounds.max_lat);
        assert!(bounds.min_lon < bounds.max_lon);
        assert_approx_eq!(11.6015625, bounds.min_lon, 1e-12);
        assert_approx_eq!(11.953125, bounds.max_lon, 1e-12);
        assert_approx_eq!(47.98992166741417, bounds.min_lat, 1e-9);
    }

    #[test]
    fn test_containing() {
        let tile = TileAddress::containing(48.1, 11.7, 10).expect("in domain");
        assert_eq!(TileAddress::new(10, 545, 355), tile);
        assert_eq!(None, TileAddress::containing(91.0, 11.7, 10));
    }

    #[test]
    fn test_cache_key() {
        assert_eq!("12_2200_1343", TileAddress::new(12, 2200, 1343).cache_key());
        assert_eq!("12/2200/1343", TileAddress::new(12, 2200, 1343).to_string());
    }
}
