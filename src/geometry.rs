//! Feature geometry: coordinates, bounding boxes, and the persisted
//! coordinate-list layout.
//!
//! ## Geometry record layout (version 1)
//!
//! ```text
//! [version: u8 = 1][count: u32 LE][lat0: f64 LE][lon0: f64 LE] ... [latN-1][lonN-1]
//! ```
//!
//! `count` is the number of coordinate pairs. The binary payload is stored as
//! standard base64 text so the record survives any text column.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Error, Result};

/// Coordinate value the source data uses for a position it could not resolve
/// (`i32::MAX` in decimicro degrees).
pub const UNRESOLVED_POSITION: f64 = 214.748_364_7;

pub const GEOMETRY_FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = 5;
const PAIR_LEN: usize = 16;

/// Flat, unordered feature tags.
pub type Tags = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Coordinate {
        Coordinate { lat, lon }
    }

    pub fn is_unresolved(&self) -> bool {
        self.lat == UNRESOLVED_POSITION || self.lon == UNRESOLVED_POSITION
    }
}

/// Axis-aligned box in degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Computes the minimal box enclosing every coordinate.
    ///
    /// Fails with `InvalidCoordinate` as soon as an unresolved position is
    /// seen, so callers can drop the feature as a whole.
    pub fn enclosing(coordinates: &[Coordinate]) -> Result<BoundingBox> {
        let first = coordinates.first().ok_or(Error::EmptyGeometry)?;
        let mut bounds = BoundingBox {
            min_lat: first.lat,
            max_lat: first.lat,
            min_lon: first.lon,
            max_lon: first.lon,
        };

        for coordinate in coordinates {
            if coordinate.is_unresolved() {
                return Err(Error::InvalidCoordinate {
                    lat: coordinate.lat,
                    lon: coordinate.lon,
                });
            }

            bounds.min_lat = bounds.min_lat.min(coordinate.lat);
            bounds.max_lat = bounds.max_lat.max(coordinate.lat);
            bounds.min_lon = bounds.min_lon.min(coordinate.lon);
            bounds.max_lon = bounds.max_lon.max(coordinate.lon);
        }

        Ok(bounds)
    }

    /// Area in squared degrees.
    pub fn area(&self) -> f64 {
        (self.max_lat - self.min_lat) * (self.max_lon - self.min_lon)
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
    }

    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        (self.min_lat..=self.max_lat).contains(&coordinate.lat)
            && (self.min_lon..=self.max_lon).contains(&coordinate.lon)
    }

    /// Zoom-dependent visibility: a feature is drawn only while its box area
    /// does not exceed `zoom²`.
    ///
    /// This is an empirical threshold (squared degrees against a bare zoom
    /// index) kept exactly as-is so that tile output stays stable.
    pub fn is_visible_at(&self, zoom: u8) -> bool {
        self.area() <= visibility_threshold(zoom)
    }
}

pub fn visibility_threshold(zoom: u8) -> f64 {
    let zoom = f64::from(zoom);
    zoom * zoom
}

/// Encodes a coordinate list into a geometry record.
pub fn encode_coordinates(coordinates: &[Coordinate]) -> String {
    let mut buf = Vec::with_capacity(HEADER_LEN + coordinates.len() * PAIR_LEN);
    buf.push(GEOMETRY_FORMAT_VERSION);
    buf.extend_from_slice(&(coordinates.len() as u32).to_le_bytes());
    for coordinate in coordinates {
        buf.extend_from_slice(&coordinate.lat.to_le_bytes());
        buf.extend_from_slice(&coordinate.lon.to_le_bytes());
    }

    STANDARD.encode(buf)
}

/// Decodes a geometry record produced by [`encode_coordinates`].
pub fn decode_coordinates(record: &str) -> Result<Vec<Coordinate>> {
    let buf = STANDARD.decode(record)?;
    if buf.len() < HEADER_LEN {
        return Err(Error::GeometryDecode(format!(
            "record is {} bytes, shorter than its header",
            buf.len()
        )));
    }

    let (header, body) = buf.split_at(HEADER_LEN);
    if header[0] != GEOMETRY_FORMAT_VERSION {
        return Err(Error::GeometryDecode(format!(
            "unsupported format version {}",
            header[0]
        )));
    }

    let count = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if body.len() != count * PAIR_LEN {
        return Err(Error::GeometryDecode(format!(
            "expected {} coordinate pairs, found {} bytes",
            count,
            body.len()
        )));
    }

    let coordinates = body
        .chunks_exact(PAIR_LEN)
        .map(|pair| {
            let mut lat = [0u8; 8];
            let mut lon = [0u8; 8];
            lat.copy_from_slice(&pair[..8]);
            lon.copy_from_slice(&pair[8..]);
            Coordinate {
                lat: f64::from_le_bytes(lat),
                lon: f64::from_le_bytes(lon),
            }
        })
        .collect();

    Ok(coordinates)
}
