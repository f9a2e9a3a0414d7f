//! Pure Web-Mercator tile math: lat/lon <-> slippy-map tile coordinates.
//!
//! No state, no I/O. Every function here must produce identical results
//! regardless of caller — the in-memory store, the ingest client, and the
//! durable-store adapter all derive tile membership from these functions and
//! must never disagree.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Latitude beyond which the Web-Mercator projection is undefined; values
/// outside this range are clamped before projecting.
pub const MAX_LAT: f64 = 85.0511287798066;

/// Tiles accepted per `tiles_in_bounds` call before the caller is expected to
/// reject the request. This is a policy constant, not a hard engine limit —
/// callers still decide what to do with `TooManyTiles`.
pub const MAX_TILES_IN_BOUNDS: usize = 1500;

/// A slippy-map tile coordinate at a fixed zoom level.
///
/// Canonical textual form is `"z/x/y"` (see [`TileKey::to_string`] and the
/// [`FromStr`] impl), which is what the wire protocol and the durable store's
/// tile_z12 column both key off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Span of a single tile edge at this zoom, in tile units: `2^z`.
    pub fn span(z: u8) -> u64 {
        1u64 << z
    }

    /// Packs (x, y) into a single integer for use as the durable store's
    /// `tile_z12` column. Generalized to `x * 2^z + y` rather than the
    /// `x * 4096 + y` shorthand that only holds at z = 12 — the two agree
    /// exactly when z == 12, and diverge (without colliding) at any other
    /// zoom, which keeps the schema column meaningful if TILE_ZOOM is ever
    /// reconfigured.
    pub fn packed_index(&self) -> i64 {
        self.x as i64 * (Self::span(self.z) as i64) + self.y as i64
    }

    /// Lat/lon bounds of this tile: (north, south, east, west).
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        let n = Self::span(self.z) as f64;
        let west = (self.x as f64) / n * 360.0 - 180.0;
        let east = ((self.x + 1) as f64) / n * 360.0 - 180.0;
        let north = lat_for_y(self.y as f64, self.z);
        let south = lat_for_y((self.y + 1) as f64, self.z);
        (north, south, east, west)
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

#[derive(Debug, Error)]
pub enum ParseTileKeyError {
    #[error("malformed tile key {0:?}: expected \"z/x/y\"")]
    Malformed(String),
}

impl FromStr for TileKey {
    type Err = ParseTileKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let (z, x, y) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(z), Some(x), Some(y), None) => (z, x, y),
            _ => return Err(ParseTileKeyError::Malformed(s.to_string())),
        };
        let z: u8 = z
            .parse()
            .map_err(|_| ParseTileKeyError::Malformed(s.to_string()))?;
        let x: u32 = x
            .parse()
            .map_err(|_| ParseTileKeyError::Malformed(s.to_string()))?;
        let y: u32 = y
            .parse()
            .map_err(|_| ParseTileKeyError::Malformed(s.to_string()))?;
        Ok(TileKey { z, x, y })
    }
}

/// Clamps latitude to the Web-Mercator-valid range.
pub fn clamp_lat(lat: f64) -> f64 {
    lat.clamp(-MAX_LAT, MAX_LAT)
}

/// Normalizes longitude into `[-180, 180)`, treating +180 as the same
/// column as -180 (date-line continuity).
pub fn normalize_lon(lon: f64) -> f64 {
    let wrapped = ((lon + 180.0).rem_euclid(360.0)) - 180.0;
    if wrapped >= 180.0 { wrapped - 360.0 } else { wrapped }
}

fn lat_for_y(y: f64, z: u8) -> f64 {
    let n = TileKey::span(z) as f64;
    let frac = 1.0 - 2.0 * y / n;
    (frac * std::f64::consts::PI).sinh().atan().to_degrees()
}

/// Derives the tile containing `(lat, lon)` at zoom `z`.
///
/// Latitude is clamped to `[-MAX_LAT, MAX_LAT]` and longitude normalized to
/// `[-180, 180)` before projecting, so this function never fails.
pub fn tile_of(lat: f64, lon: f64, z: u8) -> TileKey {
    let lat = clamp_lat(lat);
    let lon = normalize_lon(lon);
    let n = TileKey::span(z) as f64;

    let x = ((lon + 180.0) / 360.0 * n).floor();
    let lat_rad = lat.to_radians();
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0 * n)
        .floor();

    let max = TileKey::span(z) as i64 - 1;
    let x = (x as i64).clamp(0, max) as u32;
    let y = (y as i64).clamp(0, max) as u32;
    TileKey::new(z, x, y)
}

#[derive(Debug, Error)]
pub enum BoundsError {
    #[error("bounds cover {0} tiles, exceeding the cap of {1}")]
    TooManyTiles(usize, usize),
}

/// Returns every tile intersecting the rectangle `[south, north] x [west,
/// east]` at zoom `z`. If `west > east` the rectangle is treated as wrapping
/// across the antimeridian.
///
/// Returns [`BoundsError::TooManyTiles`] if the rectangle covers more than
/// [`MAX_TILES_IN_BOUNDS`] tiles; the caller decides what to do with an
/// oversized request (reject, or split and ask again), this function just
/// enforces the cap consistently.
pub fn tiles_in_bounds(
    north: f64,
    south: f64,
    east: f64,
    west: f64,
    z: u8,
) -> Result<Vec<TileKey>, BoundsError> {
    let nw = tile_of(north, west, z);
    let se = tile_of(south, east, z);

    let (y_min, y_max) = (nw.y.min(se.y), nw.y.max(se.y));

    let x_ranges: Vec<(u32, u32)> = if normalize_lon(west) <= normalize_lon(east) {
        vec![(nw.x.min(se.x), nw.x.max(se.x))]
    } else {
        // Antimeridian wrap: two ranges, [nw.x, max_x] and [0, se.x].
        let max_x = TileKey::span(z) as u32 - 1;
        vec![(nw.x, max_x), (0, se.x)]
    };

    let total: usize = x_ranges
        .iter()
        .map(|(x0, x1)| (x1 - x0 + 1) as usize * (y_max - y_min + 1) as usize)
        .sum();
    if total > MAX_TILES_IN_BOUNDS {
        return Err(BoundsError::TooManyTiles(total, MAX_TILES_IN_BOUNDS));
    }

    let mut out = Vec::with_capacity(total);
    for (x0, x1) in x_ranges {
        for x in x0..=x1 {
            for y in y_min..=y_max {
                out.push(TileKey::new(z, x, y));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_hong_kong_harbour_tile() {
        // From the reference end-to-end scenario: (22.3964, 114.1095) at z=12
        // lands in 12/3413/1789.
        let t = tile_of(22.3964, 114.1095, 12);
        assert_eq!(t, TileKey::new(12, 3413, 1789));
    }

    #[test]
    fn scenario_null_island_tile() {
        let t = tile_of(0.0, 0.0, 12);
        assert_eq!(t, TileKey::new(12, 2048, 2048));
    }

    #[test]
    fn date_line_continuity() {
        let east = tile_of(10.0, 179.999, 6);
        let west = tile_of(10.0, -180.0, 6);
        assert_eq!(east.x, west.x);
        assert_eq!(tile_of(10.0, 180.0, 6), tile_of(10.0, -180.0, 6));
    }

    #[test]
    fn extreme_latitude_clamps_to_edge_row() {
        let exact = tile_of(MAX_LAT, 0.0, 8);
        let beyond = tile_of(89.9, 0.0, 8);
        assert_eq!(exact.y, 0);
        assert_eq!(beyond, exact);

        let exact_south = tile_of(-MAX_LAT, 0.0, 8);
        let beyond_south = tile_of(-89.9, 0.0, 8);
        assert_eq!(exact_south.y, TileKey::span(8) as u32 - 1);
        assert_eq!(beyond_south, exact_south);
    }

    #[test]
    fn round_trip_corners_contain_point() {
        for (lat, lon) in [(22.3964, 114.1095), (-33.8688, 151.2093), (51.5072, -0.1276)] {
            let z = 10;
            let t = tile_of(lat, lon, z);
            let (north, south, east, west) = t.bounds();
            assert!(lat <= north && lat >= south, "lat {lat} outside [{south},{north}]");
            assert!(lon >= west && lon <= east, "lon {lon} outside [{west},{east}]");
            // Idempotent re-application.
            assert_eq!(tile_of(lat, lon, z), t);
        }
    }

    #[test]
    fn tile_key_display_and_parse_round_trip() {
        let t = TileKey::new(12, 3413, 1789);
        let s = t.to_string();
        assert_eq!(s, "12/3413/1789");
        assert_eq!(s.parse::<TileKey>().unwrap(), t);
    }

    #[test]
    fn parse_rejects_malformed_key() {
        assert!("12/3413".parse::<TileKey>().is_err());
        assert!("z/x/y".parse::<TileKey>().is_err());
    }

    #[test]
    fn packed_index_matches_z12_shorthand() {
        let t = TileKey::new(12, 3413, 1789);
        assert_eq!(t.packed_index(), 3413i64 * 4096 + 1789);
    }

    #[test]
    fn bounds_beyond_cap_is_rejected() {
        let err = tiles_in_bounds(85.0, -85.0, 180.0, -180.0, 4).unwrap_err();
        match err {
            BoundsError::TooManyTiles(total, cap) => {
                assert!(total > cap);
            }
        }
    }

    #[test]
    fn bounds_within_cap_contains_center() {
        let center = tile_of(22.3, 114.1, 12);
        let tiles = tiles_in_bounds(22.5, 22.1, 114.3, 113.9, 12).unwrap();
        assert!(tiles.contains(&center));
        assert!(tiles.len() <= MAX_TILES_IN_BOUNDS);
    }
}
