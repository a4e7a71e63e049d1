//! Web Mercator tile grid math shared by the `mbtiler` pipeline: tile
//! coordinates in the XYZ (top-left origin) convention, conversion to the
//! TMS row numbering used by MBTiles storage, quadkeys, and the mapping
//! between geographic bounds and tile ranges.

use std::f64::consts::PI;
use std::fmt::{Display, Formatter};

use tilejson::Bounds;

pub const EARTH_RADIUS: f64 = 6_378_137.0;
pub const EARTH_CIRCUMFERENCE: f64 = 2.0 * PI * EARTH_RADIUS;

/// Latitude limit of the Web Mercator projection.
pub const MAX_LATITUDE: f64 = 85.051_129;

pub const MAX_ZOOM: u8 = 30;

/// Nudge applied to geographic bounds before computing tile ranges so that
/// bounds lying exactly on a tile edge do not pull in a full extra row or
/// column of tiles.
const LL_EPSILON: f64 = 1.0e-11;

/// One tile address in the XYZ (top-left origin) convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl Display for TileCoord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

impl TileCoord {
    #[must_use]
    pub fn new(z: u8, x: u32, y: u32) -> Option<Self> {
        if z <= MAX_ZOOM && u64::from(x) < (1 << z) && u64::from(y) < (1 << z) {
            Some(Self { z, x, y })
        } else {
            None
        }
    }

    /// Tile bounding box in Web Mercator meters.
    #[must_use]
    pub fn webmercator_bounds(&self) -> WebMercatorBounds {
        let tile_span = EARTH_CIRCUMFERENCE / f64::from(1_u32 << self.z);
        let min_x = -0.5 * EARTH_CIRCUMFERENCE + f64::from(self.x) * tile_span;
        let max_y = 0.5 * EARTH_CIRCUMFERENCE - f64::from(self.y) * tile_span;
        WebMercatorBounds {
            min_x,
            min_y: max_y - tile_span,
            max_x: min_x + tile_span,
            max_y,
        }
    }

    /// Encode this coordinate as a quadkey string. The root tile encodes as
    /// the empty string.
    #[must_use]
    pub fn quadkey(&self) -> String {
        let mut key = String::with_capacity(self.z as usize);
        for bit in (0..self.z).rev() {
            let digit = ((self.x >> bit) & 1) | (((self.y >> bit) & 1) << 1);
            key.push(char::from(b'0' + digit as u8));
        }
        key
    }

    #[must_use]
    pub fn from_quadkey(quadkey: &str) -> Option<Self> {
        let z = u8::try_from(quadkey.len()).ok().filter(|z| *z <= MAX_ZOOM)?;
        let mut x = 0_u32;
        let mut y = 0_u32;
        for ch in quadkey.chars() {
            let digit = ch.to_digit(4)?;
            x = (x << 1) | (digit & 1);
            y = (y << 1) | (digit >> 1);
        }
        Some(Self { z, x, y })
    }

    /// Whether this tile equals `ancestor` or lies underneath it in the
    /// quad-tree.
    #[must_use]
    pub fn is_descendant_or_self(&self, ancestor: Self) -> bool {
        self.z >= ancestor.z
            && self.x >> (self.z - ancestor.z) == ancestor.x
            && self.y >> (self.z - ancestor.z) == ancestor.y
    }
}

/// Flip a row number between the XYZ and TMS conventions at a given zoom.
/// The transform is its own inverse.
#[must_use]
pub fn invert_y_value(zoom: u8, y: u32) -> u32 {
    (1_u32 << zoom) - 1 - y
}

/// An axis-aligned bounding box in Web Mercator meters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WebMercatorBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

#[must_use]
pub fn wgs84_to_webmercator(lng: f64, lat: f64) -> (f64, f64) {
    (
        EARTH_RADIUS * lng.to_radians(),
        EARTH_RADIUS * lat.to_radians().tan().asinh(),
    )
}

#[must_use]
pub fn webmercator_to_wgs84(x: f64, y: f64) -> (f64, f64) {
    let lng = (x / EARTH_RADIUS).to_degrees();
    let lat = (f64::atan(f64::exp(y / EARTH_RADIUS)) * 2.0 - PI / 2.0).to_degrees();
    (lng, lat)
}

/// Index of the tile containing a geographic point at the given zoom,
/// clamped to the valid tile grid.
#[must_use]
pub fn tile_index(zoom: u8, lng: f64, lat: f64) -> (u32, u32) {
    let dim = f64::from(1_u32 << zoom);
    let max = (1_u32 << zoom) - 1;
    let x = ((lng + 180.0) / 360.0 * dim).floor();
    let lat = lat.clamp(-MAX_LATITUDE, MAX_LATITUDE);
    let y = ((1.0 - lat.to_radians().tan().asinh() / PI) / 2.0 * dim).floor();
    (
        (x.max(0.0) as u32).min(max),
        (y.max(0.0) as u32).min(max),
    )
}

/// Inclusive rectangle of tile indices at one zoom level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TileRange {
    pub zoom: u8,
    pub min_x: u32,
    pub max_x: u32,
    pub min_y: u32,
    pub max_y: u32,
}

impl TileRange {
    #[must_use]
    pub fn count(&self) -> u64 {
        u64::from(self.max_x - self.min_x + 1) * u64::from(self.max_y - self.min_y + 1)
    }

    /// Intersect this range with the descendants of `ancestor`. Returns
    /// `None` when the range's zoom is above the ancestor or no cell of the
    /// range lies underneath it.
    #[must_use]
    pub fn restrict_to_descendants(&self, ancestor: TileCoord) -> Option<Self> {
        if self.zoom < ancestor.z {
            return None;
        }
        let shift = self.zoom - ancestor.z;
        let first_x = ancestor.x << shift;
        let last_x = ((u64::from(ancestor.x) + 1) << shift) - 1;
        let first_y = ancestor.y << shift;
        let last_y = ((u64::from(ancestor.y) + 1) << shift) - 1;
        let min_x = self.min_x.max(first_x);
        let max_x = u32::try_from(u64::from(self.max_x).min(last_x)).ok()?;
        let min_y = self.min_y.max(first_y);
        let max_y = u32::try_from(u64::from(self.max_y).min(last_y)).ok()?;
        if min_x > max_x || min_y > max_y {
            None
        } else {
            Some(Self {
                zoom: self.zoom,
                min_x,
                max_x,
                min_y,
                max_y,
            })
        }
    }

    /// Iterate the range row-major: ascending row, then ascending column.
    pub fn iter(&self) -> impl Iterator<Item = TileCoord> + '_ {
        let zoom = self.zoom;
        let (min_x, max_x) = (self.min_x, self.max_x);
        (self.min_y..=self.max_y)
            .flat_map(move |y| (min_x..=max_x).map(move |x| TileCoord { z: zoom, x, y }))
    }
}

/// The range of tiles whose bounding boxes intersect the given geographic
/// bounds at one zoom level.
#[must_use]
pub fn tile_range(bounds: &Bounds, zoom: u8) -> TileRange {
    let (min_x, min_y) = tile_index(zoom, bounds.left + LL_EPSILON, bounds.top - LL_EPSILON);
    let (max_x, max_y) = tile_index(zoom, bounds.right - LL_EPSILON, bounds.bottom + LL_EPSILON);
    TileRange {
        zoom,
        min_x,
        max_x,
        min_y,
        max_y,
    }
}

/// Tile image formats supported by the MBTiles 1.3 `format` metadata key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TileFormat {
    Jpeg,
    Png,
    Webp,
}

impl TileFormat {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Self::Jpeg,
            "png" => Self::Png,
            "webp" => Self::Webp,
            _ => None?,
        })
    }

    /// File extension, also the MBTiles `format` metadata value.
    #[must_use]
    pub fn file_ext(&self) -> &'static str {
        match *self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }
}

impl Display for TileFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match *self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
        })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn quadkey_roundtrip() {
        let coord = TileCoord { z: 7, x: 36, y: 73 };
        assert_eq!(coord.quadkey(), "2102102");
        assert_eq!(TileCoord::from_quadkey("2102102"), Some(coord));
        assert_eq!(
            TileCoord::from_quadkey(""),
            Some(TileCoord { z: 0, x: 0, y: 0 })
        );
        assert_eq!(TileCoord::from_quadkey("0412"), None);
    }

    #[test]
    fn descendant_relation() {
        let parent = TileCoord { z: 2, x: 1, y: 2 };
        assert!(parent.is_descendant_or_self(parent));
        assert!(TileCoord { z: 4, x: 7, y: 11 }.is_descendant_or_self(parent));
        assert!(!TileCoord { z: 4, x: 8, y: 11 }.is_descendant_or_self(parent));
        assert!(!TileCoord { z: 1, x: 0, y: 1 }.is_descendant_or_self(parent));
    }

    #[test]
    fn tms_flip_roundtrips() {
        for y in [0_u32, 1, 5, 127] {
            assert_eq!(invert_y_value(7, invert_y_value(7, y)), y);
        }
        assert_eq!(invert_y_value(0, 0), 0);
        assert_eq!(invert_y_value(1, 0), 1);
    }

    #[test]
    fn mercator_roundtrip() {
        let (x, y) = wgs84_to_webmercator(12.5, 41.9);
        let (lng, lat) = webmercator_to_wgs84(x, y);
        assert_relative_eq!(lng, 12.5, epsilon = 1e-9);
        assert_relative_eq!(lat, 41.9, epsilon = 1e-9);
    }

    #[test]
    fn zoom_zero_tile_covers_world() {
        let bbox = TileCoord { z: 0, x: 0, y: 0 }.webmercator_bounds();
        assert_relative_eq!(bbox.min_x, -0.5 * EARTH_CIRCUMFERENCE);
        assert_relative_eq!(bbox.max_y, 0.5 * EARTH_CIRCUMFERENCE);
        assert_relative_eq!(bbox.max_x - bbox.min_x, EARTH_CIRCUMFERENCE);
    }

    #[test]
    fn tile_index_known_values() {
        assert_eq!(tile_index(0, 0.0, 0.0), (0, 0));
        assert_eq!(tile_index(1, 0.1, -0.1), (1, 1));
        assert_eq!(tile_index(1, -0.1, 0.1), (0, 0));
        // Clamped at the antimeridian and the projection's latitude limit.
        assert_eq!(tile_index(2, 180.0, -90.0), (3, 3));
        assert_eq!(tile_index(2, -180.0, 90.0), (0, 0));
    }

    #[test]
    fn world_ranges() {
        let world = Bounds::new(-180.0, -MAX_LATITUDE, 180.0, MAX_LATITUDE);
        let r0 = tile_range(&world, 0);
        assert_eq!(r0.count(), 1);
        let r1 = tile_range(&world, 1);
        assert_eq!(r1.count(), 4);
        let r3 = tile_range(&world, 3);
        assert_eq!(r3.count(), 64);
    }

    #[test]
    fn range_does_not_leak_across_tile_edges() {
        // Exactly one z1 tile: the north-west quadrant.
        let quadrant = Bounds::new(-180.0, 0.0, 0.0, MAX_LATITUDE);
        let r = tile_range(&quadrant, 1);
        assert_eq!((r.min_x, r.max_x, r.min_y, r.max_y), (0, 0, 0, 0));
    }

    #[test]
    fn range_restriction_by_quadkey() {
        let world = Bounds::new(-180.0, -MAX_LATITUDE, 180.0, MAX_LATITUDE);
        let covers = TileCoord { z: 1, x: 1, y: 0 };
        let restricted = tile_range(&world, 3)
            .restrict_to_descendants(covers)
            .expect("non-empty");
        assert_eq!(restricted.count(), 16);
        assert!(restricted.iter().all(|t| t.is_descendant_or_self(covers)));
        // Above the covers zoom nothing qualifies.
        assert_eq!(tile_range(&world, 0).restrict_to_descendants(covers), None);
    }

    #[test]
    fn row_major_iteration_order() {
        let r = TileRange {
            zoom: 2,
            min_x: 1,
            max_x: 2,
            min_y: 0,
            max_y: 1,
        };
        let tiles: Vec<_> = r.iter().map(|t| (t.x, t.y)).collect();
        assert_eq!(tiles, vec![(1, 0), (2, 0), (1, 1), (2, 1)]);
    }

    #[test]
    fn format_parsing() {
        assert_eq!(TileFormat::parse("JPEG"), Some(TileFormat::Jpeg));
        assert_eq!(TileFormat::parse("jpg"), Some(TileFormat::Jpeg));
        assert_eq!(TileFormat::parse("png"), Some(TileFormat::Png));
        assert_eq!(TileFormat::parse("webp"), Some(TileFormat::Webp));
        assert_eq!(TileFormat::parse("gif"), None);
        assert_eq!(TileFormat::Jpeg.file_ext(), "jpg");
        assert_eq!(TileFormat::Jpeg.to_string(), "jpeg");
    }
}
