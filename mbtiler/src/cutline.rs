//! Optional GeoJSON cutline restricting output to an arbitrary footprint.
//! The shape is parsed once in geographic coordinates, then carried in Web
//! Mercator meters so tile and pixel tests need no further reprojection.

use std::fmt;
use std::path::Path;

use geo::{BoundingRect, Contains, Intersects, MapCoords, MultiPolygon, Point, Rect};
use geojson::GeoJson;
use mbtiler_tile_utils::{wgs84_to_webmercator, WebMercatorBounds};
use tilejson::Bounds;

use crate::errors::{TilerError, TilerResult};

/// How a tile's bounding box relates to the cutline shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coverage {
    /// No overlap; the tile is empty by definition.
    Outside,
    /// The shape crosses the tile, so pixels need individual masking.
    Partial,
    /// The tile lies entirely inside the shape.
    Full,
}

#[derive(Clone, Debug)]
pub struct Cutline {
    /// The shape in Web Mercator meters.
    shape: MultiPolygon<f64>,
    /// Cached bounding box of `shape`, used as a cheap pre-test.
    bbox: Rect<f64>,
    /// Geographic bounds of the shape; these replace the source extent when
    /// planning tile ranges.
    bounds: Bounds,
}

impl fmt::Display for Cutline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cutline of {} polygon(s) over {}", self.shape.0.len(), self.bounds)
    }
}

impl Cutline {
    pub fn from_path(path: &Path) -> TilerResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_geojson_str(&raw)
    }

    pub fn from_geojson_str(raw: &str) -> TilerResult<Self> {
        let geojson: GeoJson = raw.parse()?;
        let mut polygons = Vec::new();
        collect_polygons(&geojson, &mut polygons)?;
        if polygons.is_empty() {
            return Err(TilerError::Cutline(
                "no Polygon or MultiPolygon geometry found".to_string(),
            ));
        }
        let geographic = MultiPolygon::new(polygons);
        let geo_bbox = geographic
            .bounding_rect()
            .ok_or_else(|| TilerError::Cutline("cutline geometry is empty".to_string()))?;
        let bounds = Bounds::new(
            geo_bbox.min().x,
            geo_bbox.min().y,
            geo_bbox.max().x,
            geo_bbox.max().y,
        );
        let shape = geographic.map_coords(|c| {
            let (x, y) = wgs84_to_webmercator(c.x, c.y);
            geo::Coord { x, y }
        });
        let bbox = shape
            .bounding_rect()
            .ok_or_else(|| TilerError::Cutline("cutline geometry is empty".to_string()))?;
        Ok(Self { shape, bbox, bounds })
    }

    /// Geographic bounds of the shape.
    #[must_use]
    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    #[must_use]
    pub fn coverage(&self, tile: &WebMercatorBounds) -> Coverage {
        let rect = Rect::new(
            geo::Coord { x: tile.min_x, y: tile.min_y },
            geo::Coord { x: tile.max_x, y: tile.max_y },
        );
        if !self.bbox.intersects(&rect) || !self.shape.intersects(&rect) {
            return Coverage::Outside;
        }
        if self.shape.contains(&rect.to_polygon()) {
            Coverage::Full
        } else {
            Coverage::Partial
        }
    }

    /// Whether a point in Web Mercator meters falls on or inside the shape.
    #[must_use]
    pub fn covers_point(&self, x: f64, y: f64) -> bool {
        let point = Point::new(x, y);
        self.bbox.intersects(&point) && self.shape.intersects(&point)
    }
}

fn collect_polygons(geojson: &GeoJson, out: &mut Vec<geo::Polygon<f64>>) -> TilerResult<()> {
    match geojson {
        GeoJson::Geometry(geometry) => collect_from_geometry(geometry, out),
        GeoJson::Feature(feature) => match &feature.geometry {
            Some(geometry) => collect_from_geometry(geometry, out),
            None => Ok(()),
        },
        GeoJson::FeatureCollection(collection) => {
            for feature in &collection.features {
                if let Some(geometry) = &feature.geometry {
                    collect_from_geometry(geometry, out)?;
                }
            }
            Ok(())
        }
    }
}

fn collect_from_geometry(
    geometry: &geojson::Geometry,
    out: &mut Vec<geo::Polygon<f64>>,
) -> TilerResult<()> {
    match geo::Geometry::<f64>::try_from(geometry)? {
        geo::Geometry::Polygon(polygon) => out.push(polygon),
        geo::Geometry::MultiPolygon(multi) => out.extend(multi),
        geo::Geometry::GeometryCollection(collection) => {
            for member in collection {
                match member {
                    geo::Geometry::Polygon(polygon) => out.push(polygon),
                    geo::Geometry::MultiPolygon(multi) => out.extend(multi),
                    other => {
                        return Err(TilerError::Cutline(format!(
                            "unsupported cutline geometry type {other:?}"
                        )));
                    }
                }
            }
        }
        other => {
            return Err(TilerError::Cutline(format!(
                "unsupported cutline geometry type {other:?}"
            )));
        }
    }
    Ok(())
}
