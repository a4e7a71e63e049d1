//! Geographic extent handling and zoom planning: clamps the source extent to
//! what the Web Mercator grid can address, picks a default zoom range when
//! the caller gives none, and sizes the job ahead of time.

use mbtiler_tile_utils::{tile_range, TileCoord, TileRange, MAX_LATITUDE, MAX_ZOOM};
use tilejson::Bounds;

use crate::errors::{TilerError, TilerResult};

/// Longitudes are pulled strictly inside the antimeridian so the tile index
/// math never wraps.
const LNG_EPSILON: f64 = 1.0e-10;

/// Height of the full Web Mercator extent in degrees of latitude.
const MERCATOR_LAT_SPAN: f64 = 2.0 * MAX_LATITUDE;

/// Clamp geographic bounds to the addressable Web Mercator extent. Errors
/// when nothing of the extent survives, which happens for rasters lying
/// entirely above the projection's latitude limit.
pub fn constrain_bounds(bounds: &Bounds) -> TilerResult<Bounds> {
    let constrained = Bounds::new(
        bounds.left.max(-180.0 + LNG_EPSILON),
        bounds.bottom.max(-MAX_LATITUDE),
        bounds.right.min(180.0 - LNG_EPSILON),
        bounds.top.min(MAX_LATITUDE),
    );
    if constrained.left >= constrained.right || constrained.bottom >= constrained.top {
        return Err(TilerError::Reprojection(format!(
            "extent {bounds} does not intersect the Web Mercator domain"
        )));
    }
    Ok(constrained)
}

/// Default zoom range for an extent: the zooms at which the extent's width
/// and height each span roughly one tile. For extents with an aspect ratio
/// near one this collapses to a single level.
#[must_use]
pub fn default_zoom_range(bounds: &Bounds) -> (u8, u8) {
    let zw = (360.0 / (bounds.right - bounds.left)).log2().round();
    let zh = (MERCATOR_LAT_SPAN / (bounds.top - bounds.bottom)).log2().round();
    let clamp = |z: f64| z.clamp(0.0, f64::from(MAX_ZOOM)) as u8;
    let (zw, zh) = (clamp(zw), clamp(zh));
    (zw.min(zh), zw.max(zh))
}

/// The per-zoom tile ranges for one export, already restricted to the
/// `covers` subtree when one is given.
pub fn plan_ranges(
    bounds: &Bounds,
    min_zoom: u8,
    max_zoom: u8,
    covers: Option<TileCoord>,
) -> Vec<TileRange> {
    (min_zoom..=max_zoom)
        .filter_map(|zoom| {
            let range = tile_range(bounds, zoom);
            match covers {
                Some(ancestor) => range.restrict_to_descendants(ancestor),
                None => Some(range),
            }
        })
        .collect()
}

/// Total number of tiles the plan will enumerate.
#[must_use]
pub fn estimate_tile_count(ranges: &[TileRange]) -> u64 {
    ranges.iter().map(TileRange::count).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constrain_clamps_poles_and_antimeridian() {
        let raw = Bounds::new(-200.0, -90.0, 200.0, 90.0);
        let constrained = constrain_bounds(&raw).expect("non-degenerate");
        assert!(constrained.left > -180.0);
        assert!(constrained.right < 180.0);
        assert_eq!(constrained.bottom, -MAX_LATITUDE);
        assert_eq!(constrained.top, MAX_LATITUDE);
    }

    #[test]
    fn constrain_rejects_extent_outside_domain() {
        let arctic = Bounds::new(-10.0, 86.0, 10.0, 89.0);
        assert!(matches!(
            constrain_bounds(&arctic),
            Err(TilerError::Reprojection(_))
        ));
    }

    #[test]
    fn inner_extent_untouched() {
        let raw = Bounds::new(-122.7, 45.5, -122.5, 45.6);
        let constrained = constrain_bounds(&raw).expect("non-degenerate");
        assert_eq!(constrained, raw);
    }

    #[test]
    fn default_zooms_for_world_extent() {
        let world = Bounds::new(-180.0, -MAX_LATITUDE, 180.0, MAX_LATITUDE);
        assert_eq!(default_zoom_range(&world), (0, 0));
    }

    #[test]
    fn default_zooms_for_small_extent() {
        // One degree square: 360/1 and 170.1/1 both land near 2^8.
        let bounds = Bounds::new(12.0, 45.0, 13.0, 46.0);
        let (min_zoom, max_zoom) = default_zoom_range(&bounds);
        assert_eq!(min_zoom, 7);
        assert_eq!(max_zoom, 8);
    }

    #[test]
    fn default_zooms_for_wide_extent() {
        // Much wider than tall, so the two axes disagree.
        let bounds = Bounds::new(-90.0, 0.0, 90.0, 10.0);
        let (min_zoom, max_zoom) = default_zoom_range(&bounds);
        assert!(min_zoom < max_zoom);
        assert_eq!(min_zoom, 1);
        assert_eq!(max_zoom, 4);
    }

    #[test]
    fn plan_counts_world_pyramid() {
        let world = Bounds::new(-180.0, -MAX_LATITUDE, 180.0, MAX_LATITUDE);
        let ranges = plan_ranges(&world, 0, 2, None);
        assert_eq!(ranges.len(), 3);
        assert_eq!(estimate_tile_count(&ranges), 1 + 4 + 16);
    }

    #[test]
    fn plan_respects_covers_subtree() {
        let world = Bounds::new(-180.0, -MAX_LATITUDE, 180.0, MAX_LATITUDE);
        let covers = TileCoord { z: 2, x: 3, y: 1 };
        let ranges = plan_ranges(&world, 0, 3, Some(covers));
        // z0 and z1 fall away entirely; z2 keeps one tile, z3 four.
        assert_eq!(ranges.len(), 2);
        assert_eq!(estimate_tile_count(&ranges), 1 + 4);
        for range in &ranges {
            assert!(range.iter().all(|t| t.is_descendant_or_self(covers)));
        }
    }
}
