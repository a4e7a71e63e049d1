//! Streams the tile coordinates of a planned export in deterministic order:
//! ascending zoom, then row-major within each zoom. Tiles whose bounding box
//! misses the cutline entirely are skipped here, before any rendering work
//! is queued.

use mbtiler_tile_utils::{TileCoord, TileRange};

use crate::cutline::{Coverage, Cutline};

pub struct TileEnumerator {
    ranges: std::vec::IntoIter<TileRange>,
    current: Option<OwnedRangeIter>,
    cutline: Option<Cutline>,
}

impl TileEnumerator {
    #[must_use]
    pub fn new(ranges: Vec<TileRange>, cutline: Option<Cutline>) -> Self {
        Self {
            ranges: ranges.into_iter(),
            current: None,
            cutline,
        }
    }
}

impl Iterator for TileEnumerator {
    type Item = TileCoord;

    fn next(&mut self) -> Option<TileCoord> {
        loop {
            if let Some(iter) = self.current.as_mut() {
                for coord in iter.by_ref() {
                    let admitted = match &self.cutline {
                        Some(cutline) => {
                            cutline.coverage(&coord.webmercator_bounds()) != Coverage::Outside
                        }
                        None => true,
                    };
                    if admitted {
                        return Some(coord);
                    }
                }
            }
            let range = self.ranges.next()?;
            self.current = Some(OwnedRangeIter::new(range));
        }
    }
}

/// Row-major iterator owning its range, so the enumerator can be sent to the
/// feeder thread.
struct OwnedRangeIter {
    range: TileRange,
    x: u32,
    y: u32,
    done: bool,
}

impl OwnedRangeIter {
    fn new(range: TileRange) -> Self {
        Self {
            x: range.min_x,
            y: range.min_y,
            done: false,
            range,
        }
    }
}

impl Iterator for OwnedRangeIter {
    type Item = TileCoord;

    fn next(&mut self) -> Option<TileCoord> {
        if self.done {
            return None;
        }
        let coord = TileCoord {
            z: self.range.zoom,
            x: self.x,
            y: self.y,
        };
        if self.x < self.range.max_x {
            self.x += 1;
        } else if self.y < self.range.max_y {
            self.x = self.range.min_x;
            self.y += 1;
        } else {
            self.done = true;
        }
        Some(coord)
    }
}

#[cfg(test)]
mod tests {
    use mbtiler_tile_utils::MAX_LATITUDE;
    use tilejson::Bounds;

    use crate::planner::plan_ranges;

    use super::*;

    fn world() -> Bounds {
        Bounds::new(-180.0, -MAX_LATITUDE, 180.0, MAX_LATITUDE)
    }

    #[test]
    fn emits_zoom_then_row_major_order() {
        let ranges = plan_ranges(&world(), 0, 1, None);
        let tiles: Vec<_> = TileEnumerator::new(ranges, None)
            .map(|t| (t.z, t.x, t.y))
            .collect();
        assert_eq!(
            tiles,
            vec![(0, 0, 0), (1, 0, 0), (1, 1, 0), (1, 0, 1), (1, 1, 1)]
        );
    }

    #[test]
    fn empty_plan_yields_nothing() {
        assert_eq!(TileEnumerator::new(Vec::new(), None).count(), 0);
    }

    #[test]
    fn cutline_prefilter_drops_disjoint_tiles() {
        // Square confined to the north-east quadrant.
        let square = r#"{"type": "Polygon",
            "coordinates": [[[1.0, 1.0], [80.0, 1.0], [80.0, 66.0], [1.0, 66.0], [1.0, 1.0]]]}"#;
        let cutline = Cutline::from_geojson_str(square).expect("valid geojson");
        let ranges = plan_ranges(&cutline.bounds(), 1, 1, None);
        let tiles: Vec<_> = TileEnumerator::new(ranges, Some(cutline)).collect();
        assert_eq!(tiles, vec![TileCoord { z: 1, x: 1, y: 0 }]);
    }

    #[test]
    fn single_tile_range() {
        let ranges = plan_ranges(&world(), 0, 0, None);
        let tiles: Vec<_> = TileEnumerator::new(ranges, None).collect();
        assert_eq!(tiles, vec![TileCoord { z: 0, x: 0, y: 0 }]);
    }
}
