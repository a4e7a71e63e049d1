//! Tile rendering: warps one tile's worth of pixels out of the source,
//! applies the optional cutline mask, classifies empty tiles, and encodes
//! the result with the configured codec.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::codecs::webp::WebPEncoder;
use image::{ExtendedColorType, ImageEncoder};
use mbtiler_tile_utils::{TileCoord, TileFormat, WebMercatorBounds};
use tilejson::Bounds;

use crate::config::FormatOptions;
use crate::cutline::{Coverage, Cutline};
use crate::errors::{TilerError, TilerResult};

/// A warped tile: band-interleaved pixels plus a validity mask with one byte
/// per pixel where zero means nodata.
pub struct TileRaster {
    pub size: u32,
    pub bands: u8,
    pub pixels: Vec<u8>,
    pub mask: Vec<u8>,
}

impl TileRaster {
    #[must_use]
    pub fn filled(size: u32, bands: u8, value: u8) -> Self {
        let pixel_count = (size as usize) * (size as usize);
        Self {
            size,
            bands,
            pixels: vec![value; pixel_count * usize::from(bands)],
            mask: vec![255; pixel_count],
        }
    }

    /// Whether every pixel is nodata.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mask.iter().all(|&m| m == 0)
    }
}

/// Handle to the source raster, shared across the worker pool. Opening is
/// split from warping because dataset handles are not safe to share between
/// threads; each worker opens its own.
pub trait SourceFactory: Send + Sync {
    /// Geographic bounds of the source extent.
    fn bounds(&self) -> TilerResult<Bounds>;

    fn band_count(&self) -> usize;

    /// Nodata value declared by the source, if any.
    fn nodata(&self) -> Option<f64>;

    fn open(&self) -> TilerResult<Box<dyn WarpSource>>;
}

/// A per-worker warping handle.
pub trait WarpSource: Send {
    /// Reproject the source into the given Web Mercator bounding box at the
    /// configured tile size.
    fn warp_tile(&mut self, bounds: &WebMercatorBounds) -> TilerResult<TileRaster>;
}

/// A rendered tile on its way to the writer. `data` is `None` for an empty
/// tile that the run is configured to skip.
pub struct RenderedTile {
    pub coord: TileCoord,
    pub data: Option<Vec<u8>>,
}

pub struct TileRenderer {
    source: Box<dyn WarpSource>,
    format: FormatOptions,
    tile_size: u32,
    bands: u8,
    cutline: Option<Cutline>,
    include_empty: bool,
}

impl TileRenderer {
    #[must_use]
    pub fn new(
        source: Box<dyn WarpSource>,
        format: FormatOptions,
        tile_size: u32,
        bands: u8,
        cutline: Option<Cutline>,
        include_empty: bool,
    ) -> Self {
        Self {
            source,
            format,
            tile_size,
            bands,
            cutline,
            include_empty,
        }
    }

    pub fn render(&mut self, coord: TileCoord) -> TilerResult<RenderedTile> {
        let bounds = coord.webmercator_bounds();
        let mut raster = self.source.warp_tile(&bounds)?;
        if raster.size != self.tile_size || raster.bands != self.bands {
            return Err(TilerError::render(
                coord,
                format!(
                    "warp produced a {}px {}-band raster, expected {}px {}-band",
                    raster.size, raster.bands, self.tile_size, self.bands
                ),
            ));
        }
        if let Some(cutline) = &self.cutline {
            apply_cutline(cutline, &bounds, &mut raster);
        }
        if raster.is_empty() && !self.include_empty {
            return Ok(RenderedTile { coord, data: None });
        }
        let data = encode_tile(&self.format, &raster).map_err(|e| TilerError::Encode(coord, e))?;
        Ok(RenderedTile {
            coord,
            data: Some(data),
        })
    }
}

/// Zero out pixels whose centers fall outside the cutline shape. Tiles fully
/// inside need no per-pixel work; tiles fully outside are blanked wholesale.
fn apply_cutline(cutline: &Cutline, bounds: &WebMercatorBounds, raster: &mut TileRaster) {
    match cutline.coverage(bounds) {
        Coverage::Full => {}
        Coverage::Outside => {
            raster.pixels.fill(0);
            raster.mask.fill(0);
        }
        Coverage::Partial => {
            let size = raster.size as usize;
            let bands = usize::from(raster.bands);
            let pixel_span = (bounds.max_x - bounds.min_x) / f64::from(raster.size);
            for row in 0..size {
                let y = bounds.max_y - (row as f64 + 0.5) * pixel_span;
                for col in 0..size {
                    let x = bounds.min_x + (col as f64 + 0.5) * pixel_span;
                    if !cutline.covers_point(x, y) {
                        let pixel = row * size + col;
                        raster.mask[pixel] = 0;
                        raster.pixels[pixel * bands..(pixel + 1) * bands].fill(0);
                    }
                }
            }
        }
    }
}

/// Encode an RGB or RGBA raster with the configured codec.
pub fn encode_tile(format: &FormatOptions, raster: &TileRaster) -> image::ImageResult<Vec<u8>> {
    let color = match raster.bands {
        4 => ExtendedColorType::Rgba8,
        _ => ExtendedColorType::Rgb8,
    };
    let mut buf = Vec::new();
    match format.format {
        TileFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(Cursor::new(&mut buf), format.quality);
            encoder.write_image(&raster.pixels, raster.size, raster.size, color)?;
        }
        TileFormat::Png => {
            let compression = match format.zlevel {
                1..=3 => CompressionType::Fast,
                7..=9 => CompressionType::Best,
                _ => CompressionType::Default,
            };
            let encoder =
                PngEncoder::new_with_quality(Cursor::new(&mut buf), compression, FilterType::Adaptive);
            encoder.write_image(&raster.pixels, raster.size, raster.size, color)?;
        }
        TileFormat::Webp => {
            let encoder = WebPEncoder::new_lossless(Cursor::new(&mut buf));
            encoder.write_image(&raster.pixels, raster.size, raster.size, color)?;
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Produces a constant-color tile, with an optional all-nodata mask.
    pub(crate) struct FlatSource {
        pub size: u32,
        pub bands: u8,
        pub value: u8,
        pub empty: bool,
    }

    impl WarpSource for FlatSource {
        fn warp_tile(&mut self, _bounds: &WebMercatorBounds) -> TilerResult<TileRaster> {
            let mut raster = TileRaster::filled(self.size, self.bands, self.value);
            if self.empty {
                raster.mask.fill(0);
            }
            Ok(raster)
        }
    }

    fn renderer(source: FlatSource, format: TileFormat, include_empty: bool) -> TileRenderer {
        let (size, bands) = (source.size, source.bands);
        TileRenderer::new(
            Box::new(source),
            FormatOptions::new(format),
            size,
            bands,
            None,
            include_empty,
        )
    }

    #[test]
    fn renders_png_tile() {
        let source = FlatSource { size: 64, bands: 3, value: 90, empty: false };
        let mut renderer = renderer(source, TileFormat::Png, false);
        let tile = renderer
            .render(TileCoord { z: 0, x: 0, y: 0 })
            .expect("render");
        let data = tile.data.expect("non-empty");
        let decoded = image::load_from_memory(&data).expect("valid png");
        assert_eq!(decoded.width(), 64);
        assert_eq!(decoded.to_rgb8().get_pixel(10, 10).0, [90, 90, 90]);
    }

    #[test]
    fn empty_tile_skipped_by_default() {
        let source = FlatSource { size: 64, bands: 3, value: 0, empty: true };
        let mut renderer = renderer(source, TileFormat::Png, false);
        let tile = renderer
            .render(TileCoord { z: 0, x: 0, y: 0 })
            .expect("render");
        assert!(tile.data.is_none());
    }

    #[test]
    fn empty_tile_encoded_when_requested() {
        let source = FlatSource { size: 64, bands: 3, value: 0, empty: true };
        let mut renderer = renderer(source, TileFormat::Png, true);
        let tile = renderer
            .render(TileCoord { z: 0, x: 0, y: 0 })
            .expect("render");
        assert!(tile.data.is_some());
    }

    #[test]
    fn mismatched_tile_size_is_a_render_error() {
        let source = FlatSource { size: 64, bands: 3, value: 0, empty: false };
        let mut renderer = TileRenderer::new(
            Box::new(source),
            FormatOptions::new(TileFormat::Png),
            256,
            3,
            None,
            false,
        );
        assert!(matches!(
            renderer.render(TileCoord { z: 0, x: 0, y: 0 }),
            Err(TilerError::Render { .. })
        ));
    }

    #[test]
    fn jpeg_and_webp_encode() {
        for format in [TileFormat::Jpeg, TileFormat::Webp] {
            let source = FlatSource { size: 32, bands: 3, value: 128, empty: false };
            let mut renderer = renderer(source, format, false);
            let tile = renderer
                .render(TileCoord { z: 1, x: 0, y: 1 })
                .expect("render");
            assert!(tile.data.expect("non-empty").len() > 8);
        }
    }

    #[test]
    fn rgba_png_keeps_alpha() {
        let source = FlatSource { size: 16, bands: 4, value: 200, empty: false };
        let mut renderer = renderer(source, TileFormat::Png, false);
        let tile = renderer
            .render(TileCoord { z: 0, x: 0, y: 0 })
            .expect("render");
        let decoded = image::load_from_memory(&tile.data.expect("non-empty")).expect("valid png");
        assert_eq!(decoded.color(), image::ColorType::Rgba8);
    }

    #[test]
    fn cutline_masks_outside_pixels() {
        // Shape covering only the eastern hemisphere.
        let east = r#"{"type": "Polygon",
            "coordinates": [[[0.0, -80.0], [179.0, -80.0], [179.0, 80.0], [0.0, 80.0], [0.0, -80.0]]]}"#;
        let cutline = Cutline::from_geojson_str(east).expect("valid geojson");
        let source = FlatSource { size: 64, bands: 3, value: 255, empty: false };
        let mut renderer = TileRenderer::new(
            Box::new(source),
            FormatOptions::new(TileFormat::Png),
            64,
            3,
            Some(cutline),
            false,
        );
        let tile = renderer
            .render(TileCoord { z: 0, x: 0, y: 0 })
            .expect("render");
        let decoded = image::load_from_memory(&tile.data.expect("non-empty"))
            .expect("valid png")
            .to_rgb8();
        // Western half masked to black, eastern half untouched.
        assert_eq!(decoded.get_pixel(5, 32).0, [0, 0, 0]);
        assert_eq!(decoded.get_pixel(60, 32).0, [255, 255, 255]);
    }
}
