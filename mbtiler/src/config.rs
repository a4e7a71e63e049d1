use std::path::PathBuf;

#[cfg(feature = "cli")]
use clap::ValueEnum;
use mbtiler_tile_utils::{TileFormat, MAX_ZOOM};

use crate::cutline::Cutline;
use crate::errors::{TilerError, TilerResult};

pub const DEFAULT_TILE_SIZE: u32 = 256;
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// How the destination container is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Create a new container. The path must not pre-exist unless
    /// `overwrite` is set, in which case the old file is unlinked first.
    Fresh { overwrite: bool },
    /// Open an existing container, validate its schema, and upsert into it.
    Append,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(ValueEnum))]
pub enum LayerType {
    #[default]
    Overlay,
    Baselayer,
}

impl LayerType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match *self {
            Self::Overlay => "overlay",
            Self::Baselayer => "baselayer",
        }
    }
}

/// Resampling kernels accepted by the warp engine. The names mirror the
/// engine's own kernel list; `gauss` exists only for overview building and
/// is rejected during validation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(ValueEnum))]
pub enum Resampling {
    #[default]
    Nearest,
    Bilinear,
    Cubic,
    CubicSpline,
    Lanczos,
    Average,
    Mode,
    Gauss,
    Max,
    Min,
    Med,
    Q1,
    Q3,
    Rms,
}

/// Worker pool strategy, selected once at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(ValueEnum))]
pub enum WorkerStrategy {
    /// Worker loops on the async runtime's blocking thread pool.
    #[default]
    SharedPool,
    /// One dedicated OS thread per worker, each owning its source handle
    /// for the lifetime of the run.
    IsolatedThreads,
}

/// Per-format encoder settings, fed from `--co NAME=VALUE` creation options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FormatOptions {
    pub format: TileFormat,
    /// JPEG quality, 10..=100.
    pub quality: u8,
    /// PNG zlib compression level, 1..=9.
    pub zlevel: u8,
    /// Lossless WEBP opt-in.
    pub lossless: bool,
    quality_overridden: bool,
}

impl FormatOptions {
    #[must_use]
    pub fn new(format: TileFormat) -> Self {
        Self {
            format,
            quality: 75,
            zlevel: 6,
            lossless: false,
            quality_overridden: false,
        }
    }

    /// Apply one `NAME=VALUE` creation option. Unknown names are rejected
    /// rather than ignored: a typo here would otherwise silently change the
    /// whole pyramid's encoding.
    pub fn apply_creation_option(&mut self, name: &str, value: &str) -> TilerResult<()> {
        match name.to_ascii_uppercase().as_str() {
            "QUALITY" => {
                self.quality = value
                    .parse()
                    .map_err(|_| TilerError::Config(format!("invalid QUALITY value {value:?}")))?;
                self.quality_overridden = true;
            }
            "ZLEVEL" => {
                self.zlevel = value
                    .parse()
                    .map_err(|_| TilerError::Config(format!("invalid ZLEVEL value {value:?}")))?;
            }
            "LOSSLESS" => {
                self.lossless = value.eq_ignore_ascii_case("true") || value == "1";
            }
            other => {
                return Err(TilerError::Config(format!(
                    "unsupported creation option {other}"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn validate(&self) -> TilerResult<()> {
        if !(10..=100).contains(&self.quality) {
            return Err(TilerError::Config(format!(
                "QUALITY must be within 10..=100, got {}",
                self.quality
            )));
        }
        if !(1..=9).contains(&self.zlevel) {
            return Err(TilerError::Config(format!(
                "ZLEVEL must be within 1..=9, got {}",
                self.zlevel
            )));
        }
        if self.format == TileFormat::Webp && self.quality_overridden {
            return Err(TilerError::Config(
                "the WEBP encoder is lossless-only; QUALITY is not supported".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything one export run needs, owned by the pipeline. Renderers receive
/// read-only copies of the relevant parts; nothing here is mutated after
/// validation.
#[derive(Clone, Debug)]
pub struct ExportConfig {
    pub output: PathBuf,
    pub mode: OpenMode,
    /// MBTiles `name` metadata; defaults to the input file name in the CLI.
    pub title: String,
    pub description: String,
    pub layer_type: LayerType,
    pub format: FormatOptions,
    pub tile_size: u32,
    /// `(min, max)`; `None` resolves to the default single zoom at which the
    /// extent fits one tile.
    pub zoom_levels: Option<(u8, u8)>,
    pub workers: usize,
    pub strategy: WorkerStrategy,
    pub src_nodata: Option<f64>,
    pub dst_nodata: Option<f64>,
    pub resampling: Resampling,
    pub rgba: bool,
    /// Quadkey restricting output to one subtree of the pyramid.
    pub covers: Option<String>,
    pub cutline: Option<Cutline>,
    /// `NAME=VALUE` options for opening the source dataset.
    pub open_options: Vec<String>,
    /// `NAME=VALUE` options passed through to the warp engine.
    pub warp_options: Vec<String>,
    pub include_empty: bool,
    pub image_dump: Option<PathBuf>,
    pub progress: bool,
    /// Tile rows per write transaction.
    pub batch_size: usize,
    /// In-flight job window; `None` means `workers * 3`.
    pub queue_len: Option<usize>,
}

impl ExportConfig {
    #[must_use]
    pub fn new(output: PathBuf, format: TileFormat) -> Self {
        Self {
            output,
            mode: OpenMode::Fresh { overwrite: false },
            title: String::new(),
            description: String::new(),
            layer_type: LayerType::default(),
            format: FormatOptions::new(format),
            tile_size: DEFAULT_TILE_SIZE,
            zoom_levels: None,
            workers: num_cpus::get(),
            strategy: WorkerStrategy::default(),
            src_nodata: None,
            dst_nodata: None,
            resampling: Resampling::default(),
            rgba: false,
            covers: None,
            cutline: None,
            open_options: Vec::new(),
            warp_options: Vec::new(),
            include_empty: false,
            image_dump: None,
            progress: false,
            batch_size: DEFAULT_BATCH_SIZE,
            queue_len: None,
        }
    }

    /// Number of bands rendered into each tile.
    #[must_use]
    pub fn band_count(&self) -> u8 {
        if self.rgba {
            4
        } else {
            3
        }
    }

    #[must_use]
    pub fn queue_len_or_default(&self) -> usize {
        self.queue_len.unwrap_or(self.workers * 3).max(1)
    }

    /// Fail-fast validation of the whole configuration against the source
    /// dataset's shape, run before any container or rendering work starts.
    pub fn validate(&self, source_bands: usize, source_nodata: Option<f64>) -> TilerResult<()> {
        self.format.validate()?;
        if self.tile_size == 0 {
            return Err(TilerError::Config("tile size must be positive".to_string()));
        }
        if self.workers == 0 {
            return Err(TilerError::Config("worker count must be positive".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TilerError::Config("batch size must be positive".to_string()));
        }
        if let Some((min_zoom, max_zoom)) = self.zoom_levels {
            if min_zoom > max_zoom || max_zoom > MAX_ZOOM {
                return Err(TilerError::Config(format!(
                    "invalid zoom range {min_zoom}..{max_zoom}"
                )));
            }
        }
        if self.rgba && self.format.format == TileFormat::Jpeg {
            return Err(TilerError::Config(
                "RGBA output is not possible with JPEG format".to_string(),
            ));
        }
        if self.resampling == Resampling::Gauss {
            return Err(TilerError::Config(
                "gauss resampling is not supported by the warp engine".to_string(),
            ));
        }
        if source_bands < usize::from(self.band_count()) {
            return Err(TilerError::Config(format!(
                "input dataset has {source_bands} bands, at least {} required",
                self.band_count()
            )));
        }
        if self.dst_nodata.is_some() && self.src_nodata.is_none() && source_nodata.is_none() {
            return Err(TilerError::Config(
                "src-nodata must be provided because dst-nodata is set".to_string(),
            ));
        }
        if let Some(quadkey) = &self.covers {
            if mbtiler_tile_utils::TileCoord::from_quadkey(quadkey).is_none() {
                return Err(TilerError::Config(format!("invalid quadkey {quadkey:?}")));
            }
        }
        Ok(())
    }
}
