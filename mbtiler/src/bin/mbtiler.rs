use std::path::PathBuf;

use clap::Parser;
use clap::builder::Styles;
use clap::builder::styling::AnsiColor;
use log::error;
use mbtiler::config::{DEFAULT_BATCH_SIZE, DEFAULT_TILE_SIZE};
use mbtiler::{Cutline, ExportConfig, LayerType, OpenMode, Resampling, WorkerStrategy};
use mbtiler_tile_utils::TileFormat;

/// Defines the styles used for the CLI help output.
const HELP_STYLES: Styles = Styles::styled()
    .header(AnsiColor::Blue.on_default().bold())
    .usage(AnsiColor::Blue.on_default().bold())
    .literal(AnsiColor::White.on_default())
    .placeholder(AnsiColor::Green.on_default());

#[derive(Parser, Debug)]
#[command(
    version,
    name = "mbtiler",
    about = "Export a georeferenced raster to an MBTiles tile pyramid",
    after_help = "Use RUST_LOG environment variable to control logging level, e.g. RUST_LOG=debug or RUST_LOG=mbtiler=debug. See https://docs.rs/env_logger/latest/env_logger/index.html#enabling-logging for more information.",
    styles = HELP_STYLES
)]
pub struct Args {
    /// Input raster dataset
    input: PathBuf,
    /// Output file; defaults to the input path with an `.mbtiles` extension
    output: Option<PathBuf>,
    /// Append tiles to an existing output file (the default when it exists)
    #[arg(long, conflicts_with = "overwrite")]
    append: bool,
    /// Replace the output file if it already exists
    #[arg(long)]
    overwrite: bool,
    /// MBTiles name metadata; defaults to the input file name
    #[arg(long)]
    title: Option<String>,
    /// MBTiles description metadata; defaults to the input path
    #[arg(long)]
    description: Option<String>,
    /// Mark the tileset as an overlay (the default)
    #[arg(long, conflicts_with = "baselayer")]
    overlay: bool,
    /// Mark the tileset as a base layer
    #[arg(long)]
    baselayer: bool,
    /// Tile image format
    #[arg(short, long, default_value = "jpeg", value_parser = parse_format)]
    format: TileFormat,
    /// Encoder creation option, e.g. QUALITY=90; may be repeated
    #[arg(long = "co", value_name = "NAME=VALUE")]
    creation_options: Vec<String>,
    /// Tile edge length in pixels
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE)]
    tile_size: u32,
    /// Zoom range as MIN..MAX or a single level; defaults to a range derived
    /// from the source extent
    #[arg(long, value_name = "MIN..MAX", value_parser = parse_zoom_range)]
    zoom_levels: Option<(u8, u8)>,
    /// Number of render workers
    #[arg(short = 'j', long, default_value_t = num_cpus::get())]
    workers: usize,
    /// Worker pool implementation
    #[arg(long = "implementation", value_enum, default_value_t)]
    strategy: WorkerStrategy,
    /// Source nodata value, overriding what the dataset declares
    #[arg(long)]
    src_nodata: Option<f64>,
    /// Nodata value for the warped tiles; requires a source nodata value
    #[arg(long)]
    dst_nodata: Option<f64>,
    /// Warp resampling kernel
    #[arg(long, value_enum, default_value_t)]
    resampling: Resampling,
    /// Render RGBA tiles (PNG and WEBP only)
    #[arg(long)]
    rgba: bool,
    /// Restrict output to tiles under this quadkey
    #[arg(long, value_name = "QUADKEY")]
    covers: Option<String>,
    /// GeoJSON file whose polygons clip the output and replace the extent
    #[arg(long, value_name = "FILE")]
    cutline: Option<PathBuf>,
    /// Source dataset open option; may be repeated
    #[arg(long = "oo", value_name = "NAME=VALUE")]
    open_options: Vec<String>,
    /// Warp engine option; may be repeated
    #[arg(long = "wo", value_name = "NAME=VALUE")]
    warp_options: Vec<String>,
    /// Store all-nodata tiles instead of skipping them
    #[arg(long)]
    include_empty_tiles: bool,
    /// Also write every tile image into this directory
    #[arg(long, value_name = "DIR")]
    image_dump: Option<PathBuf>,
    /// Tile writes per output transaction
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    /// Show a progress bar
    #[arg(long = "progress-bar", short = '#')]
    progress: bool,
}

fn parse_format(value: &str) -> Result<TileFormat, String> {
    TileFormat::parse(value).ok_or_else(|| format!("unsupported tile format {value:?}"))
}

fn parse_zoom_range(value: &str) -> Result<(u8, u8), String> {
    let parse = |v: &str| {
        v.parse::<u8>()
            .map_err(|_| format!("invalid zoom level {v:?}"))
    };
    match value.split_once("..") {
        Some((min, max)) => {
            let (min, max) = (parse(min)?, parse(max)?);
            if min > max {
                return Err(format!("zoom range {value:?} is inverted"));
            }
            Ok((min, max))
        }
        None => {
            let zoom = parse(value)?;
            Ok((zoom, zoom))
        }
    }
}

impl Args {
    fn into_config(self) -> anyhow::Result<(PathBuf, ExportConfig)> {
        let output = self
            .output
            .unwrap_or_else(|| self.input.with_extension("mbtiles"));
        // Appending to a file that does not exist yet creates it.
        let mode = if self.overwrite {
            OpenMode::Fresh { overwrite: true }
        } else if self.append && !output.exists() {
            OpenMode::Fresh { overwrite: false }
        } else if output.exists() {
            OpenMode::Append
        } else {
            OpenMode::Fresh { overwrite: false }
        };
        let default_title = self
            .input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let default_description = self.input.display().to_string();

        let mut config = ExportConfig::new(output, self.format);
        config.mode = mode;
        config.title = self.title.unwrap_or(default_title);
        config.description = self.description.unwrap_or(default_description);
        config.layer_type = match (self.overlay, self.baselayer) {
            (_, true) => LayerType::Baselayer,
            _ => LayerType::Overlay,
        };
        for option in &self.creation_options {
            let (name, value) = option.split_once('=').ok_or_else(|| {
                anyhow::anyhow!("malformed creation option {option:?}, expected NAME=VALUE")
            })?;
            config.format.apply_creation_option(name, value)?;
        }
        config.tile_size = self.tile_size;
        config.zoom_levels = self.zoom_levels;
        config.workers = self.workers;
        config.strategy = self.strategy;
        config.src_nodata = self.src_nodata;
        config.dst_nodata = self.dst_nodata;
        config.resampling = self.resampling;
        config.rgba = self.rgba;
        config.covers = self.covers;
        config.cutline = self
            .cutline
            .as_deref()
            .map(Cutline::from_path)
            .transpose()?;
        config.open_options = self.open_options;
        config.warp_options = self.warp_options;
        config.include_empty = self.include_empty_tiles;
        config.image_dump = self.image_dump;
        config.batch_size = self.batch_size;
        config.progress = self.progress;

        Ok((self.input, config))
    }
}

#[tokio::main]
async fn main() {
    let env = env_logger::Env::default().default_filter_or("mbtiler=info");
    env_logger::Builder::from_env(env)
        .format_indent(None)
        .format_module_path(false)
        .format_target(false)
        .format_timestamp(None)
        .init();

    if let Err(err) = main_int().await {
        error!("{err}");
        std::process::exit(1);
    }
}

#[cfg(feature = "gdal")]
async fn main_int() -> anyhow::Result<()> {
    use std::sync::Arc;

    use log::info;
    use mbtiler::TilePipeline;
    use mbtiler::warp::GdalSourceFactory;

    let args = Args::parse();
    let (input, config) = args.into_config()?;
    let source = Arc::new(GdalSourceFactory::new(&input, &config)?);
    let output = config.output.clone();
    let pipeline = TilePipeline::new(config, source);
    let summary = pipeline.run().await?;
    info!(
        "Finished {}: {} tiles stored, {} empty of {} rendered",
        output.display(),
        summary.stored,
        summary.empty,
        summary.rendered
    );
    Ok(())
}

#[cfg(not(feature = "gdal"))]
async fn main_int() -> anyhow::Result<()> {
    let _ = Args::parse();
    anyhow::bail!("this build has no raster support; rebuild with the `gdal` feature enabled")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zoom_range_forms() {
        assert_eq!(parse_zoom_range("4..10"), Ok((4, 10)));
        assert_eq!(parse_zoom_range("7"), Ok((7, 7)));
        assert!(parse_zoom_range("10..4").is_err());
        assert!(parse_zoom_range("a..b").is_err());
    }

    #[test]
    fn defaults_resolve_from_input() {
        let args = Args::parse_from(["mbtiler", "/data/scan.tif"]);
        let (input, config) = args.into_config().expect("valid");
        assert_eq!(input, PathBuf::from("/data/scan.tif"));
        assert_eq!(config.output, PathBuf::from("/data/scan.mbtiles"));
        assert_eq!(config.title, "scan.tif");
        assert_eq!(config.description, "/data/scan.tif");
        assert_eq!(config.format.format, TileFormat::Jpeg);
        assert_eq!(config.mode, OpenMode::Fresh { overwrite: false });
    }

    #[test]
    fn creation_options_feed_the_encoder() {
        let args = Args::parse_from([
            "mbtiler",
            "in.tif",
            "out.mbtiles",
            "--format",
            "jpeg",
            "--co",
            "QUALITY=90",
            "--zoom-levels",
            "3..8",
        ]);
        let (_, config) = args.into_config().expect("valid");
        assert_eq!(config.format.format, TileFormat::Jpeg);
        assert_eq!(config.format.quality, 90);
        assert_eq!(config.zoom_levels, Some((3, 8)));
    }

    #[test]
    fn overwrite_and_append_conflict() {
        assert!(Args::try_parse_from(["mbtiler", "in.tif", "--append", "--overwrite"]).is_err());
    }
}
