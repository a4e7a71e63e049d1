//! Export a georeferenced raster into an MBTiles tile pyramid.
//!
//! The pipeline plans a Web Mercator tile pyramid over the source extent,
//! warps and encodes tiles on a worker pool, and streams them into a
//! transactional SQLite container. The raster source sits behind the
//! [`render::SourceFactory`] trait; the `gdal` feature supplies the
//! GDAL-backed implementation used by the CLI.

pub mod config;
pub mod cutline;
pub mod enumerate;
pub mod errors;
pub mod pipeline;
pub mod planner;
pub mod render;
#[cfg(feature = "gdal")]
pub mod warp;
pub mod writer;

pub use config::{ExportConfig, FormatOptions, LayerType, OpenMode, Resampling, WorkerStrategy};
pub use cutline::Cutline;
pub use errors::{TilerError, TilerResult};
pub use pipeline::{RunSummary, TilePipeline};
