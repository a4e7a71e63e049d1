use std::path::PathBuf;

use mbtiler_tile_utils::TileCoord;

#[derive(thiserror::Error, Debug)]
pub enum TilerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Output file {} already exists; use overwrite to replace it", .0.display())]
    OutputExists(PathBuf),

    #[error("Cannot append to {}: file does not exist", .0.display())]
    OutputMissing(PathBuf),

    #[error("File {} does not have a valid MBTiles schema", .0.display())]
    SchemaMismatch(PathBuf),

    #[error("Unable to reproject the source extent into the tiling scheme: {0}")]
    Reprojection(String),

    #[error("Failed to render tile {coord}: {message}")]
    Render { coord: TileCoord, message: String },

    #[error("Failed to encode tile {0}: {1}")]
    Encode(TileCoord, #[source] image::ImageError),

    #[error("Invalid cutline: {0}")]
    Cutline(String),

    #[error(transparent)]
    GeojsonError(#[from] geojson::Error),

    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[cfg(feature = "gdal")]
    #[error(transparent)]
    GdalError(#[from] gdal::errors::GdalError),

    #[error("Worker pool failure: {0}")]
    WorkerPanic(String),
}

impl TilerError {
    /// Wrap a warp/codec failure on a specific tile. Render failures are
    /// fatal for the whole run; a broken option would otherwise silently
    /// produce an incomplete pyramid.
    pub fn render(coord: TileCoord, message: impl Into<String>) -> Self {
        Self::Render {
            coord,
            message: message.into(),
        }
    }
}

pub type TilerResult<T> = Result<T, TilerError>;
