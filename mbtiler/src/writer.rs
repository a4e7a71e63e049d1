//! The MBTiles container writer. A single connection owns the output file:
//! tiles arrive in XYZ coordinates and are stored under the TMS row
//! numbering the format requires, batched into write transactions.

use std::path::PathBuf;

use log::{debug, info};
use mbtiler_tile_utils::{invert_y_value, TileCoord, TileFormat};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use tilejson::Bounds;

use crate::config::{ExportConfig, OpenMode};
use crate::errors::{TilerError, TilerResult};

/// MBTiles schema revision written into the `version` metadata row.
const MBTILES_VERSION: &str = "1.3";

const CREATE_SCHEMA: &str = "
CREATE TABLE metadata (
    name  text NOT NULL PRIMARY KEY,
    value text);
CREATE TABLE tiles (
    zoom_level  integer NOT NULL,
    tile_column integer NOT NULL,
    tile_row    integer NOT NULL,
    tile_data   blob,
    PRIMARY KEY(zoom_level, tile_column, tile_row));";

/// One boolean over `sqlite_master` and `pragma_table_info`: both tables
/// exist and the tiles columns carry the expected types.
const VALIDATE_SCHEMA: &str = "
SELECT (
    SELECT COUNT(*) = 2
    FROM sqlite_master
    WHERE name IN ('tiles', 'metadata') AND type IN ('table', 'view')
) AND (
    SELECT COUNT(*) = 4
    FROM pragma_table_info('tiles')
    WHERE (name = 'zoom_level' AND type = 'INTEGER')
       OR (name = 'tile_column' AND type = 'INTEGER')
       OR (name = 'tile_row' AND type = 'INTEGER')
       OR (name = 'tile_data' AND type = 'BLOB')
);";

pub struct MbtWriter {
    conn: SqliteConnection,
    path: PathBuf,
    format: TileFormat,
    image_dump: Option<PathBuf>,
    batch_size: usize,
    pending: usize,
    in_tx: bool,
    stored: u64,
    appending: bool,
}

impl MbtWriter {
    /// Open the output container according to the configured mode. Runs
    /// before any rendering so a bad destination fails the run immediately.
    pub async fn open(config: &ExportConfig) -> TilerResult<Self> {
        let path = config.output.clone();
        let appending = match config.mode {
            OpenMode::Fresh { overwrite } => {
                if path.exists() {
                    if !overwrite {
                        return Err(TilerError::OutputExists(path));
                    }
                    std::fs::remove_file(&path)?;
                }
                false
            }
            OpenMode::Append => {
                if !path.exists() {
                    return Err(TilerError::OutputMissing(path));
                }
                true
            }
        };

        let opts = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(!appending);
        let mut conn = SqliteConnection::connect_with(&opts).await?;

        if appending {
            let valid: bool = sqlx::query_scalar(VALIDATE_SCHEMA)
                .fetch_one(&mut conn)
                .await?;
            if !valid {
                return Err(TilerError::SchemaMismatch(path));
            }
            debug!("Appending to existing container {}", path.display());
        } else {
            sqlx::raw_sql(CREATE_SCHEMA).execute(&mut conn).await?;
            debug!("Created new container {}", path.display());
        }

        if let Some(dump_dir) = &config.image_dump {
            std::fs::create_dir_all(dump_dir)?;
        }

        let mut writer = Self {
            conn,
            path,
            format: config.format.format,
            image_dump: config.image_dump.clone(),
            batch_size: config.batch_size,
            pending: 0,
            in_tx: false,
            stored: 0,
            appending,
        };
        writer.write_descriptive_metadata(config).await?;
        Ok(writer)
    }

    /// Descriptive metadata goes in up front; the extent summary only lands
    /// at finalization, so an aborted run never looks complete.
    async fn write_descriptive_metadata(&mut self, config: &ExportConfig) -> TilerResult<()> {
        let rows = [
            ("name", config.title.as_str()),
            ("description", config.description.as_str()),
            ("type", config.layer_type.as_str()),
            ("version", MBTILES_VERSION),
            ("format", self.format.file_ext()),
        ];
        for (name, value) in rows {
            self.upsert_metadata(name, value).await?;
        }
        Ok(())
    }

    /// Union the extent summary with any prior values on append, so
    /// successive runs into one file stay self-consistent.
    async fn resolve_extent(
        &mut self,
        bounds: Bounds,
        min_zoom: u8,
        max_zoom: u8,
    ) -> TilerResult<(Bounds, u8, u8)> {
        if self.appending {
            let bounds = match self.metadata_value("bounds").await?.and_then(parse_bounds) {
                Some(existing) => Bounds::new(
                    existing.left.min(bounds.left),
                    existing.bottom.min(bounds.bottom),
                    existing.right.max(bounds.right),
                    existing.top.max(bounds.top),
                ),
                None => bounds,
            };
            let min_zoom = match self.metadata_zoom("minzoom").await? {
                Some(existing) => existing.min(min_zoom),
                None => min_zoom,
            };
            let max_zoom = match self.metadata_zoom("maxzoom").await? {
                Some(existing) => existing.max(max_zoom),
                None => max_zoom,
            };
            Ok((bounds, min_zoom, max_zoom))
        } else {
            Ok((bounds, min_zoom, max_zoom))
        }
    }

    async fn upsert_metadata(&mut self, name: &str, value: &str) -> TilerResult<()> {
        sqlx::query("INSERT OR REPLACE INTO metadata (name, value) VALUES (?, ?)")
            .bind(name)
            .bind(value)
            .execute(&mut self.conn)
            .await?;
        Ok(())
    }

    /// Store one rendered tile. The XYZ row is flipped to TMS here and only
    /// here.
    pub async fn write_tile(&mut self, coord: TileCoord, data: &[u8]) -> TilerResult<()> {
        if !self.in_tx {
            sqlx::query("BEGIN").execute(&mut self.conn).await?;
            self.in_tx = true;
        }
        let tms_row = invert_y_value(coord.z, coord.y);
        sqlx::query(
            "INSERT OR REPLACE INTO tiles (zoom_level, tile_column, tile_row, tile_data)
             VALUES (?, ?, ?, ?)",
        )
        .bind(i64::from(coord.z))
        .bind(i64::from(coord.x))
        .bind(i64::from(tms_row))
        .bind(data)
        .execute(&mut self.conn)
        .await?;

        if let Some(dump_dir) = &self.image_dump {
            let name = format!("{}-{}-{}.{}", coord.x, tms_row, coord.z, self.format.file_ext());
            std::fs::write(dump_dir.join(name), data)?;
        }

        self.stored += 1;
        self.pending += 1;
        if self.pending >= self.batch_size {
            self.commit().await?;
        }
        Ok(())
    }

    async fn commit(&mut self) -> TilerResult<()> {
        if self.in_tx {
            sqlx::query("COMMIT").execute(&mut self.conn).await?;
            self.in_tx = false;
            self.pending = 0;
        }
        Ok(())
    }

    /// Commit any pending batch, record the extent summary, and close. Only
    /// a finalized container carries `bounds`/`minzoom`/`maxzoom`.
    pub async fn finalize(mut self, bounds: Bounds, min_zoom: u8, max_zoom: u8) -> TilerResult<u64> {
        self.commit().await?;
        let (bounds, min_zoom, max_zoom) = self.resolve_extent(bounds, min_zoom, max_zoom).await?;
        let bounds_value = format!(
            "{},{},{},{}",
            bounds.left, bounds.bottom, bounds.right, bounds.top
        );
        let center_value = format!(
            "{},{},{min_zoom}",
            (bounds.left + bounds.right) / 2.0,
            (bounds.bottom + bounds.top) / 2.0
        );
        self.upsert_metadata("bounds", &bounds_value).await?;
        self.upsert_metadata("center", &center_value).await?;
        self.upsert_metadata("minzoom", &min_zoom.to_string()).await?;
        self.upsert_metadata("maxzoom", &max_zoom.to_string()).await?;
        self.conn.close().await?;
        info!("Stored {} tiles into {}", self.stored, self.path.display());
        Ok(self.stored)
    }

    async fn metadata_value(&mut self, name: &str) -> TilerResult<Option<String>> {
        Ok(
            sqlx::query_scalar("SELECT value FROM metadata WHERE name = ?")
                .bind(name)
                .fetch_optional(&mut self.conn)
                .await?,
        )
    }

    async fn metadata_zoom(&mut self, name: &str) -> TilerResult<Option<u8>> {
        Ok(self
            .metadata_value(name)
            .await?
            .and_then(|v| v.parse().ok()))
    }
}

fn parse_bounds(value: String) -> Option<Bounds> {
    let parts: Vec<f64> = value
        .split(',')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<_>>()?;
    match parts[..] {
        [left, bottom, right, top] => Some(Bounds::new(left, bottom, right, top)),
        _ => None,
    }
}
