//! The export pipeline: plans the tile pyramid, fans tile jobs out to a
//! render pool over bounded channels, and funnels results into the single
//! writer connection. The first failure anywhere tears the whole run down.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use mbtiler_tile_utils::TileCoord;

use crate::config::{ExportConfig, WorkerStrategy};
use crate::enumerate::TileEnumerator;
use crate::errors::{TilerError, TilerResult};
use crate::planner::{constrain_bounds, default_zoom_range, estimate_tile_count, plan_ranges};
use crate::render::{RenderedTile, SourceFactory, TileRenderer};
use crate::writer::MbtWriter;

/// What one run produced. `rendered` counts every enumerated tile that went
/// through a worker; `empty` the subset skipped as all-nodata.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub rendered: u64,
    pub stored: u64,
    pub empty: u64,
}

pub struct TilePipeline {
    config: ExportConfig,
    source: Arc<dyn SourceFactory>,
}

enum WorkerHandle {
    Pool(tokio::task::JoinHandle<()>),
    Thread(std::thread::JoinHandle<()>),
}

impl WorkerHandle {
    async fn join(self) -> TilerResult<()> {
        match self {
            Self::Pool(handle) => handle
                .await
                .map_err(|e| TilerError::WorkerPanic(e.to_string())),
            Self::Thread(handle) => handle
                .join()
                .map_err(|_| TilerError::WorkerPanic("render thread panicked".to_string())),
        }
    }
}

impl TilePipeline {
    #[must_use]
    pub fn new(config: ExportConfig, source: Arc<dyn SourceFactory>) -> Self {
        Self { config, source }
    }

    pub async fn run(&self) -> TilerResult<RunSummary> {
        let config = &self.config;
        config.validate(self.source.band_count(), self.source.nodata())?;

        // A cutline footprint replaces the source extent for planning.
        let raw_bounds = match &config.cutline {
            Some(cutline) => cutline.bounds(),
            None => self.source.bounds()?,
        };
        let bounds = constrain_bounds(&raw_bounds)?;
        let (min_zoom, max_zoom) = config
            .zoom_levels
            .unwrap_or_else(|| default_zoom_range(&bounds));
        let covers = match &config.covers {
            Some(quadkey) => Some(TileCoord::from_quadkey(quadkey).ok_or_else(|| {
                TilerError::Config(format!("invalid quadkey {quadkey:?}"))
            })?),
            None => None,
        };
        let ranges = plan_ranges(&bounds, min_zoom, max_zoom, covers);
        let total = estimate_tile_count(&ranges);
        info!("Exporting zoom {min_zoom}..={max_zoom} over {bounds}, up to {total} tiles");

        // Open the destination before any rendering happens.
        let mut writer = MbtWriter::open(config).await?;

        let progress = if config.progress {
            let bar = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::with_template(
                "[{elapsed_precise}] {wide_bar} {pos}/{len} ({eta})",
            ) {
                bar.set_style(style);
            }
            bar
        } else {
            ProgressBar::hidden()
        };

        let queue_len = config.queue_len_or_default();
        let (jobs_tx, jobs_rx) = flume::bounded::<TileCoord>(queue_len);
        let (results_tx, results_rx) = flume::bounded::<TilerResult<RenderedTile>>(queue_len);

        // Feeder: the enumerator streams into the bounded job channel from
        // its own thread, so backpressure never stalls the writer.
        let enumerator = TileEnumerator::new(ranges, config.cutline.clone());
        let feeder = std::thread::spawn(move || {
            for coord in enumerator {
                if jobs_tx.send(coord).is_err() {
                    break;
                }
            }
        });

        let mut workers = Vec::with_capacity(config.workers);
        for _ in 0..config.workers {
            let source = Arc::clone(&self.source);
            let jobs_rx = jobs_rx.clone();
            let results_tx = results_tx.clone();
            let format = config.format.clone();
            let cutline = config.cutline.clone();
            let (tile_size, bands) = (config.tile_size, config.band_count());
            let include_empty = config.include_empty;
            let worker = move || {
                // Each worker holds its own source handle.
                let mut renderer = match source.open() {
                    Ok(warp) => TileRenderer::new(
                        warp,
                        format,
                        tile_size,
                        bands,
                        cutline,
                        include_empty,
                    ),
                    Err(e) => {
                        let _ = results_tx.send(Err(e));
                        return;
                    }
                };
                while let Ok(coord) = jobs_rx.recv() {
                    let outcome = renderer.render(coord);
                    let failed = outcome.is_err();
                    if results_tx.send(outcome).is_err() || failed {
                        break;
                    }
                }
            };
            workers.push(match config.strategy {
                WorkerStrategy::SharedPool => {
                    WorkerHandle::Pool(tokio::task::spawn_blocking(worker))
                }
                WorkerStrategy::IsolatedThreads => {
                    WorkerHandle::Thread(std::thread::spawn(worker))
                }
            });
        }
        drop(jobs_rx);
        drop(results_tx);

        let mut summary = RunSummary::default();
        let mut first_error = None;
        while let Ok(outcome) = results_rx.recv_async().await {
            match outcome {
                Ok(tile) => {
                    summary.rendered += 1;
                    let write = match tile.data {
                        Some(data) => writer.write_tile(tile.coord, &data).await,
                        None => {
                            summary.empty += 1;
                            Ok(())
                        }
                    };
                    progress.inc(1);
                    if let Err(e) = write {
                        first_error = Some(e);
                        break;
                    }
                }
                Err(e) => {
                    first_error = Some(e);
                    break;
                }
            }
        }

        // Closing the results receiver makes every worker's next send fail,
        // which in turn closes the job channel and stops the feeder.
        drop(results_rx);
        for handle in workers {
            let joined = handle.join().await;
            if first_error.is_none() {
                if let Err(e) = joined {
                    first_error = Some(e);
                }
            }
        }
        if feeder.join().is_err() && first_error.is_none() {
            first_error = Some(TilerError::WorkerPanic(
                "tile enumerator thread panicked".to_string(),
            ));
        }
        progress.finish_and_clear();

        if let Some(e) = first_error {
            debug!("Aborting export of {}: {e}", config.output.display());
            return Err(e);
        }
        summary.stored = writer.finalize(bounds, min_zoom, max_zoom).await?;
        Ok(summary)
    }
}
