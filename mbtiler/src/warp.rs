//! GDAL-backed raster source. The factory opens the dataset once to learn
//! its shape and extent; every worker then reopens the file for itself and
//! warps tiles through an in-memory target dataset.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use gdal::spatial_ref::{AxisMappingStrategy, CoordTransform, SpatialRef};
use gdal::{Dataset, DatasetOptions, DriverManager, GdalOpenFlags};
use gdal_sys::{CPLErr, GDALResampleAlg};
use mbtiler_tile_utils::WebMercatorBounds;
use tilejson::Bounds;

use crate::config::{ExportConfig, Resampling};
use crate::errors::{TilerError, TilerResult};
use crate::render::{SourceFactory, TileRaster, WarpSource};

/// Approximation error threshold for the warp transformer, in source pixels.
const WARP_ERROR_THRESHOLD: f64 = 0.125;

/// Densification points for the extent transform, enough to track the
/// curvature of any source projection's edges.
const TRANSFORM_DENSIFY: i32 = 21;

pub struct GdalSourceFactory {
    path: PathBuf,
    open_options: Vec<String>,
    warp_options: Vec<String>,
    tile_size: u32,
    bands: u8,
    rgba: bool,
    resampling: Resampling,
    src_nodata: Option<f64>,
    dst_nodata: Option<f64>,
    band_count: usize,
    source_nodata: Option<f64>,
    bounds: Bounds,
}

impl GdalSourceFactory {
    /// Open the source once, capture its band layout, nodata and geographic
    /// extent, and keep everything needed for workers to reopen it.
    pub fn new(path: &Path, config: &ExportConfig) -> TilerResult<Self> {
        let dataset = open_dataset(path, &config.open_options)?;
        let band_count = dataset.raster_count();
        let source_nodata = if band_count > 0 {
            dataset.rasterband(1)?.no_data_value()
        } else {
            None
        };
        let bounds = geographic_bounds(&dataset)?;

        let src_nodata = config.src_nodata.or(source_nodata);
        Ok(Self {
            path: path.to_path_buf(),
            open_options: config.open_options.clone(),
            warp_options: config.warp_options.clone(),
            tile_size: config.tile_size,
            bands: config.band_count(),
            rgba: config.rgba,
            resampling: config.resampling,
            src_nodata,
            dst_nodata: config.dst_nodata.or(src_nodata),
            band_count,
            source_nodata,
            bounds,
        })
    }
}

impl SourceFactory for GdalSourceFactory {
    fn bounds(&self) -> TilerResult<Bounds> {
        Ok(self.bounds)
    }

    fn band_count(&self) -> usize {
        self.band_count
    }

    fn nodata(&self) -> Option<f64> {
        self.source_nodata
    }

    fn open(&self) -> TilerResult<Box<dyn WarpSource>> {
        let dataset = open_dataset(&self.path, &self.open_options)?;
        Ok(Box::new(GdalWarpSource {
            dataset,
            mercator: SpatialRef::from_epsg(3857)?,
            tile_size: self.tile_size,
            bands: self.bands,
            rgba: self.rgba,
            resampling: self.resampling,
            src_nodata: self.src_nodata,
            dst_nodata: self.dst_nodata,
            warp_options: self.warp_options.clone(),
        }))
    }
}

struct GdalWarpSource {
    dataset: Dataset,
    mercator: SpatialRef,
    tile_size: u32,
    bands: u8,
    rgba: bool,
    resampling: Resampling,
    src_nodata: Option<f64>,
    dst_nodata: Option<f64>,
    warp_options: Vec<String>,
}

impl WarpSource for GdalWarpSource {
    fn warp_tile(&mut self, bounds: &WebMercatorBounds) -> TilerResult<TileRaster> {
        let size = self.tile_size as usize;
        let mut target = DriverManager::get_driver_by_name("MEM")?.create(
            "",
            size,
            size,
            usize::from(self.bands),
        )?;
        target.set_spatial_ref(&self.mercator)?;
        let pixel_span = (bounds.max_x - bounds.min_x) / f64::from(self.tile_size);
        target.set_geo_transform(&[
            bounds.min_x,
            pixel_span,
            0.0,
            bounds.max_y,
            0.0,
            -pixel_span,
        ])?;
        if let Some(nodata) = self.dst_nodata {
            for band in 1..=usize::from(self.bands) {
                let mut band = target.rasterband(band)?;
                band.set_no_data_value(Some(nodata))?;
            }
        }

        self.reproject(&target)?;

        let bands = usize::from(self.bands);
        let mut pixels = vec![0_u8; size * size * bands];
        let mut band_data = Vec::with_capacity(bands);
        for band in 1..=bands {
            let buffer = target
                .rasterband(band)?
                .read_as::<u8>((0, 0), (size, size), (size, size), None)?;
            let data = buffer.data();
            for (pixel, &value) in data.iter().enumerate() {
                pixels[pixel * bands + (band - 1)] = value;
            }
            band_data.push(data.to_vec());
        }

        let mask = self.build_mask(size, &band_data);
        Ok(TileRaster {
            size: self.tile_size,
            bands: self.bands,
            pixels,
            mask,
        })
    }
}

impl GdalWarpSource {
    /// Validity mask: the alpha band for RGBA output, otherwise any band
    /// differing from the nodata value. Without a nodata value everything
    /// counts as data.
    fn build_mask(&self, size: usize, band_data: &[Vec<u8>]) -> Vec<u8> {
        if self.rgba {
            if let Some(alpha) = band_data.last() {
                return alpha.clone();
            }
        }
        match self.dst_nodata {
            Some(nodata) => {
                let nodata = nodata as u8;
                let mut mask = vec![0_u8; size * size];
                for band in band_data {
                    for (pixel, &value) in band.iter().enumerate() {
                        if value != nodata {
                            mask[pixel] = 255;
                        }
                    }
                }
                mask
            }
            None => vec![255_u8; size * size],
        }
    }

    fn reproject(&self, target: &Dataset) -> TilerResult<()> {
        let band_count = i32::from(self.bands);
        let mut extra: Vec<(CString, CString)> = Vec::with_capacity(self.warp_options.len());
        for option in &self.warp_options {
            let (name, value) = option.split_once('=').ok_or_else(|| {
                TilerError::Config(format!("malformed warp option {option:?}, expected NAME=VALUE"))
            })?;
            let name = CString::new(name)
                .map_err(|_| TilerError::Config(format!("invalid warp option name {name:?}")))?;
            let value = CString::new(value)
                .map_err(|_| TilerError::Config(format!("invalid warp option value {value:?}")))?;
            extra.push((name, value));
        }
        let init_dest = (CString::new("INIT_DEST").expect("static"), CString::new("NO_DATA").expect("static"));

        // SAFETY: the warp options struct is created and destroyed here; the
        // band and nodata arrays are CPL-allocated so GDALDestroyWarpOptions
        // can free them, and both dataset handles outlive the call.
        let err = unsafe {
            let opts = gdal_sys::GDALCreateWarpOptions();
            (*opts).nBandCount = band_count;
            (*opts).panSrcBands = cpl_band_list(band_count);
            (*opts).panDstBands = cpl_band_list(band_count);
            (*opts).eResampleAlg = resample_alg(self.resampling);
            if let Some(nodata) = self.src_nodata {
                (*opts).padfSrcNoDataReal = cpl_f64_list(band_count, nodata);
            }
            if let Some(nodata) = self.dst_nodata {
                (*opts).padfDstNoDataReal = cpl_f64_list(band_count, nodata);
                (*opts).papszWarpOptions = gdal_sys::CSLSetNameValue(
                    (*opts).papszWarpOptions,
                    init_dest.0.as_ptr(),
                    init_dest.1.as_ptr(),
                );
            }
            for (name, value) in &extra {
                (*opts).papszWarpOptions = gdal_sys::CSLSetNameValue(
                    (*opts).papszWarpOptions,
                    name.as_ptr(),
                    value.as_ptr(),
                );
            }
            let err = gdal_sys::GDALReprojectImage(
                self.dataset.c_dataset(),
                std::ptr::null(),
                target.c_dataset(),
                std::ptr::null(),
                (*opts).eResampleAlg,
                0.0,
                WARP_ERROR_THRESHOLD,
                None,
                std::ptr::null_mut(),
                opts,
            );
            gdal_sys::GDALDestroyWarpOptions(opts);
            err
        };
        if err != CPLErr::CE_None {
            return Err(TilerError::Reprojection(
                "warp engine reported a failure".to_string(),
            ));
        }
        Ok(())
    }
}

fn open_dataset(path: &Path, open_options: &[String]) -> TilerResult<Dataset> {
    let refs: Vec<&str> = open_options.iter().map(String::as_str).collect();
    let dataset = Dataset::open_ex(
        path,
        DatasetOptions {
            open_flags: GdalOpenFlags::GDAL_OF_RASTER | GdalOpenFlags::GDAL_OF_READONLY,
            open_options: if refs.is_empty() { None } else { Some(&refs) },
            ..DatasetOptions::default()
        },
    )?;
    Ok(dataset)
}

/// The source extent reprojected to geographic coordinates.
fn geographic_bounds(dataset: &Dataset) -> TilerResult<Bounds> {
    let gt = dataset.geo_transform()?;
    let (width, height) = dataset.raster_size();
    let min_x = gt[0];
    let max_y = gt[3];
    let max_x = (width as f64).mul_add(gt[1], min_x);
    let min_y = (height as f64).mul_add(gt[5], max_y);

    let source_srs = dataset
        .spatial_ref()
        .map_err(|_| TilerError::Reprojection("source has no spatial reference".to_string()))?;
    let mut geographic = SpatialRef::from_epsg(4326)?;
    geographic.set_axis_mapping_strategy(AxisMappingStrategy::TraditionalGisOrder);
    let transform = CoordTransform::new(&source_srs, &geographic)?;
    let out = transform
        .transform_bounds(
            &[min_x, min_y.min(max_y), max_x, min_y.max(max_y)],
            TRANSFORM_DENSIFY,
        )
        .map_err(|e| TilerError::Reprojection(e.to_string()))?;
    Ok(Bounds::new(out[0], out[1], out[2], out[3]))
}

fn resample_alg(resampling: Resampling) -> GDALResampleAlg::Type {
    match resampling {
        Resampling::Nearest => GDALResampleAlg::GRA_NearestNeighbour,
        Resampling::Bilinear => GDALResampleAlg::GRA_Bilinear,
        Resampling::Cubic => GDALResampleAlg::GRA_Cubic,
        Resampling::CubicSpline => GDALResampleAlg::GRA_CubicSpline,
        Resampling::Lanczos => GDALResampleAlg::GRA_Lanczos,
        Resampling::Average => GDALResampleAlg::GRA_Average,
        Resampling::Mode => GDALResampleAlg::GRA_Mode,
        // Rejected during validation; mapped anyway so the match is total.
        Resampling::Gauss => GDALResampleAlg::GRA_NearestNeighbour,
        Resampling::Max => GDALResampleAlg::GRA_Max,
        Resampling::Min => GDALResampleAlg::GRA_Min,
        Resampling::Med => GDALResampleAlg::GRA_Med,
        Resampling::Q1 => GDALResampleAlg::GRA_Q1,
        Resampling::Q3 => GDALResampleAlg::GRA_Q3,
        Resampling::Rms => GDALResampleAlg::GRA_RMS,
    }
}

/// CPL-allocated 1..=n band list, freed by `GDALDestroyWarpOptions`.
unsafe fn cpl_band_list(count: i32) -> *mut i32 {
    let list = gdal_sys::CPLMalloc(std::mem::size_of::<i32>() * count as usize).cast::<i32>();
    for i in 0..count {
        *list.add(i as usize) = i + 1;
    }
    list
}

/// CPL-allocated per-band nodata list, freed by `GDALDestroyWarpOptions`.
unsafe fn cpl_f64_list(count: i32, value: f64) -> *mut f64 {
    let list = gdal_sys::CPLMalloc(std::mem::size_of::<f64>() * count as usize).cast::<f64>();
    for i in 0..count {
        *list.add(i as usize) = value;
    }
    list
}
