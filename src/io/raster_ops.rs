//! Whole-file raster utilities: cropping to a box and resampling by a ratio

use crate::types::{BoundingBox, Extents, GeoTransform, GridError, GridResult};
use gdal::raster::{Buffer, GdalDataType, GdalType, ResampleAlg};
use gdal::{Dataset, DriverManager};
use std::path::{Path, PathBuf};

/// Snap tolerance, in pixels, when converting box edges to pixel indices
const PIXEL_EPSILON: f64 = 1e-6;

/// Resampling kernel, numbered by the conventional integer codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResamplingKernel {
    Nearest = 0,
    Bilinear = 1,
    Cubic = 2,
    CubicSpline = 3,
    Lanczos = 4,
    Average = 5,
    Mode = 6,
    Gauss = 7,
}

impl ResamplingKernel {
    /// Codes 8-12 (max, min, med, q1, q3) exist but the windowed read path
    /// cannot apply them
    pub fn from_code(code: u8) -> GridResult<Self> {
        match code {
            0 => Ok(Self::Nearest),
            1 => Ok(Self::Bilinear),
            2 => Ok(Self::Cubic),
            3 => Ok(Self::CubicSpline),
            4 => Ok(Self::Lanczos),
            5 => Ok(Self::Average),
            6 => Ok(Self::Mode),
            7 => Ok(Self::Gauss),
            other => Err(GridError::UnsupportedResampling(other)),
        }
    }

    fn to_gdal(self) -> ResampleAlg {
        match self {
            Self::Nearest => ResampleAlg::NearestNeighbour,
            Self::Bilinear => ResampleAlg::Bilinear,
            Self::Cubic => ResampleAlg::Cubic,
            Self::CubicSpline => ResampleAlg::CubicSpline,
            Self::Lanczos => ResampleAlg::Lanczos,
            Self::Average => ResampleAlg::Average,
            Self::Mode => ResampleAlg::Mode,
            Self::Gauss => ResampleAlg::Gauss,
        }
    }
}

impl Default for ResamplingKernel {
    fn default() -> Self {
        Self::Average
    }
}

/// Pixel window `(col, row, width, height)` of `bbox` inside a grid
fn pixel_window(transform: &GeoTransform, size: (usize, usize), bbox: &BoundingBox) -> (usize, usize, usize, usize) {
    let to_col = |x: f64| (x - transform.top_left_x) / transform.pixel_width;
    let to_row = |y: f64| (y - transform.top_left_y) / transform.pixel_height;

    let (c0, c1) = (to_col(bbox.min_lon), to_col(bbox.max_lon));
    let (r0, r1) = (to_row(bbox.min_lat), to_row(bbox.max_lat));
    let snap_lo = |v: f64| (v + PIXEL_EPSILON).floor().max(0.0) as usize;
    let snap_hi = |v: f64| (v - PIXEL_EPSILON).ceil().max(0.0) as usize;

    let col0 = snap_lo(c0.min(c1)).min(size.0);
    let col1 = snap_hi(c0.max(c1)).min(size.0).max(col0);
    let row0 = snap_lo(r0.min(r1)).min(size.1);
    let row1 = snap_hi(r0.max(r1)).min(size.1).max(row0);
    (col0, row0, col1 - col0, row1 - row0)
}

fn check_bound(exceeds: bool, bound: &'static str, requested: f64, limit: f64) -> GridResult<()> {
    if exceeds {
        return Err(GridError::CropOutOfBounds {
            bound,
            requested,
            limit,
            excess: (requested - limit).abs(),
        });
    }
    Ok(())
}

fn temp_output_for(filename: &Path) -> GridResult<PathBuf> {
    let prefix = filename
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "crop".to_string());
    let suffix = filename
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let file = tempfile::Builder::new().prefix(&prefix).suffix(&suffix).tempfile()?;
    let path = file
        .into_temp_path()
        .keep()
        .map_err(|e| GridError::Io(e.error))?;
    Ok(path)
}

fn copy_window<T: GdalType + Copy>(
    src: &Dataset,
    dest: &Dataset,
    window: (usize, usize, usize, usize),
) -> GridResult<()> {
    let (col, row, width, height) = window;
    for b in 1..=src.raster_count() {
        let band = src.rasterband(b)?;
        let buffer = band.read_as::<T>((col as isize, row as isize), (width, height), (width, height), None)?;

        let mut out_band = dest.rasterband(b)?;
        if let Some(nodata) = band.no_data_value() {
            out_band.set_no_data_value(Some(nodata))?;
        }
        out_band.write((0, 0), (width, height), &buffer)?;
    }
    Ok(())
}

fn create_like<T: GdalType + Copy>(
    src: &Dataset,
    outfile: &Path,
    window: (usize, usize, usize, usize),
    transform: &GeoTransform,
) -> GridResult<()> {
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (_, _, width, height) = window;
    let mut dest = driver.create_with_band_type::<T, _>(
        outfile,
        width as isize,
        height as isize,
        src.raster_count(),
    )?;
    dest.set_geo_transform(&transform.to_gdal())?;
    let projection = src.projection();
    if !projection.is_empty() {
        dest.set_projection(&projection)?;
    }
    copy_window::<T>(src, &dest, window)
}

/// Crop a raster to `extents`, ordered (xmin, ymin, xmax, ymax). Unset
/// elements take the source's own bound. Returns the path written, which is a
/// fresh temporary file when `outfile` is `None`.
pub fn crop_tif<P: AsRef<Path>>(filename: P, extents: &Extents, outfile: Option<&Path>) -> GridResult<PathBuf> {
    let filename = filename.as_ref();
    if !filename.is_file() {
        return Err(GridError::MissingFile(filename.to_path_buf()));
    }

    let src = Dataset::open(filename)?;
    let size = src.raster_size();
    let transform = GeoTransform::from_gdal(&src.geo_transform()?);
    if !transform.is_axis_aligned() {
        return Err(GridError::ShearedTransform(transform));
    }

    let bounds = transform.bounds(size.0, size.1);
    let bbox = extents.resolve(&bounds);
    check_bound(bbox.min_lon < bounds.min_lon, "xmin", bbox.min_lon, bounds.min_lon)?;
    check_bound(bbox.min_lat < bounds.min_lat, "ymin", bbox.min_lat, bounds.min_lat)?;
    check_bound(bbox.max_lon > bounds.max_lon, "xmax", bbox.max_lon, bounds.max_lon)?;
    check_bound(bbox.max_lat > bounds.max_lat, "ymax", bbox.max_lat, bounds.max_lat)?;

    let window = pixel_window(&transform, size, &bbox);
    let (col, row, width, height) = window;
    let cropped = GeoTransform {
        top_left_x: transform.top_left_x + col as f64 * transform.pixel_width,
        top_left_y: transform.top_left_y + row as f64 * transform.pixel_height,
        ..transform
    };

    let outfile = match outfile {
        Some(path) => path.to_path_buf(),
        None => temp_output_for(filename)?,
    };

    log::info!(
        "Cropping {} to {}x{} pixels at ({}, {}) -> {}",
        filename.display(),
        width,
        height,
        col,
        row,
        outfile.display()
    );

    let band_type = if src.raster_count() > 0 {
        src.rasterband(1)?.band_type()
    } else {
        GdalDataType::Float64
    };
    match band_type {
        GdalDataType::UInt8 => create_like::<u8>(&src, &outfile, window, &cropped)?,
        GdalDataType::UInt16 => create_like::<u16>(&src, &outfile, window, &cropped)?,
        GdalDataType::Int16 => create_like::<i16>(&src, &outfile, window, &cropped)?,
        GdalDataType::UInt32 => create_like::<u32>(&src, &outfile, window, &cropped)?,
        GdalDataType::Int32 => create_like::<i32>(&src, &outfile, window, &cropped)?,
        GdalDataType::Float32 => create_like::<f32>(&src, &outfile, window, &cropped)?,
        _ => create_like::<f64>(&src, &outfile, window, &cropped)?,
    }

    Ok(outfile)
}

/// Resample a raster by `ratio` (> 1 shrinks) into a Float32 GeoTIFF
pub fn resample<P: AsRef<Path>, Q: AsRef<Path>>(
    input_tif: P,
    output_tif: Q,
    ratio: f64,
    kernel: ResamplingKernel,
) -> GridResult<()> {
    if !(ratio > 0.0) {
        return Err(GridError::InvalidConfig(format!("resampling ratio must be positive, got {}", ratio)));
    }

    let src = Dataset::open(input_tif.as_ref())?;
    let (width, height) = src.raster_size();
    let new_width = ((width as f64 / ratio).round() as usize).max(1);
    let new_height = ((height as f64 / ratio).round() as usize).max(1);
    let transform = GeoTransform::from_gdal(&src.geo_transform()?).scaled(ratio);

    log::debug!(
        "Resampling {} from {}x{} to {}x{} ({:?})",
        input_tif.as_ref().display(),
        width,
        height,
        new_width,
        new_height,
        kernel
    );

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut dest = driver.create_with_band_type::<f32, _>(
        output_tif.as_ref(),
        new_width as isize,
        new_height as isize,
        src.raster_count(),
    )?;
    dest.set_geo_transform(&transform.to_gdal())?;
    let projection = src.projection();
    if !projection.is_empty() {
        dest.set_projection(&projection)?;
    }

    for b in 1..=src.raster_count() {
        let band = src.rasterband(b)?;
        let buffer: Buffer<f32> = band.read_as::<f32>(
            (0, 0),
            (width, height),
            (new_width, new_height),
            Some(kernel.to_gdal()),
        )?;
        let mut out_band = dest.rasterband(b)?;
        if let Some(nodata) = band.no_data_value() {
            out_band.set_no_data_value(Some(nodata))?;
        }
        out_band.write((0, 0), (new_width, new_height), &buffer)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_codes() {
        assert_eq!(ResamplingKernel::from_code(0).unwrap(), ResamplingKernel::Nearest);
        assert_eq!(ResamplingKernel::from_code(5).unwrap(), ResamplingKernel::Average);
        assert!(matches!(
            ResamplingKernel::from_code(8),
            Err(GridError::UnsupportedResampling(8))
        ));
    }

    #[test]
    fn test_pixel_window_snaps_to_grid() {
        let transform = GeoTransform::from_gdal(&[0.0, 1.0, 0.0, 10.0, 0.0, -1.0]);
        let bbox = BoundingBox::new(2.0, 2.0, 8.0, 8.0);
        assert_eq!(pixel_window(&transform, (10, 10), &bbox), (2, 2, 6, 6));

        let partial = BoundingBox::new(2.5, 0.0, 10.0, 7.5);
        assert_eq!(pixel_window(&transform, (10, 10), &partial), (2, 2, 8, 8));
    }
}
