use crate::core::masked::MaskedArray;
use crate::types::{GeoTransform, GridError, GridResult, PixelType};
use gdal::Dataset;
use ndarray::{Array3, Ix3};
use std::path::{Path, PathBuf};

/// Masked `(x, y, band)` window returned by every image source
pub type ImageWindow = MaskedArray<f64, Ix3>;

/// Read access to a gridded dataset in north-up logical pixel coordinates.
///
/// All geometry is fixed at construction. `data` takes a half-open window
/// `[min_x, max_x) x [min_y, max_y)`, where row 0 is the southernmost row.
pub trait ImageSource {
    /// `(width, height, band_count)`
    fn full_resolution(&self) -> (usize, usize, usize);

    fn dtype(&self) -> PixelType;

    fn nodata_value(&self) -> Option<f64>;

    fn pixsize_x(&self) -> f64;

    /// Always positive after north-up normalization
    fn pixsize_y(&self) -> f64;

    fn origin_longitude(&self) -> f64;

    /// Latitude of the southern edge
    fn origin_latitude(&self) -> f64;

    /// Coordinate reference system as WKT, if known
    fn crs(&self) -> Option<&str>;

    fn data(&self, min_x: usize, max_x: usize, min_y: usize, max_y: usize) -> GridResult<ImageWindow>;
}

fn check_window(
    resolution: (usize, usize, usize),
    min_x: usize,
    max_x: usize,
    min_y: usize,
    max_y: usize,
) -> GridResult<()> {
    let (width, height, _) = resolution;
    if min_x > max_x || min_y > max_y || max_x > width || max_y > height {
        return Err(GridError::InvalidWindow {
            min_x,
            max_x,
            min_y,
            max_y,
            width,
            height,
        });
    }
    Ok(())
}

/// Raster file read through GDAL, reopened on every `data` call
#[derive(Debug, Clone)]
pub struct FileImageSource {
    path: PathBuf,
    full_res: (usize, usize, usize),
    dtype: PixelType,
    nodata_value: Option<f64>,
    pixsize_x: f64,
    pixsize_y: f64,
    origin_lon: f64,
    origin_lat: f64,
    crs: Option<String>,
    y_flipped: bool,
}

impl FileImageSource {
    pub fn new<P: AsRef<Path>>(path: P) -> GridResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(GridError::MissingFile(path));
        }

        let dataset = Dataset::open(&path)?;
        let (width, height) = dataset.raster_size();
        let band_count = dataset.raster_count() as usize;

        let mut band_types = Vec::with_capacity(band_count);
        for b in 1..=band_count {
            band_types.push(dataset.rasterband(b as isize)?.band_type());
        }
        if let Some(first) = band_types.first() {
            if band_types.iter().any(|t| t != first) {
                return Err(GridError::MixedBandTypes(format!(
                    "{}: {:?}",
                    path.display(),
                    band_types
                )));
            }
        }
        let dtype = band_types
            .first()
            .map(|t| PixelType::from_gdal(*t))
            .unwrap_or(PixelType::Other);
        let nodata_value = if band_count > 0 {
            dataset.rasterband(1)?.no_data_value()
        } else {
            None
        };

        let projection = dataset.projection();
        let crs = if projection.is_empty() { None } else { Some(projection) };

        let transform = GeoTransform::from_gdal(&dataset.geo_transform()?);
        if !transform.is_axis_aligned() {
            return Err(GridError::ShearedTransform(transform));
        }

        let mut pixsize_y = transform.pixel_height;
        let mut origin_lat = transform.top_left_y;
        let y_flipped = pixsize_y < 0.0;
        if y_flipped {
            origin_lat += pixsize_y * height as f64;
            pixsize_y = -pixsize_y;
        }

        log::debug!(
            "Opened {}: {}x{}x{} {} (flipped: {})",
            path.display(),
            width,
            height,
            band_count,
            dtype,
            y_flipped
        );

        Ok(Self {
            path,
            full_res: (width, height, band_count),
            dtype,
            nodata_value,
            pixsize_x: transform.pixel_width,
            pixsize_y,
            origin_lon: transform.top_left_x,
            origin_lat,
            crs,
            y_flipped,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the file stores rows top-down
    pub fn is_y_flipped(&self) -> bool {
        self.y_flipped
    }
}

impl ImageSource for FileImageSource {
    fn full_resolution(&self) -> (usize, usize, usize) {
        self.full_res
    }

    fn dtype(&self) -> PixelType {
        self.dtype
    }

    fn nodata_value(&self) -> Option<f64> {
        self.nodata_value
    }

    fn pixsize_x(&self) -> f64 {
        self.pixsize_x
    }

    fn pixsize_y(&self) -> f64 {
        self.pixsize_y
    }

    fn origin_longitude(&self) -> f64 {
        self.origin_lon
    }

    fn origin_latitude(&self) -> f64 {
        self.origin_lat
    }

    fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }

    fn data(&self, min_x: usize, max_x: usize, min_y: usize, max_y: usize) -> GridResult<ImageWindow> {
        check_window(self.full_res, min_x, max_x, min_y, max_y)?;

        let (_, height, bands) = self.full_res;
        let width = max_x - min_x;
        let rows = max_y - min_y;
        let mut data = Array3::<f64>::zeros((width, rows, bands));

        if width > 0 && rows > 0 {
            // file rows are top-down when flipped
            let file_row = if self.y_flipped { height - max_y } else { min_y };

            let dataset = Dataset::open(&self.path)?;
            for b in 0..bands {
                let band = dataset.rasterband((b + 1) as isize)?;
                let buffer = band.read_as::<f64>(
                    (min_x as isize, file_row as isize),
                    (width, rows),
                    (width, rows),
                    None,
                )?;
                for (i, value) in buffer.data.iter().enumerate() {
                    let (r, x) = (i / width, i % width);
                    let y = if self.y_flipped { rows - 1 - r } else { r };
                    data[[x, y, b]] = *value;
                }
            }
        }

        MaskedArray::from_nodata(data, None, self.nodata_value)
    }
}

/// Image source over an array that is already in memory
#[derive(Debug, Clone)]
pub struct ArrayImageSource {
    data: ImageWindow,
    nodata_value: Option<f64>,
    pixsize: (f64, f64),
    origin: (f64, f64),
    crs: Option<String>,
}

impl ArrayImageSource {
    /// `data` is `(x, y, band)` in north-up order; `origin` is (lon, lat) of
    /// the south-west corner. Cells equal to `nodata_value` or NaN are masked.
    pub fn new(
        data: ImageWindow,
        origin: (f64, f64),
        crs: Option<String>,
        pixsize: (f64, f64),
        nodata_value: Option<f64>,
    ) -> GridResult<Self> {
        let (values, mask) = data.into_parts();
        let data = MaskedArray::from_nodata(values, mask, nodata_value)?;
        Ok(Self {
            data,
            nodata_value,
            pixsize,
            origin,
            crs,
        })
    }
}

impl ImageSource for ArrayImageSource {
    fn full_resolution(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    fn dtype(&self) -> PixelType {
        PixelType::Float64
    }

    fn nodata_value(&self) -> Option<f64> {
        self.nodata_value
    }

    fn pixsize_x(&self) -> f64 {
        self.pixsize.0
    }

    fn pixsize_y(&self) -> f64 {
        self.pixsize.1
    }

    fn origin_longitude(&self) -> f64 {
        self.origin.0
    }

    fn origin_latitude(&self) -> f64 {
        self.origin.1
    }

    fn crs(&self) -> Option<&str> {
        self.crs.as_deref()
    }

    fn data(&self, min_x: usize, max_x: usize, min_y: usize, max_y: usize) -> GridResult<ImageWindow> {
        check_window(self.full_resolution(), min_x, max_x, min_y, max_y)?;
        Ok(self.data.window(min_x, max_x, min_y, max_y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_source() -> ArrayImageSource {
        let data = Array3::from_shape_fn((4, 3, 2), |(x, y, b)| (x * 10 + y) as f64 + b as f64 * 100.0);
        ArrayImageSource::new(MaskedArray::unmasked(data), (10.0, 20.0), None, (0.5, 0.5), Some(11.0)).unwrap()
    }

    #[test]
    fn test_full_window_shape() {
        let source = gradient_source();
        assert_eq!(source.full_resolution(), (4, 3, 2));
        let window = source.data(0, 4, 0, 3).unwrap();
        assert_eq!(window.dim(), (4, 3, 2));
    }

    #[test]
    fn test_window_slices_and_masks() {
        let source = gradient_source();
        let window = source.data(1, 3, 1, 3).unwrap();
        assert_eq!(window.dim(), (2, 2, 2));
        assert_eq!(window.data()[[0, 0, 0]], 11.0);
        // nodata 11.0 sits at x=1, y=1 in band 0
        assert!(window.is_masked([0, 0, 0]));
        assert!(!window.is_masked([0, 0, 1]));
    }

    #[test]
    fn test_out_of_range_window() {
        let source = gradient_source();
        assert!(matches!(source.data(0, 5, 0, 3), Err(GridError::InvalidWindow { .. })));
        assert!(source.data(2, 1, 0, 1).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = FileImageSource::new("/nonexistent/covariate.tif").unwrap_err();
        assert!(matches!(err, GridError::MissingFile(_)));
    }
}
