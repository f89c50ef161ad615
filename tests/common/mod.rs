#![allow(dead_code)]

use gdal::raster::Buffer;
use gdal::DriverManager;
use ndarray::Array3;
use std::path::Path;

/// Write an `(x, y, band)` array, row 0 southernmost, as a Float64 GeoTIFF.
/// `top_down` stores the rows north first with a negative y pixel size.
pub fn write_geotiff(
    path: &Path,
    data: &Array3<f64>,
    origin: (f64, f64),
    pixsize: (f64, f64),
    top_down: bool,
    nodata: Option<f64>,
) {
    let (width, height, bands) = data.dim();
    let driver = DriverManager::get_driver_by_name("GTiff").expect("Failed to get GTiff driver");
    let mut dataset = driver
        .create_with_band_type::<f64, _>(path, width as isize, height as isize, bands as isize)
        .expect("Failed to create GeoTIFF");

    let transform = if top_down {
        [origin.0, pixsize.0, 0.0, origin.1 + pixsize.1 * height as f64, 0.0, -pixsize.1]
    } else {
        [origin.0, pixsize.0, 0.0, origin.1, 0.0, pixsize.1]
    };
    dataset.set_geo_transform(&transform).expect("Failed to set transform");
    dataset
        .set_projection(&wgs84_wkt())
        .expect("Failed to set projection");

    for b in 0..bands {
        let mut values = Vec::with_capacity(width * height);
        for r in 0..height {
            let y = if top_down { height - 1 - r } else { r };
            values.extend((0..width).map(|x| data[[x, y, b]]));
        }
        let mut band = dataset.rasterband(b as isize + 1).expect("Failed to get band");
        if let Some(nd) = nodata {
            band.set_no_data_value(Some(nd)).expect("Failed to set nodata");
        }
        band.write((0, 0), (width, height), &Buffer::new((width, height), values))
            .expect("Failed to write band");
    }
}

pub fn wgs84_wkt() -> String {
    gdal::spatial_ref::SpatialRef::from_epsg(4326)
        .and_then(|srs| srs.to_wkt())
        .expect("Failed to build WGS84")
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
