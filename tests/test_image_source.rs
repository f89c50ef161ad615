mod common;

use approx::assert_relative_eq;
use geoscatter::io::{crop_tif, resample, FileImageSource, ImageSource, ResamplingKernel};
use geoscatter::types::{Extents, GridError};
use ndarray::Array3;

fn gradient(width: usize, height: usize, bands: usize) -> Array3<f64> {
    Array3::from_shape_fn((width, height, bands), |(x, y, b)| (100 * b + 10 * y + x) as f64)
}

#[test]
fn test_flipped_files_read_identically() {
    common::init_logging();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data = gradient(5, 4, 2);
    let top_down = dir.path().join("top_down.tif");
    let bottom_up = dir.path().join("bottom_up.tif");
    common::write_geotiff(&top_down, &data, (130.0, -30.0), (0.5, 0.25), true, None);
    common::write_geotiff(&bottom_up, &data, (130.0, -30.0), (0.5, 0.25), false, None);

    let a = FileImageSource::new(&top_down).expect("Failed to open top-down file");
    let b = FileImageSource::new(&bottom_up).expect("Failed to open bottom-up file");
    assert!(a.is_y_flipped());
    assert!(!b.is_y_flipped());

    assert_eq!(a.full_resolution(), (5, 4, 2));
    assert_relative_eq!(a.origin_latitude(), b.origin_latitude());
    assert_relative_eq!(a.origin_latitude(), -30.0);
    assert_relative_eq!(a.pixsize_y(), 0.25);

    let wa = a.data(1, 4, 1, 3).expect("Failed to read window");
    let wb = b.data(1, 4, 1, 3).expect("Failed to read window");
    assert_eq!(wa.data(), wb.data());
    assert_eq!(wa.data()[[0, 0, 1]], 111.0);
    assert_eq!(wa.data()[[2, 1, 0]], 23.0);
}

#[test]
fn test_nodata_cells_are_masked() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let mut data = gradient(4, 4, 1);
    data[[1, 2, 0]] = -9999.0;
    data[[3, 0, 0]] = -9999.0;
    let path = dir.path().join("masked.tif");
    common::write_geotiff(&path, &data, (0.0, 0.0), (1.0, 1.0), true, Some(-9999.0));

    let source = FileImageSource::new(&path).expect("Failed to open file");
    assert_eq!(source.nodata_value(), Some(-9999.0));
    let window = source.data(0, 4, 0, 4).expect("Failed to read window");
    assert_eq!(window.masked_count(), 2);
    assert!(window.is_masked([1, 2, 0]));
    assert!(window.is_masked([3, 0, 0]));
    assert!(!window.is_masked([0, 0, 0]));
    assert_relative_eq!(window.missing_percentage(), 12.5);
}

#[test]
fn test_crop_ten_by_ten() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let mut data = gradient(10, 10, 1);
    data.indexed_iter_mut()
        .filter(|((x, y, _), _)| *x < 2 || *x >= 8 || *y < 2 || *y >= 8)
        .for_each(|(_, v)| *v = -9999.0);
    let path = dir.path().join("full.tif");
    common::write_geotiff(&path, &data, (0.0, 0.0), (1.0, 1.0), true, Some(-9999.0));

    let out = dir.path().join("cropped.tif");
    let extents = Extents::new(Some(2.0), Some(2.0), Some(8.0), Some(8.0));
    let written = crop_tif(&path, &extents, Some(&out)).expect("Failed to crop");
    assert_eq!(written, out);

    let cropped = FileImageSource::new(&out).expect("Failed to open crop");
    assert_eq!(cropped.full_resolution(), (6, 6, 1));
    assert_relative_eq!(cropped.origin_longitude(), 2.0);
    assert_relative_eq!(cropped.origin_latitude(), 2.0);
    assert_eq!(cropped.nodata_value(), Some(-9999.0));
    let window = cropped.data(0, 6, 0, 6).expect("Failed to read crop");
    assert_eq!(window.masked_count(), 0);
    assert_eq!(window.data()[[0, 0, 0]], data[[2, 2, 0]]);
    assert_eq!(window.data()[[5, 5, 0]], data[[7, 7, 0]]);
}

#[test]
fn test_crop_defaults_and_bounds() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("full.tif");
    common::write_geotiff(&path, &gradient(10, 10, 1), (0.0, 0.0), (1.0, 1.0), true, None);

    // unset bounds fall back to the image's own, output goes to a temp file
    let written = crop_tif(&path, &Extents::new(None, Some(5.0), None, None), None).expect("Failed to crop");
    let cropped = FileImageSource::new(&written).expect("Failed to open crop");
    assert_eq!(cropped.full_resolution(), (10, 5, 1));
    std::fs::remove_file(&written).ok();

    let too_wide = Extents::new(Some(-1.0), None, None, None);
    match crop_tif(&path, &too_wide, None) {
        Err(GridError::CropOutOfBounds { bound, excess, .. }) => {
            assert_eq!(bound, "xmin");
            assert_relative_eq!(excess, 1.0);
        }
        other => panic!("expected an out-of-bounds error, got {:?}", other),
    }
}

#[test]
fn test_resample_halves_grid() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("full.tif");
    common::write_geotiff(&path, &Array3::from_elem((8, 6, 1), 3.0), (0.0, 0.0), (1.0, 1.0), true, None);

    let out = dir.path().join("half.tif");
    resample(&path, &out, 2.0, ResamplingKernel::Average).expect("Failed to resample");
    let small = FileImageSource::new(&out).expect("Failed to open resampled file");
    assert_eq!(small.full_resolution(), (4, 3, 1));
    assert_relative_eq!(small.pixsize_x(), 2.0);
    let window = small.data(0, 4, 0, 3).expect("Failed to read resampled file");
    assert!(window.data().iter().all(|&v| (v - 3.0).abs() < 1e-6));
}

#[test]
fn test_rotated_transform_rejected() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("rotated.tif");
    {
        let driver = gdal::DriverManager::get_driver_by_name("GTiff").expect("Failed to get GTiff driver");
        let mut dataset = driver
            .create_with_band_type::<f32, _>(&path, 4, 4, 1)
            .expect("Failed to create GeoTIFF");
        dataset
            .set_geo_transform(&[0.0, 1.0, 0.25, 4.0, 0.0, -1.0])
            .expect("Failed to set transform");
    }

    assert!(matches!(FileImageSource::new(&path), Err(GridError::ShearedTransform(_))));
    assert!(matches!(
        crop_tif(&path, &Extents::default(), None),
        Err(GridError::ShearedTransform(_))
    ));
}

#[test]
fn test_mixed_band_types_rejected() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("mixed.vrt");
    std::fs::write(
        &path,
        r#"<VRTDataset rasterXSize="4" rasterYSize="3">
  <GeoTransform>0.0, 1.0, 0.0, 3.0, 0.0, -1.0</GeoTransform>
  <VRTRasterBand dataType="Byte" band="1"/>
  <VRTRasterBand dataType="Float32" band="2"/>
</VRTDataset>
"#,
    )
    .expect("Failed to write VRT");

    match FileImageSource::new(&path) {
        Err(GridError::MixedBandTypes(detail)) => assert!(detail.contains("mixed.vrt")),
        other => panic!("expected a mixed band type error, got {:?}", other),
    }
}
