mod common;

use gdal::{Dataset, Metadata};
use geoscatter::core::{LocalGroup, MaskedArray, ProcessGroup, RasterWriter, WriterConfig, WriterState};
use geoscatter::io::{FileImageSource, ImageSource};
use geoscatter::types::{BoundingBox, GridError};
use ndarray::Array3;
use std::path::{Path, PathBuf};

const WIDTH: usize = 6;
const HEIGHT: usize = 5;

fn expected(x: usize, y: usize, b: usize) -> f32 {
    (100 * b + 10 * y + x) as f32
}

fn config(dir: &Path, independent: bool) -> WriterConfig {
    WriterConfig {
        shape: (WIDTH, HEIGHT),
        bbox: BoundingBox::new(0.0, 0.0, 6.0, 5.0),
        crs: Some(common::wgs84_wkt()),
        n_subchunks: 2,
        outpath: dir.join("prediction_{}.tif").to_string_lossy().into_owned(),
        outbands: 2,
        band_tags: Some(vec!["Prediction".to_string(), "Upper Quantile".to_string()]),
        independent,
    }
}

fn write_everything(dir: &Path, ranks: usize, independent: bool) -> Vec<PathBuf> {
    write_passes(dir, ranks, independent, 1)
}

fn write_passes(dir: &Path, ranks: usize, independent: bool, repeats: usize) -> Vec<PathBuf> {
    let results = LocalGroup::launch(ranks, |group| {
        let mut writer = RasterWriter::new(group, config(dir, independent))?;
        assert_eq!(writer.state(), WriterState::Open);
        for subchunk in 0..2 {
            let rows = writer.rows_for(subchunk)?;
            let data = Array3::from_shape_fn((WIDTH, rows.len(), 2), |(x, y, b)| expected(x, rows.start + y, b));
            let mask = Array3::from_shape_fn((WIDTH, rows.len(), 2), |(x, y, b)| {
                x == 0 && rows.start + y == 3 && b == 1
            });
            let piece = MaskedArray::new(data, Some(mask))?;
            for _ in 0..repeats {
                writer.write(&piece, subchunk)?;
            }
        }
        writer.close()?;
        Ok(writer.file_names().to_vec())
    })
    .expect("Collective write failed");

    assert!(results.windows(2).all(|w| w[0] == w[1]));
    results[0].clone()
}

fn check_outputs(files: &[PathBuf]) {
    assert_eq!(files.len(), 2);
    assert!(files[0].ends_with("prediction_prediction.tif"));
    assert!(files[1].ends_with("prediction_upper_quantile.tif"));

    for (b, file) in files.iter().enumerate() {
        let source = FileImageSource::new(file).expect("Failed to open output");
        assert_eq!(source.full_resolution(), (WIDTH, HEIGHT, 1));
        assert!(source.crs().is_some());
        let window = source.data(0, WIDTH, 0, HEIGHT).expect("Failed to read output");
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                if b == 1 && x == 0 && y == 3 {
                    assert!(window.is_masked([x, y, 0]));
                } else {
                    assert_eq!(window.data()[[x, y, 0]], expected(x, y, b) as f64, "pixel ({}, {})", x, y);
                }
            }
        }
    }

    let dataset = Dataset::open(&files[1]).expect("Failed to open output");
    let band = dataset.rasterband(1).expect("Failed to get band");
    assert_eq!(band.metadata_item("image_type", "").as_deref(), Some("Upper Quantile"));
}

#[test]
fn test_funneled_write_round_trip() {
    common::init_logging();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let files = write_everything(dir.path(), 3, false);
    check_outputs(&files);
}

#[test]
fn test_independent_write_round_trip() {
    common::init_logging();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let files = write_everything(dir.path(), 2, true);
    check_outputs(&files);
}

#[test]
fn test_rewrite_is_idempotent() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let read_all = |files: &[PathBuf]| {
        files
            .iter()
            .map(|f| {
                let source = FileImageSource::new(f).expect("Failed to open output");
                source.data(0, WIDTH, 0, HEIGHT).expect("Failed to read output")
            })
            .collect::<Vec<_>>()
    };

    let first = write_everything(dir.path(), 2, false);
    let before = read_all(&first);
    let second = write_passes(dir.path(), 2, false, 2);
    assert_eq!(first, second);
    assert_eq!(read_all(&second), before);
}

#[test]
fn test_bad_piece_fails_without_blocking() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let outcomes = LocalGroup::launch(2, |group| {
        let mut writer = RasterWriter::new(group, config(dir.path(), false))?;
        let rows = writer.rows_for(0)?;
        // rank 1 sends one row too many
        let extra = if group.rank() == 1 { 1 } else { 0 };
        let piece = MaskedArray::unmasked(Array3::<f32>::zeros((WIDTH, rows.len() + extra, 2)));
        let outcome = writer.write(&piece, 0);
        writer.close()?;
        Ok(outcome.is_err())
    })
    .expect("Group failed");
    assert_eq!(outcomes, vec![true, true]);
}

#[test]
fn test_write_after_close_rejected() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let outcomes = LocalGroup::launch(1, |group| {
        let mut writer = RasterWriter::new(group, config(dir.path(), false))?;
        writer.close()?;
        let piece = MaskedArray::unmasked(Array3::<f32>::zeros((WIDTH, HEIGHT, 2)));
        Ok(matches!(writer.write(&piece, 0), Err(GridError::WriterClosed)))
    })
    .expect("Group failed");
    assert_eq!(outcomes, vec![true]);
}

#[test]
fn test_thumbnails_split_across_ranks() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let thumbnails = LocalGroup::launch(2, |group| {
        let mut writer = RasterWriter::new(group, config(dir.path(), false))?;
        assert!(writer.output_thumbnails(2.0).is_err());
        writer.close()?;
        writer.output_thumbnails(2.0)
    })
    .expect("Group failed");

    assert_eq!(thumbnails[0].len(), 1);
    assert_eq!(thumbnails[1].len(), 1);
    assert!(thumbnails[0][0].ends_with("prediction_prediction_thumbnail.tif"));
    let small = FileImageSource::new(&thumbnails[1][0]).expect("Failed to open thumbnail");
    assert_eq!(small.full_resolution(), (3, 3, 1));
}
