//! Pure helpers converting between bounding boxes, grid shapes and transforms

use crate::io::image_source::ImageSource;
use crate::types::{BoundingBox, GeoTransform};

/// Axis-aligned, top-down transform for a `width` x `height` grid spanning the
/// box. Returns the transform and the (positive) pixel sizes.
pub fn bbox_to_affine(
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
    width: usize,
    height: usize,
) -> (GeoTransform, f64, f64) {
    let pixsize_x = (xmax - xmin) / width as f64;
    let pixsize_y = (ymax - ymin) / height as f64;
    let transform = GeoTransform {
        top_left_x: xmin,
        pixel_width: pixsize_x,
        rotation_x: 0.0,
        top_left_y: ymax,
        rotation_y: 0.0,
        pixel_height: -pixsize_y,
    };
    (transform, pixsize_x, pixsize_y)
}

/// Outer pixel-edge extent of a source in north-up coordinates
pub fn image_bbox(source: &dyn ImageSource) -> BoundingBox {
    let (width, height, _) = source.full_resolution();
    let x0 = source.origin_longitude();
    let y0 = source.origin_latitude();
    BoundingBox::new(
        x0,
        y0,
        x0 + source.pixsize_x() * width as f64,
        y0 + source.pixsize_y() * height as f64,
    )
}

/// Grid of valid patch centres after trimming `patchsize` pixels per border
pub fn patched_shape(resolution: (usize, usize), patchsize: usize) -> (usize, usize) {
    (
        resolution.0.saturating_sub(2 * patchsize),
        resolution.1.saturating_sub(2 * patchsize),
    )
}

pub fn patched_bbox(bbox: &BoundingBox, pixsize: (f64, f64), patchsize: usize) -> BoundingBox {
    let dx = pixsize.0.abs() * patchsize as f64;
    let dy = pixsize.1.abs() * patchsize as f64;
    BoundingBox::new(
        bbox.min_lon + dx,
        bbox.min_lat + dy,
        bbox.max_lon - dx,
        bbox.max_lat - dy,
    )
}

/// Input rows needed to produce output rows `[start, end)` of a patched grid
pub fn patched_input_rows(output_rows: std::ops::Range<usize>, patchsize: usize) -> std::ops::Range<usize> {
    if output_rows.is_empty() {
        return output_rows.start..output_rows.start;
    }
    output_rows.start..output_rows.end + 2 * patchsize
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_bbox_to_affine_round_trip() {
        let (transform, sx, sy) = bbox_to_affine(100.0, -40.0, 110.0, -30.0, 20, 40);
        assert_relative_eq!(sx, 0.5);
        assert_relative_eq!(sy, 0.25);
        assert!(transform.is_axis_aligned());
        assert_relative_eq!(transform.pixel_height, -0.25);

        let bounds = transform.bounds(20, 40);
        assert_relative_eq!(bounds.min_lon, 100.0);
        assert_relative_eq!(bounds.max_lat, -30.0);
        assert_relative_eq!(bounds.min_lat, -40.0);
    }

    #[test]
    fn test_patched_geometry() {
        assert_eq!(patched_shape((10, 8), 1), (8, 6));
        assert_eq!(patched_shape((3, 3), 2), (0, 0));

        let bbox = BoundingBox::new(0.0, 0.0, 10.0, 8.0);
        let trimmed = patched_bbox(&bbox, (1.0, 1.0), 2);
        assert_relative_eq!(trimmed.min_lon, 2.0);
        assert_relative_eq!(trimmed.max_lat, 6.0);

        assert_eq!(patched_input_rows(3..5, 2), 3..9);
        assert!(patched_input_rows(4..4, 2).is_empty());
    }
}
