//! Raster and vector file access

pub mod image_source;
pub mod raster_ops;
pub mod vector;

pub use image_source::{ArrayImageSource, FileImageSource, ImageSource, ImageWindow};
pub use raster_ops::{crop_tif, resample, ResamplingKernel};
pub use vector::{load_point_targets, number_of_targets, TargetLoadOptions};
