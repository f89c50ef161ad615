//! geoscatter: distribute tiled rasters and point targets across a process group
//!
//! Every rank of a [`core::ProcessGroup`] reads its own horizontal strip of
//! each covariate raster, receives its own share of the training targets, and
//! hands its strip of predictions back to a [`core::RasterWriter`] that
//! reassembles full GeoTIFFs. Training data needed by every rank is published
//! once into shared regions instead of being copied per rank.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use config::{FeatureSet, PipelineConfig};
pub use types::{BoundingBox, Extents, GeoTransform, GridError, GridResult, PixelType};

pub use crate::core::{ChunkPlanner, LocalGroup, ProcessGroup, RasterWriter, Targets, WriterConfig};
pub use io::{FileImageSource, ImageSource};
