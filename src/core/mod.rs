//! Core distribution modules

pub mod chunking;
pub mod covariates;
pub mod geometry;
pub mod group;
pub mod masked;
pub mod shared;
pub mod targets;
pub mod writer;

// Re-export main types
pub use chunking::{split_ranges, ChunkPlanner};
pub use covariates::{crop_covariates, feature_names, image_subchunks, OutputSpec, SourceDiagnostics};
pub use geometry::{bbox_to_affine, image_bbox, patched_bbox, patched_shape};
pub use group::{LocalGroup, ProcessGroup, SharedRegion, COORDINATOR};
pub use masked::MaskedArray;
pub use shared::{create_shared_training_data, deallocate_shared_training_data, SharedArray, SharedTrainingData};
pub use targets::{load_targets, FieldValues, TargetOrder, Targets};
pub use writer::{RasterWriter, WriterConfig, WriterState, WRITER_NODATA};
