use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage type of the pixels behind an image source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    UInt8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
    /// Any other backend type; read as 64-bit floats
    Other,
}

impl PixelType {
    pub fn from_gdal(data_type: gdal::raster::GdalDataType) -> Self {
        use gdal::raster::GdalDataType;
        match data_type {
            GdalDataType::UInt8 => PixelType::UInt8,
            GdalDataType::UInt16 => PixelType::UInt16,
            GdalDataType::Int16 => PixelType::Int16,
            GdalDataType::UInt32 => PixelType::UInt32,
            GdalDataType::Int32 => PixelType::Int32,
            GdalDataType::Float32 => PixelType::Float32,
            GdalDataType::Float64 => PixelType::Float64,
            _ => PixelType::Other,
        }
    }
}

impl std::fmt::Display for PixelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PixelType::UInt8 => write!(f, "uint8"),
            PixelType::UInt16 => write!(f, "uint16"),
            PixelType::Int16 => write!(f, "int16"),
            PixelType::UInt32 => write!(f, "uint32"),
            PixelType::Int32 => write!(f, "int32"),
            PixelType::Float32 => write!(f, "float32"),
            PixelType::Float64 => write!(f, "float64"),
            PixelType::Other => write!(f, "other"),
        }
    }
}

/// Geospatial bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self { min_lon, max_lon, min_lat, max_lat }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.min_lon <= x && x <= self.max_lon && self.min_lat <= y && y <= self.max_lat
    }

    pub fn width(&self) -> f64 {
        self.max_lon - self.min_lon
    }

    pub fn height(&self) -> f64 {
        self.max_lat - self.min_lat
    }
}

/// Partially specified crop or filter box, ordered (xmin, ymin, xmax, ymax).
/// Unset elements fall back to the bound of whatever dataset it is applied to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Extents {
    pub xmin: Option<f64>,
    pub ymin: Option<f64>,
    pub xmax: Option<f64>,
    pub ymax: Option<f64>,
}

impl Extents {
    pub fn new(xmin: Option<f64>, ymin: Option<f64>, xmax: Option<f64>, ymax: Option<f64>) -> Self {
        Self { xmin, ymin, xmax, ymax }
    }

    pub fn resolve(&self, fallback: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.xmin.unwrap_or(fallback.min_lon),
            self.ymin.unwrap_or(fallback.min_lat),
            self.xmax.unwrap_or(fallback.max_lon),
            self.ymax.unwrap_or(fallback.max_lat),
        )
    }
}

/// Geospatial transformation parameters (GDAL coefficient order)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn from_gdal(gt: &[f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// No shear and no rotation
    pub fn is_axis_aligned(&self) -> bool {
        self.rotation_x == 0.0 && self.rotation_y == 0.0
    }

    /// Transform for pixels `ratio` times larger, same origin
    pub fn scaled(&self, ratio: f64) -> Self {
        Self {
            top_left_x: self.top_left_x,
            pixel_width: self.pixel_width * ratio,
            rotation_x: self.rotation_x * ratio,
            top_left_y: self.top_left_y,
            rotation_y: self.rotation_y * ratio,
            pixel_height: self.pixel_height * ratio,
        }
    }

    /// Outer pixel-edge extent of a `width` x `height` grid
    pub fn bounds(&self, width: usize, height: usize) -> BoundingBox {
        let x0 = self.top_left_x;
        let x1 = self.top_left_x + self.pixel_width * width as f64;
        let y0 = self.top_left_y;
        let y1 = self.top_left_y + self.pixel_height * height as f64;
        BoundingBox::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
    }
}

/// Error types for raster distribution
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Configuration parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{} does not exist", .0.display())]
    MissingFile(PathBuf),

    #[error("Transform to pixel coordinates has rotation or shear: {0:?}")]
    ShearedTransform(GeoTransform),

    #[error("No support for multichannel rasters with differently typed channels: {0}")]
    MixedBandTypes(String),

    #[error("Invalid pixel window [{min_x}, {max_x}) x [{min_y}, {max_y}) for a {width}x{height} image")]
    InvalidWindow {
        min_x: usize,
        max_x: usize,
        min_y: usize,
        max_y: usize,
        width: usize,
        height: usize,
    },

    #[error("Crop coordinate '{bound}' ({requested}) is out of bounds of image ({limit}) by {excess}")]
    CropOutOfBounds {
        bound: &'static str,
        requested: f64,
        limit: f64,
        excess: f64,
    },

    #[error("Resampling code {0} is not supported by the raster backend")]
    UnsupportedResampling(u8),

    #[error("Invalid targets: {0}")]
    InvalidTargets(String),

    #[error("Can't find target property '{field}'. Candidates: {candidates:?}")]
    MissingTargetField { field: String, candidates: Vec<String> },

    #[error("Collective operation failed: {0}")]
    Collective(String),

    #[error("Shared region error: {0}")]
    SharedRegion(String),

    #[error("Raster writer is already closed")]
    WriterClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

/// Result type for raster distribution operations
pub type GridResult<T> = Result<T, GridError>;
