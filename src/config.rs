//! Pipeline configuration read from JSON

use crate::types::{Extents, GridError, GridResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One group of covariate rasters, e.g. every band of one sensor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub files: Vec<PathBuf>,
}

impl FeatureSet {
    pub fn new<P: Into<PathBuf>>(files: impl IntoIterator<Item = P>) -> Self {
        Self {
            files: files.into_iter().map(Into::into).collect(),
        }
    }

    /// Files ordered by path, the order features are stacked in
    pub fn sorted_files(&self) -> Vec<PathBuf> {
        let mut files = self.files.clone();
        files.sort();
        files
    }
}

/// Settings shared by every rank of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub feature_sets: Vec<FeatureSet>,
    /// Passes each rank makes over its rows
    pub n_subchunks: usize,
    /// Half-width of the square patch around each pixel
    pub patchsize: usize,
    /// Crop covariates to these extents before use
    pub extents: Option<Extents>,
    /// Where cropped covariates go; a temporary directory when unset
    pub crop_output_dir: Option<PathBuf>,
    pub target_file: Option<PathBuf>,
    pub target_property: Option<String>,
    /// Every rank writes its own prediction rows
    pub independent_write: bool,
    pub outbands: usize,
    /// Output file template with one `{}` for the band tag
    pub output_template: String,
    pub thumbnail_ratio: Option<f64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            feature_sets: Vec::new(),
            n_subchunks: 1,
            patchsize: 0,
            extents: None,
            crop_output_dir: None,
            target_file: None,
            target_property: None,
            independent_write: false,
            outbands: 1,
            output_template: "prediction_{}.tif".to_string(),
            thumbnail_ratio: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> GridResult<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(GridError::MissingFile(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&text)?;
        config.validate()?;
        log::debug!("Loaded pipeline configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> GridResult<()> {
        if self.n_subchunks == 0 {
            return Err(GridError::InvalidConfig("n_subchunks must be at least 1".to_string()));
        }
        if self.outbands == 0 {
            return Err(GridError::InvalidConfig("outbands must be at least 1".to_string()));
        }
        if !self.output_template.contains("{}") {
            return Err(GridError::InvalidConfig(format!(
                "output_template '{}' has no '{{}}' placeholder",
                self.output_template
            )));
        }
        if let Some(ratio) = self.thumbnail_ratio {
            if !(ratio > 0.0) {
                return Err(GridError::InvalidConfig(format!("thumbnail_ratio must be positive, got {}", ratio)));
            }
        }
        Ok(())
    }

    /// Every covariate file, feature set by feature set
    pub fn covariate_files(&self) -> Vec<PathBuf> {
        self.feature_sets.iter().flat_map(|s| s.sorted_files()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"feature_sets": [{"files": ["b.tif", "a.tif"]}], "patchsize": 1}"#).unwrap();
        assert_eq!(config.n_subchunks, 1);
        assert_eq!(config.patchsize, 1);
        assert_eq!(config.covariate_files(), vec![PathBuf::from("a.tif"), PathBuf::from("b.tif")]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_subchunks_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"n_subchunks": 0}}"#).unwrap();
        assert!(matches!(
            PipelineConfig::from_json_file(file.path()),
            Err(GridError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_extents_parse_with_gaps() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"extents": {"xmin": 1.0, "ymin": null, "xmax": 4.0, "ymax": null}}"#).unwrap();
        let extents = config.extents.unwrap();
        assert_eq!(extents.xmin, Some(1.0));
        assert_eq!(extents.ymin, None);
    }
}
