//! Covariate stacks: cropping, output geometry and per-rank subchunk reads

use crate::config::{FeatureSet, PipelineConfig};
use crate::core::chunking::{split_ranges, ChunkPlanner};
use crate::core::geometry::{image_bbox, patched_bbox, patched_input_rows, patched_shape};
use crate::core::group::ProcessGroup;
use crate::core::writer::WriterConfig;
use crate::io::image_source::{FileImageSource, ImageSource, ImageWindow};
use crate::io::raster_ops::crop_tif;
use crate::types::{BoundingBox, GridError, GridResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn first_covariate(config: &PipelineConfig) -> GridResult<FileImageSource> {
    let file = config
        .covariate_files()
        .into_iter()
        .next()
        .ok_or_else(|| GridError::InvalidConfig("no covariate files configured".to_string()))?;
    FileImageSource::new(file)
}

/// CRS (WKT) of the first covariate
pub fn image_crs(config: &PipelineConfig) -> GridResult<Option<String>> {
    Ok(first_covariate(config)?.crs().map(str::to_string))
}

/// Extent of the first covariate
pub fn image_bounds(config: &PipelineConfig) -> GridResult<BoundingBox> {
    Ok(image_bbox(&first_covariate(config)?))
}

/// Resolution of every covariate, keyed by file name
pub fn image_resolutions(config: &PipelineConfig) -> GridResult<BTreeMap<String, (usize, usize, usize)>> {
    config
        .covariate_files()
        .into_iter()
        .map(|file| {
            let source = FileImageSource::new(&file)?;
            Ok((basename(&file), source.full_resolution()))
        })
        .collect()
}

/// Covariate file names, sorted within each feature set, sets in order
pub fn feature_names(config: &PipelineConfig) -> Vec<String> {
    config.covariate_files().iter().map(|f| basename(f)).collect()
}

/// Geometry of prediction outputs derived from the first covariate
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    /// `(width, height)` after trimming the patch border
    pub shape: (usize, usize),
    pub bands: usize,
    pub bbox: BoundingBox,
    pub crs: Option<String>,
}

impl OutputSpec {
    pub fn from_template(config: &PipelineConfig, nchannels: usize) -> GridResult<Self> {
        let source = first_covariate(config)?;
        let (width, height, _) = source.full_resolution();
        let bbox = patched_bbox(
            &image_bbox(&source),
            (source.pixsize_x(), source.pixsize_y()),
            config.patchsize,
        );
        Ok(Self {
            shape: patched_shape((width, height), config.patchsize),
            bands: nchannels,
            bbox,
            crs: source.crs().map(str::to_string),
        })
    }

    pub fn writer_config(&self, config: &PipelineConfig, band_tags: Option<Vec<String>>) -> WriterConfig {
        WriterConfig {
            shape: self.shape,
            bbox: self.bbox,
            crs: self.crs.clone(),
            n_subchunks: config.n_subchunks,
            outpath: config.output_template.clone(),
            outbands: self.bands.min(config.outbands),
            band_tags,
            independent: config.independent_write,
        }
    }
}

/// Data quality summary of one covariate window
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDiagnostics {
    pub name: String,
    pub valid_counts: Vec<usize>,
    pub missing_percentage: f64,
}

impl SourceDiagnostics {
    pub fn from_window(name: &str, window: &ImageWindow) -> Self {
        let diagnostics = Self {
            name: name.to_string(),
            valid_counts: window.band_valid_counts(),
            missing_percentage: window.missing_percentage(),
        };
        for (band, count) in diagnostics.valid_counts.iter().enumerate() {
            if *count == 0 && window.shape()[0] * window.shape()[1] > 0 {
                log::warn!("{} band {} has no valid pixels in this window", name, band);
            }
        }
        diagnostics
    }
}

fn read_subchunk(
    file: &Path,
    processes: usize,
    rank: usize,
    n_subchunks: usize,
    subchunk_index: usize,
    patchsize: usize,
) -> GridResult<ImageWindow> {
    let source = FileImageSource::new(file)?;
    let (width, height, _) = source.full_resolution();
    let (_, out_height) = patched_shape((width, height), patchsize);
    let planner = ChunkPlanner::new(out_height, processes, n_subchunks)?;
    let rows = patched_input_rows(planner.range(rank, subchunk_index)?, patchsize);
    log::debug!(
        "[rank {}] Reading rows {}..{} of {}",
        rank,
        rows.start,
        rows.end,
        file.display()
    );
    source.data(0, width, rows.start, rows.end)
}

/// Read this rank's rows of every covariate for one subchunk, padded by the
/// patch size on both sides. One map per feature set, keyed by file name.
/// Collective: the group-wide missing percentage of each file is logged.
pub fn image_subchunks<G: ProcessGroup>(
    group: &G,
    config: &PipelineConfig,
    subchunk_index: usize,
) -> GridResult<Vec<BTreeMap<String, ImageWindow>>> {
    let mut results = Vec::with_capacity(config.feature_sets.len());
    let mut failure = None;
    for set in &config.feature_sets {
        let mut windows = BTreeMap::new();
        for file in set.sorted_files() {
            let name = basename(&file);
            let window = read_subchunk(
                &file,
                group.size(),
                group.rank(),
                config.n_subchunks,
                subchunk_index,
                config.patchsize,
            );

            // a failed read still contributes so the reduction completes
            let missing = window
                .as_ref()
                .map(|w| SourceDiagnostics::from_window(&name, w).missing_percentage)
                .unwrap_or(0.0);
            let mean_missing = group.all_reduce_sum(missing)? / group.size() as f64;
            if group.is_coordinator() {
                log::info!("{}: {:.2}% missing", name, mean_missing);
            }

            match window {
                Ok(window) => {
                    windows.insert(name, window);
                }
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        results.push(windows);
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

/// Crop every covariate to `config.extents`, spreading the files over the
/// group. Returns the configuration pointing at the cropped files. Collective.
pub fn crop_covariates<G: ProcessGroup>(
    group: &G,
    config: &PipelineConfig,
    outdir: Option<&Path>,
) -> GridResult<PipelineConfig> {
    let Some(extents) = config.extents else {
        return Ok(config.clone());
    };

    // cropped files share one directory, keyed by file name
    let mut seen = std::collections::BTreeSet::new();
    let duplicate = config
        .covariate_files()
        .iter()
        .map(|f| basename(f))
        .find(|name| !seen.insert(name.clone()));
    if let Some(duplicate) = duplicate {
        return Err(GridError::InvalidConfig(format!(
            "covariate file name '{}' appears more than once; cropped files would overwrite each other",
            duplicate
        )));
    }

    let outdir = match outdir {
        Some(dir) => dir.to_path_buf(),
        None => {
            let created = if group.is_coordinator() {
                Some(
                    tempfile::Builder::new()
                        .prefix("cropped")
                        .tempdir()
                        .map(|d| d.into_path())
                        .ok(),
                )
            } else {
                None
            };
            group
                .broadcast(created)?
                .ok_or_else(|| GridError::Collective("coordinator failed to create a crop directory".to_string()))?
        }
    };

    let mut feature_sets = Vec::with_capacity(config.feature_sets.len());
    let mut failure = None;
    for set in &config.feature_sets {
        let files = set.sorted_files();
        let share = split_ranges(files.len(), group.size())
            .into_iter()
            .nth(group.rank())
            .unwrap_or(0..0);

        let local: GridResult<Vec<PathBuf>> = files[share]
            .iter()
            .map(|file| {
                let outfile = outdir.join(basename(file));
                crop_tif(file, &extents, Some(&outfile))
            })
            .collect();

        // failures travel as `None` so every rank sees them
        let gathered = group.all_gather(local.as_ref().ok().cloned())?;
        if let Err(e) = local {
            log::warn!("[rank {}] Cropping failed: {}", group.rank(), e);
            failure.get_or_insert(e);
        }
        let mut cropped = Vec::with_capacity(files.len());
        for (rank, part) in gathered.into_iter().enumerate() {
            match part {
                Some(paths) => cropped.extend(paths),
                None => {
                    failure.get_or_insert(GridError::Collective(format!(
                        "rank {} failed to crop its covariates",
                        rank
                    )));
                }
            }
        }
        feature_sets.push(FeatureSet::new(cropped));
    }
    group.barrier();
    if let Some(e) = failure {
        return Err(e);
    }

    if group.is_coordinator() {
        log::info!("Cropped covariates written to {}", outdir.display());
    }

    Ok(PipelineConfig {
        feature_sets,
        extents: None,
        crop_output_dir: Some(outdir),
        ..config.clone()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::masked::MaskedArray;
    use ndarray::{Array3, Ix3};

    #[test]
    fn test_feature_names_sorted_per_set() {
        let config = PipelineConfig {
            feature_sets: vec![
                FeatureSet::new(["/data/b/slope.tif", "/data/b/aspect.tif"]),
                FeatureSet::new(["/data/a/dem.tif"]),
            ],
            ..Default::default()
        };
        assert_eq!(feature_names(&config), vec!["aspect.tif", "slope.tif", "dem.tif"]);
    }

    #[test]
    fn test_diagnostics_count_valid_cells() {
        let data = Array3::from_shape_fn((2, 2, 2), |(x, _, b)| if b == 1 && x == 0 { -1.0 } else { 1.0 });
        let window: MaskedArray<f64, Ix3> = MaskedArray::from_nodata(data, None, Some(-1.0)).unwrap();
        let diagnostics = SourceDiagnostics::from_window("dem.tif", &window);
        assert_eq!(diagnostics.valid_counts, vec![4, 2]);
        assert!((diagnostics.missing_percentage - 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_crop_rejects_repeated_file_names() {
        let config = PipelineConfig {
            feature_sets: vec![
                FeatureSet::new(["/data/a/dem.tif"]),
                FeatureSet::new(["/data/b/dem.tif"]),
            ],
            extents: Some(crate::types::Extents::new(Some(0.0), None, None, None)),
            ..Default::default()
        };
        let outcomes = crate::core::group::LocalGroup::launch(2, |group| {
            Ok(matches!(
                crop_covariates(group, &config, None),
                Err(GridError::InvalidConfig(_))
            ))
        })
        .unwrap();
        assert_eq!(outcomes, vec![true, true]);
    }

    #[test]
    fn test_missing_covariates_rejected() {
        let config = PipelineConfig::default();
        assert!(matches!(image_bounds(&config), Err(GridError::InvalidConfig(_))));
    }
}
