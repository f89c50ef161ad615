//! Collective writer reassembling per-rank row pieces into single-band GeoTIFFs

use crate::core::chunking::{split_ranges, ChunkPlanner};
use crate::core::geometry::bbox_to_affine;
use crate::core::group::{ProcessGroup, COORDINATOR};
use crate::core::masked::MaskedArray;
use crate::io::raster_ops::{resample, ResamplingKernel};
use crate::types::{BoundingBox, GeoTransform, GridError, GridResult};
use gdal::raster::Buffer;
use gdal::{Dataset, DatasetOptions, DriverManager, GdalOpenFlags, Metadata};
use ndarray::{Array3, Ix3};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// No-data value embedded in, and written to, every output file
pub const WRITER_NODATA: f32 = -1e20;

/// Output geometry and naming for a [`RasterWriter`]
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// `(width, height)` of the output grid
    pub shape: (usize, usize),
    pub bbox: BoundingBox,
    /// WKT written into every output
    pub crs: Option<String>,
    pub n_subchunks: usize,
    /// Path template; `{}` is replaced by the band's file tag
    pub outpath: String,
    pub outbands: usize,
    pub band_tags: Option<Vec<String>>,
    /// Every rank writes its own rows instead of funneling through the coordinator
    pub independent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Open,
    Writing,
    Closed,
}

/// Band count plus (file tag, band label) per output band
fn band_labels(band_tags: Option<&[String]>, outbands: usize) -> (usize, Vec<String>, Vec<String>) {
    match band_tags {
        Some(tags) => {
            let mut outbands = outbands;
            if outbands > tags.len() {
                log::warn!(
                    "Specified more outbands ({}) than there are prediction tags available ({}). \
                     Limiting outbands to number of prediction tags.",
                    outbands,
                    tags.len()
                );
                outbands = tags.len();
            }
            let file_tags = tags
                .iter()
                .map(|t| t.to_lowercase().split_whitespace().collect::<Vec<_>>().join("_"))
                .collect();
            (outbands, file_tags, tags.to_vec())
        }
        None => {
            let tags: Vec<String> = (0..outbands).map(|b| b.to_string()).collect();
            (outbands, tags.clone(), tags)
        }
    }
}

fn output_path(template: &str, tag: &str) -> PathBuf {
    PathBuf::from(template.replacen("{}", tag, 1))
}

fn thumbnail_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}_thumbnail.{}", stem, ext.to_string_lossy()),
        None => format!("{}_thumbnail", stem),
    };
    path.with_file_name(name)
}

fn create_output(
    path: &Path,
    label: &str,
    shape: (usize, usize),
    transform: &GeoTransform,
    crs: Option<&str>,
) -> GridResult<Dataset> {
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut dataset = driver.create_with_band_type::<f32, _>(path, shape.0 as isize, shape.1 as isize, 1)?;
    dataset.set_geo_transform(&transform.to_gdal())?;
    if let Some(wkt) = crs {
        dataset.set_projection(wkt)?;
    }
    {
        let mut band = dataset.rasterband(1)?;
        band.set_no_data_value(Some(WRITER_NODATA as f64))?;
        band.set_metadata_item("image_type", label, "")?;
    }
    Ok(dataset)
}

/// Write logical rows `rows` of an `(x, y, band)` piece, one band per file.
/// Logical row 0 is the southern edge, so the rows land flipped in the file.
fn write_piece(files: &[Dataset], piece: &Array3<f32>, rows: &Range<usize>, height: usize) -> GridResult<()> {
    let (width, n, bands) = piece.dim();
    if n != rows.len() {
        return Err(GridError::Processing(format!(
            "piece has {} rows but rows {:?} were assigned",
            n, rows
        )));
    }
    if n == 0 {
        return Ok(());
    }
    if bands < files.len() {
        return Err(GridError::Processing(format!(
            "piece has {} bands for {} output files",
            bands,
            files.len()
        )));
    }

    let top = height - rows.end;
    for (b, dataset) in files.iter().enumerate() {
        let mut values = Vec::with_capacity(width * n);
        for r in 0..n {
            let y = n - 1 - r;
            values.extend((0..width).map(|x| piece[[x, y, b]]));
        }
        let buffer = Buffer::new((width, n), values);
        let mut band = dataset.rasterband(1)?;
        band.write((0, top as isize), (width, n), &buffer)?;
    }
    Ok(())
}

/// Writer shared by all ranks of a group: `OPEN -> (WRITING)* -> CLOSED`.
///
/// `write` and `close` are collective.
pub struct RasterWriter<'g, G: ProcessGroup> {
    group: &'g G,
    shape: (usize, usize),
    transform: GeoTransform,
    planner: ChunkPlanner,
    independent: bool,
    // coordinator-only in funneled mode, empty otherwise
    files: Vec<Dataset>,
    file_names: Vec<PathBuf>,
    state: WriterState,
}

impl<'g, G: ProcessGroup> RasterWriter<'g, G> {
    pub fn new(group: &'g G, config: WriterConfig) -> GridResult<Self> {
        let (width, height) = config.shape;
        if width == 0 || height == 0 {
            return Err(GridError::InvalidConfig(format!("empty output shape {:?}", config.shape)));
        }
        if !config.outpath.contains("{}") {
            return Err(GridError::InvalidConfig(format!(
                "output template '{}' has no '{{}}' placeholder",
                config.outpath
            )));
        }

        let bbox = &config.bbox;
        let (transform, _, _) = bbox_to_affine(bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat, width, height);
        let planner = ChunkPlanner::new(height, group.size(), config.n_subchunks)?;
        let (outbands, file_tags, labels) = band_labels(config.band_tags.as_deref(), config.outbands);
        let paths: Vec<PathBuf> = file_tags
            .iter()
            .take(outbands)
            .map(|tag| output_path(&config.outpath, tag))
            .collect();

        let mut files = Vec::new();
        let mut create_error = None;
        if group.is_coordinator() {
            for (path, label) in paths.iter().zip(&labels) {
                match create_output(path, label, config.shape, &transform, config.crs.as_deref()) {
                    Ok(dataset) => files.push(dataset),
                    Err(e) => {
                        create_error = Some(e);
                        break;
                    }
                }
            }
            log::info!("Created {} output files for a {}x{} grid", files.len(), width, height);
        }
        if config.independent || create_error.is_some() {
            // closed here so every rank can reopen the files for update
            files.clear();
        }

        let file_names = group.broadcast(if group.is_coordinator() {
            Some(create_error.is_none().then(|| paths.clone()))
        } else {
            None
        })?;
        if let Some(e) = create_error {
            return Err(e);
        }
        let file_names =
            file_names.ok_or_else(|| GridError::Collective("coordinator failed to create output files".to_string()))?;

        Ok(Self {
            group,
            shape: config.shape,
            transform,
            planner,
            independent: config.independent,
            files,
            file_names,
            state: WriterState::Open,
        })
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn file_names(&self) -> &[PathBuf] {
        &self.file_names
    }

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn planner(&self) -> &ChunkPlanner {
        &self.planner
    }

    /// Rows this rank must supply for `subchunk_index`
    pub fn rows_for(&self, subchunk_index: usize) -> GridResult<Range<usize>> {
        self.planner.range(self.group.rank(), subchunk_index)
    }

    fn check_piece(&self, data: &MaskedArray<f32, Ix3>, rows: usize) -> GridResult<()> {
        let (width, n, bands) = data.dim();
        if width != self.shape.0 || n != rows || bands < self.file_names.len() {
            return Err(GridError::Processing(format!(
                "[rank {}] piece of shape ({}, {}, {}) does not fit ({}, {}, >={})",
                self.group.rank(),
                width,
                n,
                bands,
                self.shape.0,
                rows,
                self.file_names.len()
            )));
        }
        Ok(())
    }

    /// Write this rank's rows for one subchunk pass. Masked cells are written
    /// as [`WRITER_NODATA`]. A rank with an unusable piece still takes part
    /// and reports the problem once the pass is over.
    pub fn write(&mut self, data: &MaskedArray<f32, Ix3>, subchunk_index: usize) -> GridResult<()> {
        if self.state == WriterState::Closed {
            return Err(GridError::WriterClosed);
        }
        let rows = self.rows_for(subchunk_index)?;

        let mut local_error = None;
        let payload = match self.check_piece(data, rows.len()) {
            Ok(()) => Some(data.filled(WRITER_NODATA)),
            Err(e) => {
                local_error = Some(e);
                None
            }
        };

        self.group.barrier();
        log::info!("[rank {}] Writing partition to output file", self.group.rank());

        let outcome = if self.independent {
            self.write_independent(payload, &rows)
        } else {
            self.write_funneled(payload, subchunk_index)
        };

        self.group.barrier();
        self.state = WriterState::Writing;

        match local_error {
            Some(e) => Err(e),
            None => outcome,
        }
    }

    fn write_funneled(&self, payload: Option<Array3<f32>>, subchunk_index: usize) -> GridResult<()> {
        if !self.group.is_coordinator() {
            return self.group.send(payload, COORDINATOR);
        }

        let mut own = payload;
        let mut first_error = None;
        for node in (0..self.group.size()).rev() {
            let piece = if node == COORDINATOR {
                own.take()
            } else {
                self.group.recv::<Option<Array3<f32>>>(node)?
            };
            let rows = self.planner.range(node, subchunk_index)?;
            let outcome = match piece {
                Some(piece) => write_piece(&self.files, &piece, &rows, self.shape.1),
                None => Err(GridError::Processing(format!(
                    "rank {} supplied no data for subchunk {}",
                    node, subchunk_index
                ))),
            };
            if let Err(e) = outcome {
                log::warn!("Skipping rows {:?}: {}", rows, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Ranks take turns, in rank order, so two update handles never flush the
    /// same file at once
    fn write_independent(&self, payload: Option<Array3<f32>>, rows: &Range<usize>) -> GridResult<()> {
        let rank = self.group.rank();
        let token = if rank > 0 {
            self.group.recv::<()>(rank - 1)
        } else {
            Ok(())
        };

        let outcome = token.and_then(|_| match &payload {
            Some(piece) => {
                let files = self
                    .file_names
                    .iter()
                    .map(|path| {
                        let options = DatasetOptions {
                            open_flags: GdalOpenFlags::GDAL_OF_UPDATE | GdalOpenFlags::GDAL_OF_RASTER,
                            ..Default::default()
                        };
                        Dataset::open_ex(path, options).map_err(GridError::from)
                    })
                    .collect::<GridResult<Vec<Dataset>>>()?;
                write_piece(&files, piece, rows, self.shape.1)
            }
            None => Ok(()),
        });

        if rank + 1 < self.group.size() {
            self.group.send((), rank + 1)?;
        }
        outcome
    }

    /// Finalize the outputs. Collective.
    pub fn close(&mut self) -> GridResult<()> {
        if self.state == WriterState::Closed {
            return Err(GridError::WriterClosed);
        }
        if self.group.is_coordinator() {
            // dropping a dataset flushes and closes it
            self.files.clear();
            log::info!("Closed {} output files", self.file_names.len());
        }
        self.group.barrier();
        self.state = WriterState::Closed;
        Ok(())
    }

    /// Resample this rank's share of the closed outputs into
    /// `<stem>_thumbnail<ext>` files. Not collective.
    pub fn output_thumbnails(&self, ratio: f64) -> GridResult<Vec<PathBuf>> {
        if self.state != WriterState::Closed {
            return Err(GridError::InvalidConfig(
                "thumbnails can only be made from closed outputs".to_string(),
            ));
        }

        let share = split_ranges(self.file_names.len(), self.group.size())
            .into_iter()
            .nth(self.group.rank())
            .unwrap_or(0..0);

        let mut thumbnails = Vec::with_capacity(share.len());
        for path in &self.file_names[share] {
            let thumbnail = thumbnail_path(path);
            resample(path, &thumbnail, ratio, ResamplingKernel::Average)?;
            thumbnails.push(thumbnail);
        }
        Ok(thumbnails)
    }
}
