use crate::core::targets::{FieldValues, Targets};
use crate::types::{BoundingBox, Extents, GridError, GridResult};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::vector::{FieldValue, LayerAccess, OGRFieldType};
use gdal::Dataset;
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;
use std::path::Path;

/// Options controlling how point targets are read
#[derive(Debug, Clone, Default)]
pub struct TargetLoadOptions {
    /// Field holding the target value; the first field when unset
    pub target_field: Option<String>,
    /// WKT of the covariate rasters, used to reproject the points
    pub covariate_crs: Option<String>,
    /// Keep only points inside these extents; unset elements default to the
    /// vector layer's own extent
    pub extents: Option<Extents>,
    /// Covariate bounds, used only to warn about points outside them
    pub covariate_bounds: Option<BoundingBox>,
}

enum ColumnBuilder {
    Real(Vec<f64>),
    Text(Vec<String>),
}

impl ColumnBuilder {
    fn push(&mut self, value: Option<FieldValue>) {
        match self {
            ColumnBuilder::Real(values) => values.push(match value {
                Some(FieldValue::RealValue(v)) => v,
                Some(FieldValue::IntegerValue(v)) => v as f64,
                Some(FieldValue::Integer64Value(v)) => v as f64,
                Some(FieldValue::StringValue(s)) => s.trim().parse().unwrap_or(f64::NAN),
                _ => f64::NAN,
            }),
            ColumnBuilder::Text(values) => values.push(match value {
                Some(FieldValue::StringValue(s)) => s,
                Some(FieldValue::RealValue(v)) => v.to_string(),
                Some(FieldValue::IntegerValue(v)) => v.to_string(),
                Some(FieldValue::Integer64Value(v)) => v.to_string(),
                _ => String::new(),
            }),
        }
    }

    fn finish(self) -> FieldValues {
        match self {
            ColumnBuilder::Real(values) => FieldValues::Real(Array1::from(values)),
            ColumnBuilder::Text(values) => FieldValues::Text(Array1::from(values)),
        }
    }
}

fn is_numeric(field_type: OGRFieldType::Type) -> bool {
    field_type == OGRFieldType::OFTReal
        || field_type == OGRFieldType::OFTInteger
        || field_type == OGRFieldType::OFTInteger64
}

/// Number of records in a vector file
pub fn number_of_targets<P: AsRef<Path>>(filename: P) -> GridResult<u64> {
    let dataset = Dataset::open(filename.as_ref())?;
    let layer = dataset.layer(0)?;
    Ok(layer.feature_count())
}

/// Source CRS from the `.prj` sidecar, if it exists and parses
fn sidecar_crs(filename: &Path) -> Option<SpatialRef> {
    let prj_file = filename.with_extension("prj");
    let wkt = match std::fs::read_to_string(&prj_file) {
        Ok(text) => text.lines().next().unwrap_or_default().to_string(),
        Err(_) => {
            log::warn!(
                "Could not find any '.prj' file for target shapefile. Ensure the target \
                 shapefile is in the same projection as the covariates or errors will occur."
            );
            return None;
        }
    };
    match SpatialRef::from_wkt(&wkt) {
        Ok(srs) => Some(srs),
        Err(_) => {
            log::warn!(
                "Found a '.prj' file for target shapefile but its text is not in 'wkt' format. \
                 Continuing without reprojecting."
            );
            None
        }
    }
}

fn reproject(filename: &Path, covariate_crs: Option<&str>, xs: &mut [f64], ys: &mut [f64]) -> GridResult<()> {
    let Some(covariate_wkt) = covariate_crs else {
        log::warn!(
            "Could not get covariate CRS for reprojecting target shapefile. Ensure the target \
             shapefile is in the same projection as the covariates or errors will occur."
        );
        return Ok(());
    };
    let Some(src) = sidecar_crs(filename) else {
        return Ok(());
    };
    let dst = match SpatialRef::from_wkt(covariate_wkt) {
        Ok(dst) => dst,
        Err(e) => {
            log::warn!("Covariate CRS is not valid WKT ({}). Continuing without reprojecting.", e);
            return Ok(());
        }
    };

    if src == dst {
        return Ok(());
    }

    src.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    dst.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    log::info!("Reprojecting {} target positions into the covariate CRS", xs.len());
    let transform = CoordTransform::new(&src, &dst)?;
    let mut zs = vec![0.0; xs.len()];
    transform.transform_coords(xs, ys, &mut zs)?;
    Ok(())
}

/// Read point targets from a vector file, in file order
pub fn load_point_targets<P: AsRef<Path>>(filename: P, options: &TargetLoadOptions) -> GridResult<Targets> {
    let filename = filename.as_ref();
    if !filename.is_file() {
        return Err(GridError::MissingFile(filename.to_path_buf()));
    }
    log::info!("Loading targets from {}", filename.display());

    let dataset = Dataset::open(filename)?;
    let mut layer = dataset.layer(0)?;

    let schema: Vec<(String, OGRFieldType::Type)> = layer
        .defn()
        .fields()
        .map(|field| (field.name(), field.field_type()))
        .collect();
    let candidates: Vec<String> = schema.iter().map(|(name, _)| name.clone()).collect();
    let target_field = match &options.target_field {
        Some(name) => name.clone(),
        None => candidates.first().cloned().ok_or_else(|| GridError::MissingTargetField {
            field: "<first field>".to_string(),
            candidates: Vec::new(),
        })?,
    };
    if !candidates.contains(&target_field) {
        return Err(GridError::MissingTargetField {
            field: target_field,
            candidates,
        });
    }

    let layer_bounds = layer.get_extent().ok().map(|e| BoundingBox::new(e.MinX, e.MinY, e.MaxX, e.MaxY));

    let mut columns: Vec<(String, ColumnBuilder)> = schema
        .iter()
        .map(|(name, field_type)| {
            let builder = if is_numeric(*field_type) || *name == target_field {
                ColumnBuilder::Real(Vec::new())
            } else {
                ColumnBuilder::Text(Vec::new())
            };
            (name.clone(), builder)
        })
        .collect();
    let mut xs = Vec::new();
    let mut ys = Vec::new();

    for feature in layer.features() {
        let geometry = feature.geometry_by_index(0)?;
        let (x, y, _) = geometry.get_point(0);
        xs.push(x);
        ys.push(y);
        for (name, column) in columns.iter_mut() {
            column.push(feature.field(name.as_str())?);
        }
    }

    reproject(filename, options.covariate_crs.as_deref(), &mut xs, &mut ys)?;

    let keep: Vec<usize> = match (&options.extents, layer_bounds) {
        (Some(extents), Some(bounds)) => {
            let bbox = extents.resolve(&bounds);
            (0..xs.len()).filter(|&i| bbox.contains(xs[i], ys[i])).collect()
        }
        (Some(extents), None) => {
            let bbox = extents.resolve(&BoundingBox::new(
                f64::NEG_INFINITY,
                f64::NEG_INFINITY,
                f64::INFINITY,
                f64::INFINITY,
            ));
            (0..xs.len()).filter(|&i| bbox.contains(xs[i], ys[i])).collect()
        }
        (None, _) => {
            if let Some(bounds) = &options.covariate_bounds {
                let outside = (0..xs.len()).filter(|&i| !bounds.contains(xs[i], ys[i])).count();
                if outside > 0 {
                    log::warn!(
                        "{} of {} targets lie outside the covariate bounds {:?}",
                        outside,
                        xs.len(),
                        bounds
                    );
                }
            }
            (0..xs.len()).collect()
        }
    };

    let mut positions = Array2::<f64>::zeros((xs.len(), 2));
    for i in 0..xs.len() {
        positions[[i, 0]] = xs[i];
        positions[[i, 1]] = ys[i];
    }

    let mut observations = None;
    let mut fields = BTreeMap::new();
    for (name, column) in columns {
        match column.finish() {
            FieldValues::Real(values) if name == target_field => observations = Some(values),
            values => {
                fields.insert(name, values);
            }
        }
    }
    let observations = observations.ok_or_else(|| GridError::MissingTargetField {
        field: target_field.clone(),
        candidates: Vec::new(),
    })?;

    let targets = Targets::new(positions, observations, fields)?;
    if keep.len() == targets.len() {
        return Ok(targets);
    }
    log::info!("Kept {} of {} targets inside the requested extents", keep.len(), targets.len());
    Ok(targets.select(&keep))
}
