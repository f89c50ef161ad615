//! Point targets and their deterministic load-and-scatter across the group

use crate::core::chunking::split_ranges;
use crate::core::group::ProcessGroup;
use crate::io::vector::{load_point_targets, TargetLoadOptions};
use crate::types::{GridError, GridResult};
use ndarray::{concatenate, s, Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;

/// Auxiliary per-target column
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValues {
    Real(Array1<f64>),
    Text(Array1<String>),
}

/// Element type of an auxiliary column, broadcast ahead of the data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Real,
    Text,
}

impl FieldValues {
    pub fn len(&self) -> usize {
        match self {
            FieldValues::Real(v) => v.len(),
            FieldValues::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValues::Real(_) => FieldKind::Real,
            FieldValues::Text(_) => FieldKind::Text,
        }
    }

    fn select(&self, indices: &[usize]) -> Self {
        match self {
            FieldValues::Real(v) => FieldValues::Real(v.select(Axis(0), indices)),
            FieldValues::Text(v) => FieldValues::Text(v.select(Axis(0), indices)),
        }
    }

    fn slice(&self, range: std::ops::Range<usize>) -> Self {
        match self {
            FieldValues::Real(v) => FieldValues::Real(v.slice(s![range]).to_owned()),
            FieldValues::Text(v) => FieldValues::Text(v.slice(s![range]).to_owned()),
        }
    }
}

/// Positions (`N x 2`), observations and auxiliary columns sharing one row order
#[derive(Debug, Clone, PartialEq)]
pub struct Targets {
    pub positions: Array2<f64>,
    pub observations: Array1<f64>,
    pub fields: BTreeMap<String, FieldValues>,
}

impl Targets {
    pub fn new(
        positions: Array2<f64>,
        observations: Array1<f64>,
        fields: BTreeMap<String, FieldValues>,
    ) -> GridResult<Self> {
        let n = observations.len();
        if positions.ncols() != 2 {
            return Err(GridError::InvalidTargets(format!(
                "positions must have 2 columns, got {}",
                positions.ncols()
            )));
        }
        if positions.nrows() != n {
            return Err(GridError::InvalidTargets(format!(
                "{} positions for {} observations",
                positions.nrows(),
                n
            )));
        }
        if let Some((name, values)) = fields.iter().find(|(_, v)| v.len() != n) {
            return Err(GridError::InvalidTargets(format!(
                "field '{}' has {} rows, expected {}",
                name,
                values.len(),
                n
            )));
        }
        Ok(Self {
            positions,
            observations,
            fields,
        })
    }

    pub fn empty() -> Self {
        Self {
            positions: Array2::zeros((0, 2)),
            observations: Array1::zeros(0),
            fields: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn field_schema(&self) -> Vec<(String, FieldKind)> {
        self.fields.iter().map(|(k, v)| (k.clone(), v.kind())).collect()
    }

    /// Rows at `indices`, in that order
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            positions: self.positions.select(Axis(0), indices),
            observations: self.observations.select(Axis(0), indices),
            fields: self
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.select(indices)))
                .collect(),
        }
    }

    pub fn slice(&self, range: std::ops::Range<usize>) -> Self {
        Self {
            positions: self.positions.slice(s![range.clone(), ..]).to_owned(),
            observations: self.observations.slice(s![range.clone()]).to_owned(),
            fields: self
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), v.slice(range.clone())))
                .collect(),
        }
    }

    /// Reorder every column by `order`
    pub fn sorted(&self, order: TargetOrder) -> Self {
        self.select(&order.permutation(&self.positions))
    }

    /// `pieces` contiguous, near-equal partitions in row order
    pub fn partition(&self, pieces: usize) -> Vec<Targets> {
        split_ranges(self.len(), pieces)
            .into_iter()
            .map(|range| self.slice(range))
            .collect()
    }

    /// Inverse of [`Targets::partition`]
    pub fn concatenate(parts: &[Targets]) -> GridResult<Targets> {
        let Some(first) = parts.first() else {
            return Ok(Targets::empty());
        };
        let positions: Vec<_> = parts.iter().map(|p| p.positions.view()).collect();
        let observations: Vec<_> = parts.iter().map(|p| p.observations.view()).collect();

        let mut fields = BTreeMap::new();
        for (name, values) in &first.fields {
            let merged = match values {
                FieldValues::Real(_) => {
                    let columns = parts
                        .iter()
                        .map(|p| match p.fields.get(name) {
                            Some(FieldValues::Real(v)) => Ok(v.view()),
                            _ => Err(GridError::InvalidTargets(format!("field '{}' differs between parts", name))),
                        })
                        .collect::<GridResult<Vec<_>>>()?;
                    FieldValues::Real(concatenate(Axis(0), &columns)?)
                }
                FieldValues::Text(_) => {
                    let columns = parts
                        .iter()
                        .map(|p| match p.fields.get(name) {
                            Some(FieldValues::Text(v)) => Ok(v.view()),
                            _ => Err(GridError::InvalidTargets(format!("field '{}' differs between parts", name))),
                        })
                        .collect::<GridResult<Vec<_>>>()?;
                    FieldValues::Text(concatenate(Axis(0), &columns)?)
                }
            };
            fields.insert(name.clone(), merged);
        }

        Targets::new(
            concatenate(Axis(0), &positions)?,
            concatenate(Axis(0), &observations)?,
            fields,
        )
    }
}

/// Total order imposed on targets before they are partitioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetOrder {
    /// By y, then x, then original record index
    #[default]
    RowMajor,
}

impl TargetOrder {
    pub fn compare(&self, a: (f64, f64, usize), b: (f64, f64, usize)) -> Ordering {
        match self {
            TargetOrder::RowMajor => a
                .1
                .total_cmp(&b.1)
                .then(a.0.total_cmp(&b.0))
                .then(a.2.cmp(&b.2)),
        }
    }

    /// Indices that put `positions` into this order
    pub fn permutation(&self, positions: &Array2<f64>) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..positions.nrows()).collect();
        indices.sort_unstable_by(|&i, &j| {
            self.compare(
                (positions[[i, 0]], positions[[i, 1]], i),
                (positions[[j, 0]], positions[[j, 1]], j),
            )
        });
        indices
    }
}

/// Load targets on the coordinator, sort them and give each rank one
/// contiguous partition. Every rank must call this.
pub fn load_targets<G: ProcessGroup, P: AsRef<Path>>(
    group: &G,
    filename: P,
    options: &TargetLoadOptions,
) -> GridResult<Targets> {
    let mut load_error = None;
    let mut partitions: Option<Vec<Targets>> = None;

    if group.is_coordinator() {
        match load_point_targets(filename.as_ref(), options) {
            Ok(targets) => {
                let sorted = targets.sorted(TargetOrder::RowMajor);
                partitions = Some(sorted.partition(group.size()));
            }
            Err(e) => load_error = Some(e),
        }
    }

    // schema goes first so every rank makes the same scatter calls
    let payload = if group.is_coordinator() {
        Some(partitions.as_ref().map(|p| p[0].field_schema()))
    } else {
        None
    };
    let schema = group.broadcast(payload)?;
    if let Some(e) = load_error {
        return Err(e);
    }
    let schema: Vec<(String, FieldKind)> =
        schema.ok_or_else(|| GridError::Collective("coordinator failed to load targets".to_string()))?;

    let parts = partitions.unwrap_or_default();
    let positions = group.scatter((!parts.is_empty()).then(|| parts.iter().map(|p| p.positions.clone()).collect()))?;
    let observations =
        group.scatter((!parts.is_empty()).then(|| parts.iter().map(|p| p.observations.clone()).collect()))?;

    let mut fields = BTreeMap::new();
    for (name, _) in &schema {
        let column = group.scatter((!parts.is_empty()).then(|| {
            parts
                .iter()
                .map(|p| p.fields.get(name).cloned())
                .collect::<Vec<Option<FieldValues>>>()
        }))?;
        let column = column
            .ok_or_else(|| GridError::InvalidTargets(format!("partition is missing field '{}'", name)))?;
        fields.insert(name.clone(), column);
    }

    let targets = Targets::new(positions, observations, fields)?;
    log::info!("[rank {}] Assigned {} targets", group.rank(), targets.len());
    Ok(targets)
}
