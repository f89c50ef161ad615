//! Training data published once by the coordinator and read by every rank

use crate::core::group::{ProcessGroup, SharedRegion};
use crate::core::targets::{FieldKind, FieldValues, Targets};
use crate::types::GridResult;
use ndarray::{Array, ArrayView, ArrayViewD, Dimension, IxDyn};

/// Shared region with the array shape it was published with
#[derive(Debug)]
pub struct SharedArray<T> {
    region: SharedRegion<T>,
    shape: Vec<usize>,
}

impl<T> SharedArray<T> {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn region(&self) -> &SharedRegion<T> {
        &self.region
    }

    pub fn view(&self) -> GridResult<ArrayViewD<'_, T>> {
        Ok(ArrayView::from_shape(IxDyn(&self.shape), self.region.as_slice())?)
    }

    /// View with a fixed dimensionality
    pub fn view_as<D: Dimension>(&self) -> GridResult<ArrayView<'_, T, D>> {
        Ok(self.view()?.into_dimensionality::<D>()?)
    }
}

/// Publish the coordinator's `local` array to every rank. Non-coordinators
/// pass `None`.
pub fn create_shared_array<G, T, D>(group: &G, local: Option<&Array<T, D>>) -> GridResult<SharedArray<T>>
where
    G: ProcessGroup,
    T: Clone + Send + Sync + 'static,
    D: Dimension,
{
    let shape = group.broadcast(if group.is_coordinator() {
        Some(local.map(|a| a.shape().to_vec()))
    } else {
        None
    })?;
    // an absent coordinator array is published as an empty region
    let shape = shape.unwrap_or_else(|| vec![0]);
    let len = shape.iter().product();

    // only arrays outside standard layout need a contiguous staging copy
    let staged: Option<Vec<T>> = local
        .filter(|a| a.as_slice().is_none())
        .map(|a| a.iter().cloned().collect());
    let contents = if group.is_coordinator() {
        Some(
            staged
                .as_deref()
                .or_else(|| local.and_then(|a| a.as_slice()))
                .unwrap_or(&[]),
        )
    } else {
        None
    };

    let region = group.allocate_shared(len, contents)?;
    Ok(SharedArray { region, shape })
}

/// Auxiliary target column held in shared memory
#[derive(Debug)]
pub enum SharedField {
    Real(SharedArray<f64>),
    Text(SharedArray<String>),
}

/// Training set visible to every rank without per-rank copies
#[derive(Debug)]
pub struct SharedTrainingData {
    pub features: SharedArray<f64>,
    pub positions: SharedArray<f64>,
    pub observations: SharedArray<f64>,
    pub fields: Vec<(String, SharedField)>,
}

impl SharedTrainingData {
    pub fn len(&self) -> usize {
        self.observations.shape().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Private copy of the shared targets
    pub fn targets(&self) -> GridResult<Targets> {
        let positions = self.positions.view_as::<ndarray::Ix2>()?.to_owned();
        let observations = self.observations.view_as::<ndarray::Ix1>()?.to_owned();
        let mut fields = std::collections::BTreeMap::new();
        for (name, field) in &self.fields {
            let values = match field {
                SharedField::Real(a) => FieldValues::Real(a.view_as::<ndarray::Ix1>()?.to_owned()),
                SharedField::Text(a) => FieldValues::Text(a.view_as::<ndarray::Ix1>()?.to_owned()),
            };
            fields.insert(name.clone(), values);
        }
        Targets::new(positions, observations, fields)
    }
}

/// Move the coordinator's training set into shared regions. Every rank calls
/// this; only the coordinator passes `Some`.
pub fn create_shared_training_data<G: ProcessGroup>(
    group: &G,
    targets: Option<&Targets>,
    features: Option<&ndarray::Array2<f64>>,
) -> GridResult<SharedTrainingData> {
    let empty = Targets::empty();
    let targets = if group.is_coordinator() {
        Some(targets.unwrap_or(&empty))
    } else {
        None
    };

    let features = create_shared_array(group, features)?;
    let observations = create_shared_array(group, targets.map(|t| &t.observations))?;
    let positions = create_shared_array(group, targets.map(|t| &t.positions))?;

    // every rank walks the same field list, in coordinator order
    let schema = group.broadcast(targets.map(|t| t.field_schema()))?;
    let mut fields = Vec::with_capacity(schema.len());
    for (name, kind) in schema {
        let local = targets.and_then(|t| t.fields.get(&name));
        let shared = match kind {
            FieldKind::Real => {
                let column = match local {
                    Some(FieldValues::Real(v)) => Some(v),
                    _ => None,
                };
                SharedField::Real(create_shared_array(group, column)?)
            }
            FieldKind::Text => {
                let column = match local {
                    Some(FieldValues::Text(v)) => Some(v),
                    _ => None,
                };
                SharedField::Text(create_shared_array(group, column)?)
            }
        };
        fields.push((name, shared));
    }

    log::info!(
        "[rank {}] Attached shared training data: {} targets, {} fields",
        group.rank(),
        observations.shape().first().copied().unwrap_or(0),
        fields.len()
    );

    Ok(SharedTrainingData {
        features,
        positions,
        observations,
        fields,
    })
}

/// Release every region of `data`. Every rank calls this exactly once per
/// [`create_shared_training_data`].
pub fn deallocate_shared_training_data<G: ProcessGroup>(group: &G, data: SharedTrainingData) -> GridResult<()> {
    let SharedTrainingData {
        features,
        positions,
        observations,
        fields,
    } = data;

    let mut ids = vec![observations.region.id(), positions.region.id(), features.region.id()];
    ids.extend(fields.iter().map(|(_, field)| match field {
        SharedField::Real(a) => a.region.id(),
        SharedField::Text(a) => a.region.id(),
    }));

    let mut outcomes = vec![
        group.release_shared(observations.region),
        group.release_shared(positions.region),
        group.release_shared(features.region),
    ];
    for (_, field) in fields {
        outcomes.push(match field {
            SharedField::Real(a) => group.release_shared(a.region),
            SharedField::Text(a) => group.release_shared(a.region),
        });
    }

    // every region is released before the first failure is reported
    let released = outcomes.into_iter().collect::<GridResult<Vec<()>>>();
    group.barrier();
    released?;
    group.verify_released(&ids)
}
