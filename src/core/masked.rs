use crate::types::{GridError, GridResult};
use ndarray::{s, Array, Axis, Dimension, Ix3, NdIndex, Zip};
use num_traits::Float;
#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Value array paired with a same-shaped mask; `true` marks an invalid cell.
/// `mask == None` means every cell is valid.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskedArray<T, D: Dimension> {
    data: Array<T, D>,
    mask: Option<Array<bool, D>>,
}

impl<T, D: Dimension> MaskedArray<T, D> {
    pub fn new(data: Array<T, D>, mask: Option<Array<bool, D>>) -> GridResult<Self> {
        if let Some(m) = &mask {
            if m.shape() != data.shape() {
                return Err(GridError::Processing(format!(
                    "mask shape {:?} does not match data shape {:?}",
                    m.shape(),
                    data.shape()
                )));
            }
        }
        Ok(Self { data, mask })
    }

    pub fn unmasked(data: Array<T, D>) -> Self {
        Self { data, mask: None }
    }

    pub fn data(&self) -> &Array<T, D> {
        &self.data
    }

    pub fn mask(&self) -> Option<&Array<bool, D>> {
        self.mask.as_ref()
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn dim(&self) -> D::Pattern {
        self.data.dim()
    }

    pub fn is_masked<I: NdIndex<D> + Copy>(&self, index: I) -> bool {
        self.mask
            .as_ref()
            .and_then(|m| m.get(index).copied())
            .unwrap_or(false)
    }

    pub fn masked_count(&self) -> usize {
        self.mask
            .as_ref()
            .map_or(0, |m| m.iter().filter(|&&v| v).count())
    }

    pub fn into_parts(self) -> (Array<T, D>, Option<Array<bool, D>>) {
        (self.data, self.mask)
    }

    /// Percentage of masked cells, 0 for an empty array
    pub fn missing_percentage(&self) -> f64 {
        let total = self.data.len();
        if total == 0 {
            return 0.0;
        }
        self.masked_count() as f64 / total as f64 * 100.0
    }
}

impl<T, D> MaskedArray<T, D>
where
    T: Float + Send + Sync,
    D: Dimension,
{
    /// Mask every cell equal to `nodata` or NaN, on top of an existing mask
    pub fn from_nodata(data: Array<T, D>, mask: Option<Array<bool, D>>, nodata: Option<T>) -> GridResult<Self> {
        let mut mask = match mask {
            Some(m) => m,
            None => Array::from_elem(data.raw_dim(), false),
        };
        if mask.shape() != data.shape() {
            return Err(GridError::Processing(format!(
                "mask shape {:?} does not match data shape {:?}",
                mask.shape(),
                data.shape()
            )));
        }

        let flag = |m: &mut bool, &v: &T| {
            if v.is_nan() || nodata.map_or(false, |nd| v == nd) {
                *m = true;
            }
        };
        #[cfg(feature = "parallel")]
        Zip::from(&mut mask).and(&data).par_for_each(flag);
        #[cfg(not(feature = "parallel"))]
        Zip::from(&mut mask).and(&data).for_each(flag);

        Ok(Self {
            data,
            mask: Some(mask),
        })
    }

    /// Copy of the data with masked cells replaced by `fill`
    pub fn filled(&self, fill: T) -> Array<T, D> {
        let mut out = self.data.clone();
        if let Some(mask) = &self.mask {
            let replace = |v: &mut T, &m: &bool| {
                if m {
                    *v = fill;
                }
            };
            #[cfg(feature = "parallel")]
            Zip::from(&mut out).and(mask).par_for_each(replace);
            #[cfg(not(feature = "parallel"))]
            Zip::from(&mut out).and(mask).for_each(replace);
        }
        out
    }

    pub fn to_f32(&self) -> MaskedArray<f32, D> {
        MaskedArray {
            data: self.data.mapv(|v| v.to_f32().unwrap_or(f32::NAN)),
            mask: self.mask.clone(),
        }
    }
}

impl<T: Clone> MaskedArray<T, Ix3> {
    /// Sub-window `[min_x, max_x) x [min_y, max_y)` of an `(x, y, band)` array
    pub fn window(&self, min_x: usize, max_x: usize, min_y: usize, max_y: usize) -> Self {
        Self {
            data: self.data.slice(s![min_x..max_x, min_y..max_y, ..]).to_owned(),
            mask: self
                .mask
                .as_ref()
                .map(|m| m.slice(s![min_x..max_x, min_y..max_y, ..]).to_owned()),
        }
    }

    /// Valid (unmasked) cell count per band of an `(x, y, band)` array
    pub fn band_valid_counts(&self) -> Vec<usize> {
        let bands = self.data.len_of(Axis(2));
        let per_band = self.data.len_of(Axis(0)) * self.data.len_of(Axis(1));
        match &self.mask {
            None => vec![per_band; bands],
            #[cfg(feature = "parallel")]
            Some(mask) => mask
                .axis_iter(Axis(2))
                .into_par_iter()
                .map(|band| band.iter().filter(|&&m| !m).count())
                .collect(),
            #[cfg(not(feature = "parallel"))]
            Some(mask) => mask
                .axis_iter(Axis(2))
                .map(|band| band.iter().filter(|&&m| !m).count())
                .collect(),
        }
    }

    pub fn bands(&self) -> usize {
        self.data.len_of(Axis(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    #[test]
    fn test_nodata_and_nan_are_masked() {
        let data = array![[1.0, -9999.0], [f64::NAN, 4.0]];
        let masked = MaskedArray::from_nodata(data, None, Some(-9999.0)).unwrap();
        assert!(!masked.is_masked([0, 0]));
        assert!(masked.is_masked([0, 1]));
        assert!(masked.is_masked([1, 0]));
        assert_eq!(masked.masked_count(), 2);
        assert_eq!(masked.missing_percentage(), 50.0);
    }

    #[test]
    fn test_filled_replaces_masked_cells() {
        let data = array![[1.0f32, 2.0], [3.0, 4.0]];
        let mask = array![[false, true], [true, false]];
        let masked = MaskedArray::new(data, Some(mask)).unwrap();
        let filled = masked.filled(-1e20);
        assert_eq!(filled, array![[1.0f32, -1e20], [-1e20, 4.0]]);
    }

    #[test]
    fn test_mask_shape_mismatch_rejected() {
        let data = Array3::<f64>::zeros((2, 2, 1));
        let mask = Array3::from_elem((2, 3, 1), false);
        assert!(MaskedArray::new(data, Some(mask)).is_err());
    }

    #[test]
    fn test_band_valid_counts() {
        let mut mask = Array3::from_elem((2, 2, 2), false);
        mask[[0, 0, 1]] = true;
        mask[[1, 1, 1]] = true;
        let masked = MaskedArray::new(Array3::<f64>::zeros((2, 2, 2)), Some(mask)).unwrap();
        assert_eq!(masked.band_valid_counts(), vec![4, 2]);
        assert_eq!(masked.window(0, 1, 0, 2).band_valid_counts(), vec![2, 1]);
    }
}
