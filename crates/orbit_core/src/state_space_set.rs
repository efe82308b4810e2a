use crate::error::{EvolutionError, EvolutionResult};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Ordered points of a common dimension, stored row-major in one buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StateSpaceSetFields")]
pub struct StateSpaceSet {
    dimension: usize,
    data: Vec<f64>,
}

#[derive(Deserialize)]
struct StateSpaceSetFields {
    dimension: usize,
    data: Vec<f64>,
}

impl TryFrom<StateSpaceSetFields> for StateSpaceSet {
    type Error = EvolutionError;

    fn try_from(fields: StateSpaceSetFields) -> EvolutionResult<Self> {
        let StateSpaceSetFields { dimension, data } = fields;
        let whole_points = if dimension == 0 {
            data.is_empty()
        } else {
            data.len() % dimension == 0
        };
        if !whole_points {
            return Err(EvolutionError::dimension(format!(
                "{} values do not split into points of dimension {dimension}",
                data.len()
            )));
        }
        Ok(Self { dimension, data })
    }
}

impl StateSpaceSet {
    pub(crate) fn with_capacity(dimension: usize, points: usize) -> Self {
        Self {
            dimension,
            data: Vec::with_capacity(dimension * points),
        }
    }

    pub fn from_points(points: &[Vec<f64>]) -> EvolutionResult<Self> {
        let dimension = points.first().map(Vec::len).unwrap_or(0);
        if dimension == 0 {
            return Err(EvolutionError::dimension(
                "state space set needs points of positive dimension",
            ));
        }
        let mut set = Self::with_capacity(dimension, points.len());
        for (i, point) in points.iter().enumerate() {
            if point.len() != dimension {
                return Err(EvolutionError::dimension(format!(
                    "point {i} has dimension {}, expected {dimension}",
                    point.len()
                )));
            }
            set.push(point);
        }
        Ok(set)
    }

    pub(crate) fn push(&mut self, point: &[f64]) {
        debug_assert_eq!(point.len(), self.dimension);
        self.data.extend_from_slice(point);
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn point(&self, index: usize) -> Option<&[f64]> {
        let start = index.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    pub fn first(&self) -> Option<&[f64]> {
        self.point(0)
    }

    pub fn last(&self) -> Option<&[f64]> {
        self.len().checked_sub(1).and_then(|i| self.point(i))
    }

    pub fn iter(&self) -> std::slice::ChunksExact<'_, f64> {
        self.data.chunks_exact(self.dimension.max(1))
    }

    /// Values of coordinate `j` across all points.
    pub fn column(&self, j: usize) -> Option<Vec<f64>> {
        if j >= self.dimension {
            return None;
        }
        Some(self.iter().map(|p| p[j]).collect())
    }

    /// Per-coordinate minimum. Empty for an empty set.
    pub fn minima(&self) -> Vec<f64> {
        self.fold_columns(f64::INFINITY, f64::min)
    }

    pub fn maxima(&self) -> Vec<f64> {
        self.fold_columns(f64::NEG_INFINITY, f64::max)
    }

    fn fold_columns(&self, init: f64, f: fn(f64, f64) -> f64) -> Vec<f64> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut acc = vec![init; self.dimension];
        for point in self.iter() {
            for (a, &v) in acc.iter_mut().zip(point) {
                *a = f(*a, v);
            }
        }
        acc
    }

    /// Flat row-major view.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// One row per point.
    pub fn to_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(self.len(), self.dimension, &self.data)
    }
}

impl std::ops::Index<usize> for StateSpaceSet {
    type Output = [f64];

    fn index(&self, index: usize) -> &[f64] {
        let start = index * self.dimension;
        &self.data[start..start + self.dimension]
    }
}

impl<'a> IntoIterator for &'a StateSpaceSet {
    type Item = &'a [f64];
    type IntoIter = std::slice::ChunksExact<'a, f64>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StateSpaceSet {
        StateSpaceSet::from_points(&[vec![1.0, -2.0], vec![3.0, 0.5], vec![-1.0, 4.0]]).unwrap()
    }

    #[test]
    fn indexing_and_columns() {
        let set = sample();
        assert_eq!(set.len(), 3);
        assert_eq!(set.dimension(), 2);
        assert_eq!(&set[1], &[3.0, 0.5]);
        assert_eq!(set.point(3), None);
        assert_eq!(set.last(), Some(&[-1.0, 4.0][..]));
        assert_eq!(set.column(0), Some(vec![1.0, 3.0, -1.0]));
        assert_eq!(set.column(2), None);
        assert_eq!(set.iter().count(), 3);
    }

    #[test]
    fn extrema_per_coordinate() {
        let set = sample();
        assert_eq!(set.minima(), vec![-1.0, -2.0]);
        assert_eq!(set.maxima(), vec![3.0, 4.0]);
    }

    #[test]
    fn matrix_has_one_row_per_point() {
        let m = sample().to_matrix();
        assert_eq!(m.shape(), (3, 2));
        assert_eq!(m[(2, 1)], 4.0);
        assert_eq!(m[(0, 1)], -2.0);
    }

    #[test]
    fn deserialize_requires_whole_points() {
        let set: StateSpaceSet =
            serde_json::from_str(r#"{"dimension":2,"data":[1.0,2.0,3.0,4.0]}"#).unwrap();
        assert_eq!(set.to_matrix().shape(), (2, 2));

        let err = serde_json::from_str::<StateSpaceSet>(r#"{"dimension":2,"data":[1,2,3]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("dimension 2"));
        assert!(serde_json::from_str::<StateSpaceSet>(r#"{"dimension":0,"data":[1]}"#).is_err());
    }

    #[test]
    fn rejects_ragged_points() {
        let err = StateSpaceSet::from_points(&[vec![1.0, 2.0], vec![1.0]]).unwrap_err();
        assert!(matches!(err, EvolutionError::Dimension { .. }));
        assert!(StateSpaceSet::from_points(&[]).is_err());
    }
}
