use serde::{Serialize, Deserialize};
use nalgebra::*;
use std::fmt::{self, Display};
use crate::error::{BayesError, Result};

/// Replication shape of a variable. A node with plates (M, N) holds M*N
/// independent copies of its variable, stored in row-major (last axis fastest)
/// order. Two plate tuples are compatible if, aligned from the right, each pair
/// of dimensions is equal or one of them is 1; missing leading axes behave as 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Plates(Vec<usize>);

impl Plates {

    pub fn new(dims : &[usize]) -> Self {
        Plates(dims.to_vec())
    }

    /// Plates of a single, non-replicated variable.
    pub fn scalar() -> Self {
        Plates(Vec::new())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn ndim(&self) -> usize {
        self.0.len()
    }

    /// Number of replicated elements (1 for scalar plates).
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Returns the first `n` axes (used to strip trailing axes which
    /// are consumed as a variable dimension by a child node).
    pub fn leading(&self, n : usize) -> Plates {
        Plates(self.0[..n.min(self.0.len())].to_vec())
    }

    pub fn is_compatible(&self, other : &Plates) -> bool {
        self.0.iter().rev().zip(other.0.iter().rev())
            .all(|(a, b)| a == b || *a == 1 || *b == 1)
    }

    /// Shape resulting from broadcasting self against other.
    pub fn broadcast(&self, other : &Plates) -> Result<Plates> {
        if !self.is_compatible(other) {
            return Err(BayesError::config(format!("Plates {} and {} are not broadcast-compatible", self, other)));
        }
        let n = self.ndim().max(other.ndim());
        let mut dims = vec![1; n];
        for (i, d) in dims.iter_mut().rev().enumerate() {
            let a = self.0.len().checked_sub(i + 1).map(|k| self.0[k]).unwrap_or(1);
            let b = other.0.len().checked_sub(i + 1).map(|k| other.0[k]).unwrap_or(1);
            *d = if a == 1 { b } else { a };
        }
        Ok(Plates(dims))
    }

    /// Whether a parent with plates `self` can be replicated into a child with
    /// plates `child` (every parent axis equals the aligned child axis or is 1,
    /// and the parent has no axes the child lacks).
    pub fn broadcasts_into(&self, child : &Plates) -> bool {
        self.ndim() <= child.ndim() &&
            self.0.iter().rev().zip(child.0.iter().rev()).all(|(p, c)| p == c || *p == 1)
    }

    /// Maps every flat element index of `self` (the child) into the flat index of
    /// the parent element it reads from. Summing child quantities through this map
    /// accounts for the plate multiplicity of messages sent to the parent.
    pub fn broadcast_map(&self, parent : &Plates) -> Result<Vec<usize>> {
        if !parent.broadcasts_into(self) {
            return Err(BayesError::config(format!("Parent plates {} do not broadcast into plates {}", parent, self)));
        }
        let offset = self.ndim() - parent.ndim();
        let mut parent_strides = vec![0; parent.ndim()];
        let mut stride = 1;
        for (k, d) in parent.0.iter().enumerate().rev() {
            parent_strides[k] = if *d == 1 { 0 } else { stride };
            stride *= d;
        }
        let map = (0..self.size()).map(|i| {
            self.unravel(i).iter().skip(offset).zip(parent_strides.iter())
                .map(|(c, s)| c * s).sum()
        }).collect();
        Ok(map)
    }

    /// Multi-index of the flat (row-major) position i.
    pub fn unravel(&self, mut i : usize) -> Vec<usize> {
        let mut ix = vec![0; self.ndim()];
        for (k, d) in self.0.iter().enumerate().rev() {
            if *d > 0 {
                ix[k] = i % d;
                i /= d;
            }
        }
        ix
    }

}

impl Display for Plates {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims : Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "({})", dims.join(", "))
    }

}

/// A dense row-major array tagged with its shape; used to pass
/// plate-shaped observations and masks into the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateArray<T> {
    shape : Vec<usize>,
    values : Vec<T>
}

impl<T> PlateArray<T> {

    pub fn new(shape : &[usize], values : Vec<T>) -> Result<Self> {
        let n : usize = shape.iter().product();
        if n != values.len() {
            return Err(BayesError::shape("array values", &[n], &[values.len()]));
        }
        Ok(Self { shape : shape.to_vec(), values })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn into_values(self) -> Vec<T> {
        self.values
    }

}

impl<T : Clone> PlateArray<T> {

    pub fn filled(shape : &[usize], value : T) -> Self {
        let n : usize = shape.iter().product();
        Self { shape : shape.to_vec(), values : vec![value; n] }
    }

}

impl<T : Scalar> From<&DMatrix<T>> for PlateArray<T> {

    /// Row-major copy of the matrix, with shape (nrows, ncols).
    fn from(m : &DMatrix<T>) -> Self {
        let values = m.transpose().as_slice().to_vec();
        Self { shape : vec![m.nrows(), m.ncols()], values }
    }

}

impl<T : Scalar> From<DMatrix<T>> for PlateArray<T> {

    fn from(m : DMatrix<T>) -> Self {
        (&m).into()
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn broadcast_aligns_from_the_right() {
        let a = Plates::new(&[10, 1]);
        let b = Plates::new(&[1, 100]);
        assert_eq!(a.broadcast(&b).unwrap(), Plates::new(&[10, 100]));
        let c = Plates::new(&[100]);
        assert_eq!(a.broadcast(&c).unwrap(), Plates::new(&[10, 100]));
        assert_eq!(Plates::scalar().broadcast(&a).unwrap(), a);
        assert!(Plates::new(&[3, 2]).broadcast(&Plates::new(&[3])).is_err());
    }

    #[test]
    fn broadcast_map_sums_over_replicated_axes() {
        let child = Plates::new(&[2, 3]);
        let rows = child.broadcast_map(&Plates::new(&[2, 1])).unwrap();
        assert_eq!(rows, vec![0, 0, 0, 1, 1, 1]);
        let cols = child.broadcast_map(&Plates::new(&[1, 3])).unwrap();
        assert_eq!(cols, vec![0, 1, 2, 0, 1, 2]);
        let trailing = child.broadcast_map(&Plates::new(&[3])).unwrap();
        assert_eq!(trailing, vec![0, 1, 2, 0, 1, 2]);
        let scalar = child.broadcast_map(&Plates::scalar()).unwrap();
        assert_eq!(scalar, vec![0; 6]);
        assert!(child.broadcast_map(&Plates::new(&[4, 1])).is_err());
        assert!(Plates::new(&[3]).broadcast_map(&child).is_err());
    }

    #[test]
    fn plate_array_from_matrix_is_row_major() {
        let m = DMatrix::from_row_slice(2, 3, &[1., 2., 3., 4., 5., 6.]);
        let a : PlateArray<f64> = (&m).into();
        assert_eq!(a.shape(), &[2, 3]);
        assert_eq!(a.values(), &[1., 2., 3., 4., 5., 6.]);
        assert!(PlateArray::new(&[2, 2], vec![1.0; 3]).is_err());
    }

}
