use nalgebra::*;
use crate::graph::{FactorGraph, NodeId};
use crate::distr::NodeParams;
use crate::error::Result;

/// Rotation of bilinear latent factors, optimized by a quasi-Newton inner solve.
pub mod rotation;

pub use rotation::*;

/// The part of the lower bound that changes when a linear map A is applied to the
/// variables of one or more nodes, as a function of A, with its analytic gradient.
/// Constant terms may be dropped, so only differences between evaluations are
/// meaningful. Implementors capture the moments they need when built, and do not
/// read the graph afterwards.
pub trait RotationBound {

    /// Returns (value, gradient w.r.t. the entries of A). A singular A has value -inf.
    fn value_and_gradient(&self, a : &DMatrix<f64>) -> (f64, DMatrix<f64>);

}

/// Adapter exposing a node (and possibly its dependent hyperparameters) to the rotation
/// optimizer: it knows how the bound of its nodes depends on a transform, and how to
/// transform their parameters.
pub trait RotationTransform {

    /// Dimension of the transformed variable.
    fn dim(&self, graph : &FactorGraph) -> Result<usize>;

    /// Nodes whose parameters change under transform(.).
    fn nodes(&self, graph : &FactorGraph) -> Result<Vec<NodeId>>;

    fn bound(&self, graph : &FactorGraph) -> Result<Box<dyn RotationBound>>;

    /// New parameters of every node in nodes(.) after applying `a`.
    fn transform(&self, graph : &FactorGraph, a : &DMatrix<f64>) -> Result<Vec<(NodeId, NodeParams)>>;

}

/// Returns log|det A| and A^{-T}, or None if A is singular.
pub(crate) fn log_abs_det_inv_t(a : &DMatrix<f64>) -> Option<(f64, DMatrix<f64>)> {
    let lu = a.clone().lu();
    let det = lu.determinant();
    if det == 0. || !det.is_finite() {
        return None;
    }
    let inv = lu.try_inverse()?;
    Some((det.abs().ln(), inv.transpose()))
}
