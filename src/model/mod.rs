use nalgebra::*;
use crate::distr::Precision;
use crate::graph::{FactorGraph, NodeId};
use crate::error::Result;

/// Node handles of the probabilistic PCA model built by pca_model(.).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcaModel {
    pub y : NodeId,
    pub wx : NodeId,
    pub w : NodeId,
    pub x : NodeId,
    pub tau : NodeId,
    pub alpha : NodeId
}

/// Probabilistic PCA with automatic relevance determination over the latent
/// dimensions, for an M x N data matrix and D latent components:
///
/// ```text
/// alpha ~ Gamma(1e-2, 1e-2)           plates (D,)
/// W     ~ N(0, diag(alpha)^{-1})      plates (M, 1)
/// X     ~ N(0, I)                     plates (1, N)
/// tau   ~ Gamma(1e-2, 1e-2)
/// Y     ~ N(W^T X, 1/tau)             plates (M, N)
/// ```
///
/// Since Y depends on W and X only through their inner products, the model is
/// invariant under X -> RX, W -> R^{-T}W, which makes it the canonical use case of
/// the rotation optimizer.
pub fn pca_model(m : usize, n : usize, d : usize) -> Result<(FactorGraph, PcaModel)> {
    let mut graph = FactorGraph::new();
    let alpha = graph.add_gamma("alpha", &[d], 1e-2, 1e-2)?;
    let w = graph.add_gaussian("W", &[m, 1], DVector::zeros(d), Precision::Ard(alpha))?;
    let x = graph.add_gaussian("X", &[1, n], DVector::zeros(d), Precision::Fixed(DMatrix::identity(d, d)))?;
    let wx = graph.add_dot("WX", w, x)?;
    let tau = graph.add_gamma("tau", &[], 1e-2, 1e-2)?;
    let y = graph.add_normal("Y", wx, tau)?;
    Ok((graph, PcaModel { y, wx, w, x, tau, alpha }))
}
