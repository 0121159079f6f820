use nalgebra::*;
use argmin::core::{CostFunction, Gradient, Executor, State};
use argmin::solver::quasinewton::LBFGS;
use argmin::solver::linesearch::MoreThuenteLineSearch;
use serde::{Serialize, Deserialize};
use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};
use super::*;
use crate::distr::{Message, Precision};
use crate::inference::Vb;
use crate::error::{BayesError, Result};

/// Budget of the inner solve. max_iters bounds the L-BFGS iterations; time_budget,
/// when set, bounds the wall-clock time of a single proposal (the best transform found
/// so far is returned when it runs out). A proposal is accepted only if it improves the
/// bound over the identity by more than tolerance * max(1, |bound|).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub max_iters : u64,
    pub time_budget : Option<Duration>,
    pub memory : usize,
    pub tolerance : f64
}

impl Default for RotationConfig {

    fn default() -> Self {
        Self { max_iters : 100, time_budget : None, memory : 7, tolerance : 1e-10 }
    }

}

impl RotationConfig {

    pub fn from_json_file(path : &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let cfg : RotationConfig = serde_json::from_str(&content)?;
        if cfg.memory == 0 || !(cfg.tolerance >= 0.) {
            return Err(BayesError::config("Invalid rotation configuration"));
        }
        Ok(cfg)
    }

}

/// Transform proposed by RotationOptimizer::propose. Applying it maps the variables of
/// the first block by R and those of the second block by R^{-T}.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationProposal {
    r : DMatrix<f64>,
    gain : f64,
    iterations : Option<u64>
}

impl RotationProposal {

    pub fn identity(dim : usize) -> Self {
        Self { r : DMatrix::identity(dim, dim), gain : 0., iterations : Some(0) }
    }

    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }

    /// Predicted improvement of the lower bound.
    pub fn gain(&self) -> f64 {
        self.gain
    }

    /// L-BFGS iterations run, or None when the solver was stopped by the time
    /// budget or a line search failure.
    pub fn iterations(&self) -> Option<u64> {
        self.iterations
    }

    pub fn is_identity(&self) -> bool {
        self.r == DMatrix::identity(self.r.nrows(), self.r.ncols())
    }

}

/// Result of applying a proposal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RotationOutcome {

    /// The identity was proposed; nothing changed.
    Unchanged,

    /// The transform was installed, and the bound increased by `gain`.
    Applied { gain : f64 },

    /// The transform was singular or gave a covariance that is not positive-definite;
    /// nothing changed.
    Rejected,

    /// The recomputed bound decreased, so the previous parameters were restored.
    RolledBack

}

/// Gaussian node under a linear map x -> A x of every plate element, with the prior
/// (and any ARD parent) held fixed. With Λ_g the prior precision read by a group of
/// plate elements, S_g and m_g the sums of their second moments and means:
/// F(A) = Σ_g [-½ tr(Λ_g A S_g A^T) + μ0^T Λ_g A m_g] + N log|det A|.
#[derive(Debug, Clone)]
pub struct RotateGaussian {
    node : NodeId
}

impl RotateGaussian {

    pub fn new(node : NodeId) -> Self {
        Self { node }
    }

}

struct GaussianBound {
    // (Λ_g, S_g, Λ_g μ0 m_g^T) per group.
    groups : Vec<(DMatrix<f64>, DMatrix<f64>, DMatrix<f64>)>,
    n : f64
}

impl RotationBound for GaussianBound {

    fn value_and_gradient(&self, a : &DMatrix<f64>) -> (f64, DMatrix<f64>) {
        let (log_det, inv_t) = match log_abs_det_inv_t(a) {
            Some(v) => v,
            None => return (f64::NEG_INFINITY, DMatrix::zeros(a.nrows(), a.ncols()))
        };
        let mut value = self.n * log_det;
        let mut grad = inv_t * self.n;
        for (lambda, s, lin) in self.groups.iter() {
            let las = lambda * a * s;
            value += -0.5 * las.dot(a) + lin.dot(a);
            grad += lin - las;
        }
        (value, grad)
    }

}

impl RotationTransform for RotateGaussian {

    fn dim(&self, graph : &FactorGraph) -> Result<usize> {
        Ok(graph.gaussian(self.node)?.dim())
    }

    fn nodes(&self, _graph : &FactorGraph) -> Result<Vec<NodeId>> {
        Ok(vec![self.node])
    }

    fn bound(&self, graph : &FactorGraph) -> Result<Box<dyn RotationBound>> {
        let g = graph.gaussian(self.node)?;
        let ard = graph.ard_moments(self.node)?;
        let m = g.moments();
        let d = g.dim();
        let n_groups = match g.precision() {
            Precision::Fixed(_) => 1,
            Precision::Ard(_) => g.ard_map().iter().max().map(|k| k + 1).unwrap_or(1)
        };
        let group = |j : usize| if ard.is_some() { g.ard_map()[j] } else { 0 };
        let mut lambdas = vec![None; n_groups];
        let mut sums = vec![(DMatrix::<f64>::zeros(d, d), DVector::<f64>::zeros(d)); n_groups];
        for j in 0..g.len() {
            let k = group(j);
            if lambdas[k].is_none() {
                lambdas[k] = Some(g.prior_precision(j, ard)?.0);
            }
            sums[k].0 += &m.second[j];
            sums[k].1 += &m.mean[j];
        }
        let groups = lambdas.into_iter().zip(sums.into_iter())
            .filter_map(|(l, (s, msum))| {
                let l = l?;
                let lin = &l * g.prior_mean() * msum.transpose();
                Some((l, s, lin))
            })
            .collect();
        Ok(Box::new(GaussianBound { groups, n : g.len() as f64 }))
    }

    fn transform(&self, graph : &FactorGraph, a : &DMatrix<f64>) -> Result<Vec<(NodeId, NodeParams)>> {
        let name = graph.node(self.node)?.name();
        let state = graph.gaussian(self.node)?.transformed(a, name)?;
        Ok(vec![(self.node, state.params())])
    }

}

/// Gaussian node under x -> A x whose ARD precision parent alpha (plates (D,), with
/// this node as its only child) is re-optimized analytically for every A. At the
/// optimum q(alpha_d) = Gamma(a, b_d(A)), the bound of both nodes reduces to
/// F(A) = Σ_d -a log b_d(A) + N log|det A|, with a = a0 + N/2 and
/// b_d(A) = b0 + ½[(A S A^T)_dd - 2 μ0_d (A m)_d + N μ0_d^2].
#[derive(Debug, Clone)]
pub struct RotateGaussianArd {
    node : NodeId
}

impl RotateGaussianArd {

    pub fn new(node : NodeId) -> Self {
        Self { node }
    }

    fn alpha(&self, graph : &FactorGraph) -> Result<NodeId> {
        let g = graph.gaussian(self.node)?;
        let node = graph.node(self.node)?;
        let alpha = match g.precision() {
            Precision::Ard(alpha) => *alpha,
            Precision::Fixed(_) => return Err(BayesError::config(format!("Node {} has no ARD prior", node.name())))
        };
        let an = graph.node(alpha)?;
        if an.plates().dims() != [g.dim()] || an.children() != [self.node] {
            return Err(BayesError::config(format!(
                "ARD parent {} of {} must have plates ({},) and no other children",
                an.name(), node.name(), g.dim()
            )));
        }
        Ok(alpha)
    }

}

struct ArdBound {
    a : f64,
    b0 : f64,
    s : DMatrix<f64>,
    msum : DVector<f64>,
    mu0 : DVector<f64>,
    n : f64
}

impl RotationBound for ArdBound {

    fn value_and_gradient(&self, a : &DMatrix<f64>) -> (f64, DMatrix<f64>) {
        let singular = (f64::NEG_INFINITY, DMatrix::zeros(a.nrows(), a.ncols()));
        let (log_det, inv_t) = match log_abs_det_inv_t(a) {
            Some(v) => v,
            None => return singular
        };
        let a_s = a * &self.s;
        let am = a * &self.msum;
        let mut value = self.n * log_det;
        let mut grad = inv_t * self.n;
        let centered = &a_s - &self.mu0 * self.msum.transpose();
        for d in 0..a.nrows() {
            let quad = a_s.row(d).dot(&a.row(d));
            let mu = self.mu0[d];
            let b = self.b0 + 0.5 * (quad - 2. * mu * am[d] + self.n * mu * mu);
            if !(b > 0.) {
                return singular;
            }
            value -= self.a * b.ln();
            let mut row = grad.row_mut(d);
            row -= centered.row(d) * (self.a / b);
        }
        (value, grad)
    }

}

impl RotationTransform for RotateGaussianArd {

    fn dim(&self, graph : &FactorGraph) -> Result<usize> {
        Ok(graph.gaussian(self.node)?.dim())
    }

    fn nodes(&self, graph : &FactorGraph) -> Result<Vec<NodeId>> {
        Ok(vec![self.node, self.alpha(graph)?])
    }

    fn bound(&self, graph : &FactorGraph) -> Result<Box<dyn RotationBound>> {
        let alpha = self.alpha(graph)?;
        let g = graph.gaussian(self.node)?;
        let (a0, b0) = graph.gamma(alpha)?.prior();
        let m = g.moments();
        let d = g.dim();
        let s = m.second.iter().fold(DMatrix::zeros(d, d), |acc, s| acc + s);
        let msum = m.mean.iter().fold(DVector::zeros(d), |acc, v| acc + v);
        let n = g.len() as f64;
        Ok(Box::new(ArdBound { a : a0 + 0.5 * n, b0, s, msum, mu0 : g.prior_mean().clone(), n }))
    }

    fn transform(&self, graph : &FactorGraph, a : &DMatrix<f64>) -> Result<Vec<(NodeId, NodeParams)>> {
        let alpha = self.alpha(graph)?;
        let name = graph.node(self.node)?.name();
        let g = graph.gaussian(self.node)?;
        let state = g.transformed(a, name)?;
        let params = state.params();
        let mut rotated = g.clone();
        rotated.commit(state);
        let gamma = graph.gamma(alpha)?;
        let mut msg = Message::gamma(gamma.len());
        rotated.message_to_ard(&mut msg)?;
        let alpha_state = gamma.posterior(&msg, graph.node(alpha)?.name())?;
        Ok(vec![(self.node, params), (alpha, alpha_state.params())])
    }

}

/// Best evaluation seen by the inner solver (maximization).
#[derive(Debug, Clone)]
struct Best {
    r : Vec<f64>,
    value : f64,
    evaluations : u64
}

/// F(R) = F1(R) + F2(R^{-T}), exposed to argmin as the minimization of -F over
/// the column-major entries of R.
struct RotationProblem {
    block1 : Box<dyn RotationBound>,
    block2 : Box<dyn RotationBound>,
    dim : usize,
    deadline : Option<Instant>,
    best : Rc<RefCell<Best>>
}

impl RotationProblem {

    fn evaluate(&self, r : &DMatrix<f64>) -> (f64, DMatrix<f64>) {
        let (v1, g1) = self.block1.value_and_gradient(r);
        let q = match r.clone().try_inverse() {
            Some(inv) => inv.transpose(),
            None => return (f64::NEG_INFINITY, DMatrix::zeros(self.dim, self.dim))
        };
        let (v2, g2) = self.block2.value_and_gradient(&q);
        // d/dR F2(R^{-T}) = -R^{-T} G2^T R^{-T}
        let grad = g1 - &q * g2.transpose() * &q;
        (v1 + v2, grad)
    }

    fn check_deadline(&self) -> std::result::Result<(), argmin::core::Error> {
        match self.deadline {
            Some(d) if Instant::now() >= d => Err(anyhow::anyhow!("Rotation time budget exhausted")),
            _ => Ok(())
        }
    }

}

impl CostFunction for RotationProblem {

    type Param = Vec<f64>;

    type Output = f64;

    fn cost(&self, p : &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.check_deadline()?;
        let r = DMatrix::from_column_slice(self.dim, self.dim, p);
        let (value, _) = self.evaluate(&r);
        let mut best = self.best.borrow_mut();
        best.evaluations += 1;
        if value.is_finite() && value > best.value {
            best.value = value;
            best.r = p.clone();
        }
        Ok(-value)
    }

}

impl Gradient for RotationProblem {

    type Param = Vec<f64>;

    type Gradient = Vec<f64>;

    fn gradient(&self, p : &Self::Param) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        self.check_deadline()?;
        let r = DMatrix::from_column_slice(self.dim, self.dim, p);
        let (_, grad) = self.evaluate(&r);
        Ok(grad.iter().map(|g| if g.is_finite() { -g } else { 0. }).collect())
    }

}

/// Maximizes the lower bound over an invertible D x D matrix R shared by two blocks:
/// the variables of block1 are mapped by R, those of block2 by R^{-T}. When both blocks
/// enter the likelihood only through the inner products of their variables, the
/// likelihood term is invariant under this pair of maps, so only the local terms
/// computed by the RotationBound implementations change. R is not constrained to be
/// orthogonal.
///
/// The optimization is split in a read-only propose(.) step and an apply(.) step which
/// mutates the engine; rotate(.) composes both. A call never decreases the lower bound:
/// non-improving proposals are replaced by the identity, and an applied transform is
/// rolled back if the recomputed bound decreased.
pub struct RotationOptimizer {
    block1 : Box<dyn RotationTransform>,
    block2 : Box<dyn RotationTransform>,
    dim : usize,
    config : RotationConfig
}

impl RotationOptimizer {

    pub fn new<A, B>(block1 : A, block2 : B, dim : usize) -> Self
    where
        A : RotationTransform + 'static,
        B : RotationTransform + 'static
    {
        Self { block1 : Box::new(block1), block2 : Box::new(block2), dim, config : RotationConfig::default() }
    }

    pub fn with_config(mut self, config : RotationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    fn check(&self, graph : &FactorGraph) -> Result<()> {
        let (d1, d2) = (self.block1.dim(graph)?, self.block2.dim(graph)?);
        if d1 != self.dim || d2 != self.dim {
            return Err(BayesError::shape("rotation blocks", &[self.dim, self.dim], &[d1, d2]));
        }
        let n1 = self.block1.nodes(graph)?;
        if self.block2.nodes(graph)?.iter().any(|n| n1.contains(n)) {
            return Err(BayesError::config("Rotation blocks must transform disjoint nodes"));
        }
        Ok(())
    }

    /// Searches for the transform maximizing the bound, without changing the engine.
    pub fn propose(&self, vb : &Vb) -> Result<RotationProposal> {
        let graph = vb.graph();
        self.check(graph)?;
        let start = Instant::now();
        let identity = RotationProposal::identity(self.dim);
        if self.config.max_iters == 0 || self.config.time_budget == Some(Duration::ZERO) {
            return Ok(identity);
        }
        let x0 : Vec<f64> = identity.r.as_slice().to_vec();
        let best = Rc::new(RefCell::new(Best { r : x0.clone(), value : f64::NEG_INFINITY, evaluations : 0 }));
        let problem = RotationProblem {
            block1 : self.block1.bound(graph)?,
            block2 : self.block2.bound(graph)?,
            dim : self.dim,
            deadline : self.config.time_budget.map(|b| start + b),
            best : best.clone()
        };
        let (f0, _) = problem.evaluate(&identity.r);
        if !f0.is_finite() {
            log::warn!("Rotation bound is not finite at the identity; skipping rotation");
            return Ok(identity);
        }
        best.borrow_mut().value = f0;

        let linesearch : MoreThuenteLineSearch<Vec<f64>, Vec<f64>, f64> = MoreThuenteLineSearch::new();
        let solver : LBFGS<_, Vec<f64>, Vec<f64>, f64> = LBFGS::new(linesearch, self.config.memory);
        let max_iters = self.config.max_iters;
        let iterations = match Executor::new(problem, solver).configure(|state| state.param(x0).max_iters(max_iters)).run() {
            Ok(res) => Some(res.state().get_iter()),
            Err(e) => {
                log::debug!("Rotation solver stopped: {}", e);
                None
            }
        };

        let best = best.borrow().clone();
        let gain = best.value - f0;
        let iters = iterations.map(|i| i.to_string()).unwrap_or_else(|| String::from("an unknown number of"));
        log::debug!(
            "Rotation proposal after {} iterations ({} bound evaluations): gain={:e} ({:.3} seconds)",
            iters, best.evaluations, gain, start.elapsed().as_secs_f64()
        );
        if gain > self.config.tolerance * f0.abs().max(1.) {
            Ok(RotationProposal { r : DMatrix::from_vec(self.dim, self.dim, best.r), gain, iterations })
        } else {
            Ok(identity)
        }
    }

    /// Installs a proposal: block1 is mapped by R and block2 by R^{-T}. Numerical
    /// degeneracy is recovered by leaving the engine unchanged.
    pub fn apply(&self, vb : &mut Vb, proposal : &RotationProposal) -> Result<RotationOutcome> {
        if proposal.is_identity() {
            return Ok(RotationOutcome::Unchanged);
        }
        let graph = vb.graph();
        if proposal.r.shape() != (self.dim, self.dim) {
            return Err(BayesError::shape("rotation", &[self.dim, self.dim], &[proposal.r.nrows(), proposal.r.ncols()]));
        }
        let q = match proposal.r.clone().try_inverse() {
            Some(inv) => inv.transpose(),
            None => {
                log::warn!("Proposed rotation is singular; using the identity");
                return Ok(RotationOutcome::Rejected);
            }
        };
        let params = self.block1.transform(graph, &proposal.r)
            .and_then(|mut p1| {
                p1.extend(self.block2.transform(graph, &q)?);
                Ok(p1)
            });
        let params = match params {
            Ok(p) => p,
            Err(BayesError::Degenerate { node, msg }) => {
                log::warn!("Rotation rejected at node {}: {}; using the identity", node, msg);
                return Ok(RotationOutcome::Rejected);
            },
            Err(e) => return Err(e)
        };
        let before = vb.lower_bound()?;
        let snapshot = vb.snapshot();
        match vb.set_parameters(params) {
            Ok(()) => { },
            Err(BayesError::Degenerate { node, msg }) => {
                log::warn!("Rotation rejected at node {}: {}; using the identity", node, msg);
                return Ok(RotationOutcome::Rejected);
            },
            Err(e) => return Err(e)
        }
        let after = vb.lower_bound()?;
        if !(after >= before) {
            log::warn!("Rotation decreased the lower bound ({} -> {}); restoring previous state", before, after);
            vb.restore(&snapshot)?;
            return Ok(RotationOutcome::RolledBack);
        }
        log::debug!("Rotation increased the lower bound by {:e}", after - before);
        Ok(RotationOutcome::Applied { gain : after - before })
    }

    pub fn rotate(&self, vb : &mut Vb) -> Result<RotationOutcome> {
        let proposal = self.propose(vb)?;
        self.apply(vb, &proposal)
    }

}
