use nalgebra::*;
use super::*;
use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use std::f64::consts::PI;
use crate::graph::NodeId;

/// Prior precision of a Gaussian node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Precision {

    /// A constant positive-definite DxD matrix shared by all plate elements.
    Fixed(DMatrix<f64>),

    /// Automatic relevance determination: the diagonal precision diag(alpha), where
    /// alpha is a Gamma node whose trailing plate axis has length D. The leading
    /// plates of alpha broadcast into the plates of the Gaussian node.
    Ard(NodeId)

}

/// Expected sufficient statistics <x> and <xx^T> per plate element, together with
/// the posterior covariance and its log-determinant (needed for the entropy term
/// and for the rotation bound).
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMoments {
    pub mean : Vec<DVector<f64>>,
    pub second : Vec<DMatrix<f64>>,
    pub cov : Vec<DMatrix<f64>>,
    pub log_det_cov : Vec<f64>
}

/// Candidate natural parameters of a Gaussian node with the moments they imply.
/// A state can only be built from parameters defining valid (positive-definite)
/// posteriors, so committing one never leaves the node in an invalid state.
#[derive(Debug, Clone)]
pub struct GaussianState {
    phi1 : Vec<DVector<f64>>,
    phi2 : Vec<DMatrix<f64>>,
    moments : GaussianMoments
}

impl GaussianState {

    pub fn moments(&self) -> &GaussianMoments {
        &self.moments
    }

    pub fn params(&self) -> NodeParams {
        NodeParams::Gaussian { phi1 : self.phi1.clone(), phi2 : self.phi2.clone() }
    }

}

/// Multivariate normal posterior q(x) = N(μ, Σ) over a D-dimensional variable, replicated
/// over plates. Parameters are held in natural form φ1 = Σ^{-1} μ, φ2 = -½ Σ^{-1}, so
/// the coordinate-ascent update is the prior natural parameter plus the summed
/// child messages.
#[derive(Debug, Clone)]
pub struct Gaussian {

    dim : usize,

    mu0 : DVector<f64>,

    precision : Precision,

    /// log|Λ0| for a fixed prior precision (unused under ARD).
    fixed_log_det : f64,

    /// Flat index of the ARD parent's leading plates read by each plate element.
    ard_map : Vec<usize>,

    phi1 : Vec<DVector<f64>>,

    phi2 : Vec<DMatrix<f64>>,

    moments : GaussianMoments

}

pub(crate) fn symmetrize(m : DMatrix<f64>) -> DMatrix<f64> {
    (&m + m.transpose()) * 0.5
}

fn element_moments(
    phi1 : &DVector<f64>,
    phi2 : &DMatrix<f64>
) -> Option<(DVector<f64>, DMatrix<f64>, DMatrix<f64>, f64)> {
    let lambda = symmetrize(phi2 * (-2.));
    let chol = Cholesky::new(lambda)?;
    let log_det_cov = -2. * chol.l_dirty().diagonal().iter().map(|l| l.ln()).sum::<f64>();
    if !log_det_cov.is_finite() {
        return None;
    }
    let cov = chol.inverse();
    let mean = chol.solve(phi1);
    let second = &cov + &mean * mean.transpose();
    Some((mean, second, cov, log_det_cov))
}

impl Gaussian {

    pub fn new(
        dim : usize,
        mu0 : DVector<f64>,
        precision : Precision,
        ard_map : Vec<usize>,
        n : usize
    ) -> Result<Self> {
        if mu0.nrows() != dim {
            return Err(BayesError::shape("Gaussian prior mean", &[dim], &[mu0.nrows()]));
        }
        let fixed_log_det = match &precision {
            Precision::Fixed(l) => {
                if l.shape() != (dim, dim) {
                    return Err(BayesError::shape("Gaussian prior precision", &[dim, dim], &[l.nrows(), l.ncols()]));
                }
                let chol = Cholesky::new(l.clone())
                    .ok_or_else(|| BayesError::config("Gaussian prior precision is not positive-definite"))?;
                2. * chol.l_dirty().diagonal().iter().map(|l| l.ln()).sum::<f64>()
            },
            Precision::Ard(_) => 0.
        };
        let eye = DMatrix::<f64>::identity(dim, dim);
        let moments = GaussianMoments {
            mean : vec![DVector::zeros(dim); n],
            second : vec![eye.clone(); n],
            cov : vec![eye.clone(); n],
            log_det_cov : vec![0.; n]
        };
        Ok(Self {
            dim,
            mu0,
            precision,
            fixed_log_det,
            ard_map,
            phi1 : vec![DVector::zeros(dim); n],
            phi2 : vec![eye * (-0.5); n],
            moments
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.phi1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phi1.is_empty()
    }

    pub fn prior_mean(&self) -> &DVector<f64> {
        &self.mu0
    }

    pub fn precision(&self) -> &Precision {
        &self.precision
    }

    pub fn ard_map(&self) -> &[usize] {
        &self.ard_map
    }

    pub fn moments(&self) -> &GaussianMoments {
        &self.moments
    }

    pub fn params(&self) -> NodeParams {
        NodeParams::Gaussian { phi1 : self.phi1.clone(), phi2 : self.phi2.clone() }
    }

    pub fn commit(&mut self, state : GaussianState) {
        self.phi1 = state.phi1;
        self.phi2 = state.phi2;
        self.moments = state.moments;
    }

    /// Prior precision Λ0 read by plate element j, and E[log|Λ0|].
    pub fn prior_precision(&self, j : usize, ard : Option<&GammaMoments>) -> Result<(DMatrix<f64>, f64)> {
        match (&self.precision, ard) {
            (Precision::Fixed(l), _) => Ok((l.clone(), self.fixed_log_det)),
            (Precision::Ard(_), Some(a)) => {
                let base = self.ard_map[j] * self.dim;
                let diag = DVector::from_fn(self.dim, |d, _| a.mean[base + d]);
                let log_det = (0..self.dim).map(|d| a.log_mean[base + d]).sum();
                Ok((DMatrix::from_diagonal(&diag), log_det))
            },
            (Precision::Ard(_), None) => Err(BayesError::config("ARD precision requested without the moments of its Gamma parent"))
        }
    }

    /// Builds a state from natural parameters, computing the moments of every plate
    /// element independently (in parallel).
    pub fn state(&self, phi1 : Vec<DVector<f64>>, phi2 : Vec<DMatrix<f64>>, name : &str) -> Result<GaussianState> {
        if phi1.len() != self.len() || phi2.len() != self.len() {
            return Err(BayesError::shape(name, &[self.len()], &[phi1.len().min(phi2.len())]));
        }
        if phi1.iter().any(|l| l.nrows() != self.dim) || phi2.iter().any(|q| q.shape() != (self.dim, self.dim)) {
            return Err(BayesError::shape(name, &[self.dim], &[]));
        }
        let elems : Vec<_> = phi1.par_iter()
            .zip(phi2.par_iter())
            .map(|(l, q)| element_moments(l, q))
            .collect();
        let n = elems.len();
        let mut moments = GaussianMoments {
            mean : Vec::with_capacity(n),
            second : Vec::with_capacity(n),
            cov : Vec::with_capacity(n),
            log_det_cov : Vec::with_capacity(n)
        };
        for (j, e) in elems.into_iter().enumerate() {
            let (mean, second, cov, log_det) = e.ok_or_else(|| BayesError::Degenerate {
                node : name.to_string(),
                msg : format!("Precision at plate element {} is not positive-definite", j)
            })?;
            moments.mean.push(mean);
            moments.second.push(second);
            moments.cov.push(cov);
            moments.log_det_cov.push(log_det);
        }
        Ok(GaussianState { phi1, phi2, moments })
    }

    /// Posterior equal to the prior (under the current moments of an ARD parent).
    pub fn prior_state(&self, ard : Option<&GammaMoments>, name : &str) -> Result<GaussianState> {
        let mut phi1 = Vec::with_capacity(self.len());
        let mut phi2 = Vec::with_capacity(self.len());
        for j in 0..self.len() {
            let (l0, _) = self.prior_precision(j, ard)?;
            phi1.push(&l0 * &self.mu0);
            phi2.push(l0 * (-0.5));
        }
        self.state(phi1, phi2, name)
    }

    /// Conjugate update: prior natural parameters plus the summed child messages.
    pub fn posterior(&self, ard : Option<&GammaMoments>, msg : &Message, name : &str) -> Result<GaussianState> {
        let (lin, quad) = match msg {
            Message::Gaussian { lin, quad } if lin.len() == self.len() => (lin, quad),
            _ => return Err(BayesError::config(format!("Gaussian node {} received an incompatible message", name)))
        };
        let phis : Vec<(DVector<f64>, DMatrix<f64>)> = (0..self.len()).into_par_iter()
            .map(|j| -> Result<(DVector<f64>, DMatrix<f64>)> {
                let (l0, _) = self.prior_precision(j, ard)?;
                let phi1 = &l0 * &self.mu0 + &lin[j];
                let phi2 = l0 * (-0.5) + &quad[j];
                Ok((phi1, phi2))
            })
            .collect::<Result<Vec<_>>>()?;
        let (phi1, phi2) : (Vec<_>, Vec<_>) = phis.into_iter().unzip();
        self.state(phi1, phi2, name)
    }

    /// Moves the posterior means to the rows of `values` (one row per plate element),
    /// keeping the current posterior precisions.
    pub fn state_from_value(&self, values : &DMatrix<f64>, name : &str) -> Result<GaussianState> {
        if values.shape() != (self.len(), self.dim) {
            return Err(BayesError::shape(name, &[self.len(), self.dim], &[values.nrows(), values.ncols()]));
        }
        let phi1 = self.phi2.iter().enumerate()
            .map(|(j, q)| q * values.row(j).transpose() * (-2.))
            .collect();
        self.state(phi1, self.phi2.clone(), name)
    }

    /// Draws one value per plate element (rows of the output) from q(x).
    pub fn random<R : Rng + ?Sized>(&self, rng : &mut R) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.len(), self.dim);
        for j in 0..self.len() {
            let mean = &self.moments.mean[j];
            let z = DVector::from_fn(self.dim, |_, _| rng.sample::<f64, _>(StandardNormal));
            let x = match Cholesky::new(self.moments.cov[j].clone()) {
                Some(chol) => mean + chol.l() * z,
                None => mean.clone()
            };
            out.row_mut(j).copy_from(&x.transpose());
        }
        out
    }

    /// E[log p(x | parents)] + H[q(x)], summed over plate elements.
    pub fn lower_bound(&self, ard : Option<&GammaMoments>) -> Result<f64> {
        let d = self.dim as f64;
        let log_2pi = (2. * PI).ln();
        let mut bound = 0.;
        for j in 0..self.len() {
            let (l0, log_det) = self.prior_precision(j, ard)?;
            let m = &self.moments.mean[j];
            let cross = m * self.mu0.transpose();
            let centered = &self.moments.second[j] - &cross - cross.transpose() + &self.mu0 * self.mu0.transpose();
            let log_p = 0.5 * log_det - 0.5 * d * log_2pi - 0.5 * l0.dot(&centered);
            let entropy = 0.5 * self.moments.log_det_cov[j] + 0.5 * d * (1. + log_2pi);
            bound += log_p + entropy;
        }
        Ok(bound)
    }

    /// Shape/rate contributions sent to the ARD parent: ½ and ½<(x_d - μ0_d)^2>
    /// for every plate element and axis d.
    pub fn message_to_ard(&self, msg : &mut Message) -> Result<()> {
        for j in 0..self.len() {
            let base = self.ard_map[j] * self.dim;
            let m = &self.moments.mean[j];
            let s = &self.moments.second[j];
            for d in 0..self.dim {
                let mu = self.mu0[d];
                let sq = s[(d, d)] - 2. * mu * m[d] + mu * mu;
                msg.add_gamma(base + d, 0.5, 0.5 * sq)?;
            }
        }
        Ok(())
    }

    /// Natural parameters after the linear map x -> R x applied to every plate
    /// element: μ' = R μ, Σ' = R Σ R^T. Fails if any Σ' is not positive-definite.
    pub fn transformed(&self, r : &DMatrix<f64>, name : &str) -> Result<GaussianState> {
        if r.shape() != (self.dim, self.dim) {
            return Err(BayesError::shape("rotation", &[self.dim, self.dim], &[r.nrows(), r.ncols()]));
        }
        let phis : Vec<Option<(DVector<f64>, DMatrix<f64>)>> = (0..self.len()).into_par_iter()
            .map(|j| {
                let mean = r * &self.moments.mean[j];
                let cov = symmetrize(r * &self.moments.cov[j] * r.transpose());
                let chol = Cholesky::new(cov)?;
                let lambda = symmetrize(chol.inverse());
                Some((&lambda * mean, lambda * (-0.5)))
            })
            .collect();
        let mut phi1 = Vec::with_capacity(phis.len());
        let mut phi2 = Vec::with_capacity(phis.len());
        for (j, p) in phis.into_iter().enumerate() {
            let (l, q) = p.ok_or_else(|| BayesError::Degenerate {
                node : name.to_string(),
                msg : format!("Transformed covariance at plate element {} is not positive-definite", j)
            })?;
            phi1.push(l);
            phi2.push(q);
        }
        self.state(phi1, phi2, name)
    }

}

#[cfg(test)]
mod tests {

    use super::*;
    use approx::assert_relative_eq;

    fn fixed(dim : usize, n : usize) -> Gaussian {
        let l0 = DMatrix::from_diagonal(&DVector::from_element(dim, 2.0));
        Gaussian::new(dim, DVector::from_element(dim, 1.0), Precision::Fixed(l0), Vec::new(), n).unwrap()
    }

    #[test]
    fn prior_state_recovers_prior_moments() {
        let mut g = fixed(2, 3);
        let s = g.prior_state(None, "x").unwrap();
        g.commit(s);
        assert_relative_eq!(g.moments().mean[1], DVector::from_element(2, 1.0), epsilon = 1e-12);
        assert_relative_eq!(g.moments().cov[0][(0, 0)], 0.5, epsilon = 1e-12);
        assert_relative_eq!(g.moments().second[2][(1, 1)], 1.5, epsilon = 1e-12);
        // KL(q || p) = 0 at the prior.
        assert_relative_eq!(g.lower_bound(None).unwrap(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn posterior_adds_gaussian_messages() {
        let mut g = fixed(1, 1);
        let mut msg = Message::gaussian(1, 1);
        msg.add_scalar(0, 3.0, -1.0).unwrap();
        let s = g.posterior(None, &msg, "x").unwrap();
        g.commit(s);
        // Precision 2 + 2 = 4; linear term 2 * 1 + 3 = 5.
        assert_relative_eq!(g.moments().mean[0][0], 1.25, epsilon = 1e-12);
        assert_relative_eq!(g.moments().cov[0][(0, 0)], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn value_initialization_keeps_precision() {
        let mut g = fixed(2, 2);
        let s = g.prior_state(None, "x").unwrap();
        g.commit(s);
        let v = DMatrix::from_row_slice(2, 2, &[0.3, -1.0, 2.0, 0.0]);
        let s = g.state_from_value(&v, "x").unwrap();
        g.commit(s);
        assert_relative_eq!(g.moments().mean[1][0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(g.moments().mean[0][1], -1.0, epsilon = 1e-12);
        assert_relative_eq!(g.moments().cov[1][(1, 1)], 0.5, epsilon = 1e-12);
        assert!(g.state_from_value(&DMatrix::zeros(3, 2), "x").is_err());
    }

    #[test]
    fn transform_moves_mean_and_covariance() {
        let mut g = fixed(2, 1);
        let s = g.prior_state(None, "x").unwrap();
        g.commit(s);
        let r = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let s = g.transformed(&r, "x").unwrap();
        let m = s.moments();
        assert_relative_eq!(m.mean[0], DVector::from_column_slice(&[3.0, 3.0]), epsilon = 1e-10);
        let expected = &r * DMatrix::from_diagonal_element(2, 2, 0.5) * r.transpose();
        assert_relative_eq!(m.cov[0], expected, epsilon = 1e-10);
        assert_relative_eq!(m.log_det_cov[0], expected.determinant().ln(), epsilon = 1e-10);
        let singular = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert!(g.transformed(&singular, "x").is_err());
    }

    #[test]
    fn rejects_invalid_priors() {
        let l0 = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        assert!(Gaussian::new(2, DVector::zeros(2), Precision::Fixed(l0), Vec::new(), 1).is_err());
        assert!(Gaussian::new(2, DVector::zeros(3), Precision::Fixed(DMatrix::identity(2, 2)), Vec::new(), 1).is_err());
    }

}
