use nalgebra::*;
use super::*;
use rand::Rng;
use special::Gamma as _;

/// Expected sufficient statistics of a Gamma variable, per plate element:
/// <τ> = a / b and <log τ> = ψ(a) - log b.
#[derive(Debug, Clone, PartialEq)]
pub struct GammaMoments {
    pub mean : Vec<f64>,
    pub log_mean : Vec<f64>
}

/// Candidate parameter set of a Gamma node with the moments it implies; built
/// by the immutable methods of Gamma and installed with Gamma::commit.
#[derive(Debug, Clone)]
pub struct GammaState {
    phi_rate : Vec<f64>,
    phi_shape : Vec<f64>,
    moments : GammaMoments
}

impl GammaState {

    pub fn moments(&self) -> &GammaMoments {
        &self.moments
    }

    pub fn params(&self) -> NodeParams {
        NodeParams::Gamma { phi_rate : self.phi_rate.clone(), phi_shape : self.phi_shape.clone() }
    }

}

/// Gamma is a distribution for scale parameters. The fixed prior Gamma(a0, b0)
/// (shape, rate) is shared by all plate elements. The posterior q(τ) = Gamma(a, b) is held in
/// natural form against the sufficient statistic (τ, log τ), so the conjugate
/// update is a sum: -b = -b0 - Σ rate messages; a - 1 = a0 - 1 + Σ shape messages.
#[derive(Debug, Clone)]
pub struct Gamma {

    a0 : f64,

    b0 : f64,

    /// Natural parameter -b, one per plate element.
    phi_rate : Vec<f64>,

    /// Natural parameter a - 1, one per plate element.
    phi_shape : Vec<f64>,

    moments : GammaMoments

}

impl Gamma {

    pub fn new(a0 : f64, b0 : f64, n : usize) -> Result<Self> {
        if !(a0 > 0. && b0 > 0. && a0.is_finite() && b0.is_finite()) {
            return Err(BayesError::config(format!("Invalid Gamma prior ({}, {})", a0, b0)));
        }
        let phi_rate = vec![-b0; n];
        let phi_shape = vec![a0 - 1.; n];
        let moments = Self::moments_from(&phi_rate, &phi_shape)
            .ok_or_else(|| BayesError::config("Invalid Gamma prior"))?;
        Ok(Self { a0, b0, phi_rate, phi_shape, moments })
    }

    pub fn prior(&self) -> (f64, f64) {
        (self.a0, self.b0)
    }

    pub fn len(&self) -> usize {
        self.phi_rate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phi_rate.is_empty()
    }

    /// Posterior (shape, rate) at plate element k.
    pub fn shape_rate(&self, k : usize) -> (f64, f64) {
        (self.phi_shape[k] + 1., -self.phi_rate[k])
    }

    pub fn moments(&self) -> &GammaMoments {
        &self.moments
    }

    fn moments_from(phi_rate : &[f64], phi_shape : &[f64]) -> Option<GammaMoments> {
        let mut mean = Vec::with_capacity(phi_rate.len());
        let mut log_mean = Vec::with_capacity(phi_rate.len());
        for (r, s) in phi_rate.iter().zip(phi_shape.iter()) {
            let (a, b) = (s + 1., -r);
            if !(a > 0. && b > 0. && a.is_finite() && b.is_finite()) {
                return None;
            }
            mean.push(a / b);
            log_mean.push(a.digamma() - b.ln());
        }
        Some(GammaMoments { mean, log_mean })
    }

    pub fn state(&self, phi_rate : Vec<f64>, phi_shape : Vec<f64>, name : &str) -> Result<GammaState> {
        if phi_rate.len() != self.len() || phi_shape.len() != self.len() {
            return Err(BayesError::shape(name, &[self.len()], &[phi_rate.len().min(phi_shape.len())]));
        }
        let moments = Self::moments_from(&phi_rate, &phi_shape)
            .ok_or_else(|| BayesError::Degenerate {
                node : name.to_string(),
                msg : String::from("Non-positive Gamma shape or rate")
            })?;
        Ok(GammaState { phi_rate, phi_shape, moments })
    }

    pub fn commit(&mut self, state : GammaState) {
        self.phi_rate = state.phi_rate;
        self.phi_shape = state.phi_shape;
        self.moments = state.moments;
    }

    /// Posterior carrying no information beyond the prior.
    pub fn prior_state(&self, name : &str) -> Result<GammaState> {
        self.state(vec![-self.b0; self.len()], vec![self.a0 - 1.; self.len()], name)
    }

    /// Conjugate coordinate-ascent update from the summed child messages.
    pub fn posterior(&self, msg : &Message, name : &str) -> Result<GammaState> {
        let (shape, rate) = match msg {
            Message::Gamma { shape, rate } => (shape, rate),
            _ => return Err(BayesError::config("Gamma node received a non-Gamma message"))
        };
        let phi_rate = rate.iter().map(|r| -self.b0 - r).collect();
        let phi_shape = shape.iter().map(|s| self.a0 - 1. + s).collect();
        self.state(phi_rate, phi_shape, name)
    }

    /// Keeps the current shape and moves the rate so that <τ> equals the informed values.
    pub fn state_from_value(&self, values : &[f64], name : &str) -> Result<GammaState> {
        if values.len() != self.len() {
            return Err(BayesError::shape(name, &[self.len(), 1], &[values.len(), 1]));
        }
        if values.iter().any(|v| !(*v > 0. && v.is_finite())) {
            return Err(BayesError::config(format!("Gamma node {} requires positive initial values", name)));
        }
        let phi_rate = values.iter().zip(self.phi_shape.iter())
            .map(|(v, s)| -(s + 1.) / v)
            .collect();
        self.state(phi_rate, self.phi_shape.clone(), name)
    }

    pub fn params(&self) -> NodeParams {
        NodeParams::Gamma { phi_rate : self.phi_rate.clone(), phi_shape : self.phi_shape.clone() }
    }

    /// Draws one value per plate element from q(τ).
    pub fn random<R : Rng + ?Sized>(&self, rng : &mut R) -> DMatrix<f64> {
        let n = self.len();
        DMatrix::from_fn(n, 1, |k, _| {
            let (a, b) = self.shape_rate(k);
            match rand_distr::Gamma::new(a, 1. / b) {
                Ok(g) => rng.sample(g),
                Err(_) => a / b
            }
        })
    }

    /// E[log p(τ)] - E[log q(τ)], summed over plate elements.
    pub fn lower_bound(&self) -> f64 {
        let (a0, b0) = (self.a0, self.b0);
        let prior_norm = a0 * b0.ln() - special::Gamma::ln_gamma(a0).0;
        (0..self.len()).map(|k| {
            let (a, b) = self.shape_rate(k);
            let (m, lm) = (self.moments.mean[k], self.moments.log_mean[k]);
            let log_p = prior_norm + (a0 - 1.) * lm - b0 * m;
            let log_q = a * b.ln() - special::Gamma::ln_gamma(a).0 + (a - 1.) * lm - b * m;
            log_p - log_q
        }).sum()
    }

}

#[cfg(test)]
mod tests {

    use super::*;
    use special::Gamma as _;
    use approx::assert_relative_eq;

    #[test]
    fn prior_posterior_has_zero_bound() {
        let g = Gamma::new(2.0, 3.0, 4).unwrap();
        assert_relative_eq!(g.lower_bound(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(g.moments().mean[2], 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn posterior_adds_messages() {
        let g = Gamma::new(1.0, 1.0, 2).unwrap();
        let mut msg = Message::gamma(2);
        msg.add_gamma(1, 5.0, 2.0).unwrap();
        let s = g.posterior(&msg, "tau").unwrap();
        let mut g2 = g.clone();
        g2.commit(s);
        assert_eq!(g2.shape_rate(0), (1.0, 1.0));
        assert_eq!(g2.shape_rate(1), (6.0, 3.0));
        assert_relative_eq!(g2.moments().log_mean[1], 6f64.digamma() - 3f64.ln(), epsilon = 1e-12);
        // Any update away from the prior without data support loses bound.
        assert!(g2.lower_bound() < 0.0);
    }

    #[test]
    fn bound_is_negative_kl_divergence() {
        let g = Gamma::new(1.0, 1.0, 2).unwrap();
        let mut msg = Message::gamma(2);
        msg.add_gamma(1, 5.0, 2.0).unwrap();
        let mut g2 = g.clone();
        g2.commit(g.posterior(&msg, "tau").unwrap());
        // KL(Gamma(6, 3) || Gamma(1, 1)) with psi(6) = 137/60 - euler and ln(5!) = ln(120).
        let psi6 = 137. / 60. - 0.5772156649015329;
        let kl = 5. * psi6 - 120f64.ln() + 3f64.ln() + 6. * (1. - 3.) / 3.;
        assert_relative_eq!(g2.lower_bound(), -kl, epsilon = 1e-10);
    }

    #[test]
    fn value_initialization_sets_mean() {
        let g = Gamma::new(3.0, 1.0, 2).unwrap();
        let s = g.state_from_value(&[0.5, 4.0], "alpha").unwrap();
        let mut g2 = g.clone();
        g2.commit(s);
        assert_relative_eq!(g2.moments().mean[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(g2.moments().mean[1], 4.0, epsilon = 1e-12);
        assert!(g.state_from_value(&[-1.0, 1.0], "alpha").is_err());
        assert!(Gamma::new(0.0, 1.0, 1).is_err());
    }

}
