use nalgebra::*;
use super::*;
use rand::Rng;
use rand_distr::StandardNormal;
use std::f64::consts::PI;
use crate::plates::{Plates, PlateArray};

/// Scalar normal likelihood y ~ N(f, 1/τ), where f is the scalar moment provider
/// (a Dot node or a one-dimensional Gaussian) and τ a Gamma precision. Observed
/// elements contribute to the bound and send messages to both parents; unobserved
/// elements are integrated out: they send nothing and contribute nothing, and their
/// hidden value is represented by the predictive N(<f>, 1/<τ>), held in natural form
/// (τ<f>, -½τ) and refreshed whenever the node is updated.
#[derive(Debug, Clone)]
pub struct Normal {

    mean_map : Vec<usize>,

    prec_map : Vec<usize>,

    data : Vec<f64>,

    mask : Vec<bool>,

    phi1 : Vec<f64>,

    phi2 : Vec<f64>

}

impl Normal {

    pub fn new(mean_map : Vec<usize>, prec_map : Vec<usize>) -> Result<Self> {
        if mean_map.len() != prec_map.len() {
            return Err(BayesError::shape("Normal parent maps", &[mean_map.len()], &[prec_map.len()]));
        }
        let n = mean_map.len();
        Ok(Self {
            mean_map,
            prec_map,
            data : vec![0.; n],
            mask : vec![false; n],
            phi1 : vec![0.; n],
            phi2 : vec![-0.5; n]
        })
    }

    pub fn len(&self) -> usize {
        self.mean_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean_map.is_empty()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    pub fn n_observed(&self) -> usize {
        self.mask.iter().filter(|m| **m).count()
    }

    /// Sets the observations. Both arrays must be shaped exactly as the node plates
    /// (the variable itself is scalar). Values at unobserved positions are ignored
    /// (they may be NaN); observed values must be finite.
    pub fn observe(&mut self, plates : &Plates, data : &PlateArray<f64>, mask : &PlateArray<bool>) -> Result<()> {
        if data.shape() != plates.dims() {
            return Err(BayesError::shape("observed data", plates.dims(), data.shape()));
        }
        if mask.shape() != plates.dims() {
            return Err(BayesError::shape("observed mask", plates.dims(), mask.shape()));
        }
        let bad = data.values().iter().zip(mask.values().iter())
            .position(|(y, m)| *m && !y.is_finite());
        if let Some(i) = bad {
            return Err(BayesError::config(format!("Observed value at element {} is not finite", i)));
        }
        self.data = data.values().iter().zip(mask.values().iter())
            .map(|(y, m)| if *m { *y } else { 0. })
            .collect();
        self.mask = mask.values().to_vec();
        Ok(())
    }

    /// Hidden predictive posterior (τ<f>, -½τ) under the current parent moments.
    pub fn predictive(&self, f : &ScalarMoments, tau : &GammaMoments) -> (Vec<f64>, Vec<f64>) {
        self.mean_map.iter().zip(self.prec_map.iter())
            .map(|(pf, pt)| {
                let t = tau.mean[*pt];
                (t * f.mean[*pf], -0.5 * t)
            })
            .unzip()
    }

    pub fn commit(&mut self, phi1 : Vec<f64>, phi2 : Vec<f64>) {
        self.phi1 = phi1;
        self.phi2 = phi2;
    }

    /// Validates natural parameters restored from a checkpoint.
    pub fn check_params(&self, phi1 : &[f64], phi2 : &[f64], name : &str) -> Result<()> {
        if phi1.len() != self.len() || phi2.len() != self.len() {
            return Err(BayesError::shape(name, &[self.len()], &[phi1.len().min(phi2.len())]));
        }
        if phi2.iter().any(|q| !(*q < 0.)) || phi1.iter().any(|l| !l.is_finite()) {
            return Err(BayesError::Degenerate { node : name.to_string(), msg : String::from("Invalid hidden precision") });
        }
        Ok(())
    }

    pub fn params(&self) -> NodeParams {
        NodeParams::Normal { phi1 : self.phi1.clone(), phi2 : self.phi2.clone() }
    }

    /// Posterior mean of every element: the observation where observed, the
    /// predictive mean otherwise.
    pub fn hidden_mean(&self) -> Vec<f64> {
        (0..self.len())
            .map(|i| if self.mask[i] { self.data[i] } else { self.phi1[i] / (-2. * self.phi2[i]) })
            .collect()
    }

    pub fn hidden_precision(&self) -> Vec<f64> {
        self.phi2.iter().map(|q| -2. * q).collect()
    }

    /// Observations where available; draws from the hidden predictive otherwise.
    pub fn random<R : Rng + ?Sized>(&self, rng : &mut R) -> DMatrix<f64> {
        let mean = self.hidden_mean();
        DMatrix::from_fn(self.len(), 1, |i, _| {
            if self.mask[i] {
                self.data[i]
            } else {
                let z : f64 = rng.sample(StandardNormal);
                mean[i] + z / (-2. * self.phi2[i]).sqrt()
            }
        })
    }

    /// Summed message (τy, -½τ) on (f, f^2) for every observed element.
    pub fn message_to_mean(&self, tau : &GammaMoments, msg : &mut Message) -> Result<()> {
        for i in (0..self.len()).filter(|i| self.mask[*i]) {
            let t = tau.mean[self.prec_map[i]];
            msg.add_scalar(self.mean_map[i], t * self.data[i], -0.5 * t)?;
        }
        Ok(())
    }

    /// Summed message (½, ½<(y - f)^2>) on (log τ, τ) for every observed element.
    pub fn message_to_precision(&self, f : &ScalarMoments, msg : &mut Message) -> Result<()> {
        for i in (0..self.len()).filter(|i| self.mask[*i]) {
            msg.add_gamma(self.prec_map[i], 0.5, 0.5 * self.squared_error(i, f))?;
        }
        Ok(())
    }

    fn squared_error(&self, i : usize, f : &ScalarMoments) -> f64 {
        let y = self.data[i];
        let pf = self.mean_map[i];
        y * y - 2. * y * f.mean[pf] + f.second[pf]
    }

    /// Expected log-likelihood of the observed elements.
    pub fn lower_bound(&self, f : &ScalarMoments, tau : &GammaMoments) -> f64 {
        let log_2pi = (2. * PI).ln();
        (0..self.len()).filter(|i| self.mask[*i]).map(|i| {
            let pt = self.prec_map[i];
            0.5 * tau.log_mean[pt] - 0.5 * log_2pi - 0.5 * tau.mean[pt] * self.squared_error(i, f)
        }).sum()
    }

}
