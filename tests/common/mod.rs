#![allow(dead_code)]

use nalgebra::*;
use rand::Rng;
use rand_distr::{Normal, StandardNormal};
use bayes_vmp::prelude::*;

/// Synthetic PCA data: y = W X^T + noise (sd 0.5) with true latent dimension d_y,
/// observed at random with probability p_obs, and with an optional block of
/// missing columns.
pub struct PcaData {
    pub y : DMatrix<f64>,
    pub mask : DMatrix<bool>
}

impl PcaData {

    pub fn simulate<R : Rng>(rng : &mut R, m : usize, n : usize, d_y : usize, p_obs : f64, gap : Option<(usize, usize)>) -> Self {
        let w = DMatrix::<f64>::from_fn(m, d_y, |_, _| rng.sample(StandardNormal));
        let x = DMatrix::<f64>::from_fn(n, d_y, |_, _| rng.sample(StandardNormal));
        let noise = Normal::new(0., 0.5).unwrap();
        let mut y = &w * x.transpose();
        y.iter_mut().for_each(|v| *v += rng.sample(noise));
        let mut mask = DMatrix::from_fn(m, n, |_, _| rng.gen::<f64>() < p_obs);
        if let Some((from, to)) = gap {
            for j in from..to.min(n) {
                mask.column_mut(j).fill(false);
            }
        }
        y.zip_apply(&mask, |v, obs| if !obs { *v = f64::NAN });
        Self { y, mask }
    }

    pub fn data(&self) -> PlateArray<f64> {
        (&self.y).into()
    }

    pub fn observed(&self) -> PlateArray<bool> {
        (&self.mask).into()
    }

}

/// PCA model with observed data and randomly initialized factors.
pub fn pca_engine<R : Rng>(rng : &mut R, data : &PcaData, d : usize, config : VbConfig) -> (Vb, PcaModel) {
    let (graph, pca) = pca_model(data.y.nrows(), data.y.ncols(), d).unwrap();
    let mut vb = Vb::new(graph, config).unwrap();
    vb.observe(pca.y, &data.data(), &data.observed()).unwrap();
    for id in [pca.alpha, pca.tau, pca.x, pca.w] {
        vb.initialize_from_prior(id).unwrap();
    }
    vb.initialize_from_random(pca.x, rng).unwrap();
    vb.initialize_from_random(pca.w, rng).unwrap();
    (vb, pca)
}
