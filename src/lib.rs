//! Mean-field variational Bayesian inference over factor graphs of conjugate
//! exponential-family nodes with plates, with a rotation optimizer that speeds up
//! convergence of bilinear latent factor models.
//!
//! ```no_run
//! use bayes_vmp::prelude::*;
//! use nalgebra::DMatrix;
//! use rand::SeedableRng;
//!
//! let (graph, pca) = pca_model(10, 100, 9)?;
//! let mut vb = Vb::new(graph, VbConfig::default())?;
//! let y = DMatrix::<f64>::zeros(10, 100);
//! vb.observe(pca.y, &(&y).into(), &PlateArray::filled(&[10, 100], true))?;
//! let mut rng = rand::rngs::StdRng::seed_from_u64(0);
//! vb.initialize_from_random(pca.x, &mut rng)?;
//! vb.initialize_from_random(pca.w, &mut rng)?;
//! let rot = RotationOptimizer::new(RotateGaussian::new(pca.x), RotateGaussianArd::new(pca.w), 9);
//! for _ in 0..10 {
//!     vb.update(3)?;
//!     rot.rotate(&mut vb)?;
//! }
//! println!("{:?}", vb.lower_bounds().last());
//! # Ok::<(), bayes_vmp::error::BayesError>(())
//! ```

/// Error type shared by all modules.
pub mod error;

/// Replication shapes (plates) and plate-shaped arrays.
pub mod plates;

/// Exponential-family node distributions (Gaussian, Gamma, Dot, Normal), their
/// moments, messages and lower bound terms.
pub mod distr;

/// Arena of nodes connected as a directed acyclic graph, where messages are
/// routed from children to parents.
pub mod graph;

/// The variational engine: update sweeps, lower bound trajectory and checkpoints.
pub mod inference;

/// Rotation transforms and their optimizer.
pub mod optim;

/// Ready-made models.
pub mod model;

pub mod prelude {
    pub use crate::error::{BayesError, Result};
    pub use crate::plates::{Plates, PlateArray};
    pub use crate::distr::{Family, Precision, NodeParams};
    pub use crate::graph::{FactorGraph, NodeId};
    pub use crate::inference::{Vb, VbConfig, VbState};
    pub use crate::optim::{RotationOptimizer, RotationConfig, RotateGaussian, RotateGaussianArd, RotationOutcome};
    pub use crate::model::{pca_model, PcaModel};
}
