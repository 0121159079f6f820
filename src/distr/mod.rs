use nalgebra::*;
use serde::{Serialize, Deserialize};
use std::fmt::{self, Display};
use crate::error::{BayesError, Result};

/// Multivariate Gaussian variable with a constant or ARD prior precision.
pub mod gaussian;

pub use gaussian::*;

/// Gamma-distributed scale (precision) variable.
pub mod gamma;

pub use gamma::*;

/// Deterministic inner product of two Gaussian variables.
pub mod dot;

pub use dot::*;

/// Scalar observation-bearing likelihood.
pub mod normal;

pub use normal::*;

/// Tag identifying the exponential-family distribution of a node. The family set
/// is closed: every graph operation (message computation, moment computation, lower
/// bound term and parameter transformation) dispatches over these four variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {

    /// Multivariate normal over a vector variable, parametrized by (Λμ, -½Λ).
    Gaussian,

    /// Gamma over a positive scalar, parametrized by (-b, a - 1).
    Gamma,

    /// Deterministic bilinear node (no variational parameters of its own).
    Dot,

    /// Scalar normal likelihood, holding observations and a mask.
    Normal

}

impl Display for Family {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Family::Gaussian => "Gaussian",
            Family::Gamma => "Gamma",
            Family::Dot => "Dot",
            Family::Normal => "Normal"
        };
        write!(f, "{}", name)
    }

}

/// Expected sufficient statistics of a scalar Gaussian quantity: <f> and <f^2>,
/// one entry per plate element of the node that provides them.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarMoments {
    pub mean : Vec<f64>,
    pub second : Vec<f64>
}

/// Expected natural-parameter messages sent from children to a parent node, already
/// summed into the parent plate elements. Messages to a Gaussian are linear and
/// quadratic coefficients of (x, xx^T); messages to a Gamma are contributions to
/// the shape and rate; scalar messages are received by deterministic Dot nodes,
/// which forward them to their own parents.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {

    Gaussian { lin : Vec<DVector<f64>>, quad : Vec<DMatrix<f64>> },

    Gamma { shape : Vec<f64>, rate : Vec<f64> },

    Scalar { lin : Vec<f64>, quad : Vec<f64> }

}

impl Message {

    pub fn gaussian(n : usize, dim : usize) -> Self {
        Message::Gaussian {
            lin : vec![DVector::zeros(dim); n],
            quad : vec![DMatrix::zeros(dim, dim); n]
        }
    }

    pub fn gamma(n : usize) -> Self {
        Message::Gamma { shape : vec![0.; n], rate : vec![0.; n] }
    }

    pub fn scalar(n : usize) -> Self {
        Message::Scalar { lin : vec![0.; n], quad : vec![0.; n] }
    }

    /// Adds a message on a scalar Gaussian quantity at parent element p. Valid for
    /// scalar receivers and for one-dimensional Gaussian receivers.
    pub fn add_scalar(&mut self, p : usize, l : f64, q : f64) -> Result<()> {
        match self {
            Message::Scalar { lin, quad } => {
                lin[p] += l;
                quad[p] += q;
                Ok(())
            },
            Message::Gaussian { lin, quad } if lin[p].nrows() == 1 => {
                lin[p][0] += l;
                quad[p][(0, 0)] += q;
                Ok(())
            },
            _ => Err(BayesError::config("Scalar message sent to a node that is not scalar-valued"))
        }
    }

    pub fn add_gamma(&mut self, p : usize, s : f64, r : f64) -> Result<()> {
        match self {
            Message::Gamma { shape, rate } => {
                shape[p] += s;
                rate[p] += r;
                Ok(())
            },
            _ => Err(BayesError::config("Shape/rate message sent to a node that is not Gamma"))
        }
    }

    pub fn as_scalar(&self) -> Result<(&[f64], &[f64])> {
        match self {
            Message::Scalar { lin, quad } => Ok((&lin[..], &quad[..])),
            _ => Err(BayesError::config("Expected a scalar message"))
        }
    }

}

/// Full variational parameter set of a single node, in natural form. This is the
/// unit which is checkpointed, restored and produced by rotation transforms.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeParams {

    Gaussian { phi1 : Vec<DVector<f64>>, phi2 : Vec<DMatrix<f64>> },

    Gamma { phi_rate : Vec<f64>, phi_shape : Vec<f64> },

    Normal { phi1 : Vec<f64>, phi2 : Vec<f64> },

    Deterministic

}

impl NodeParams {

    pub fn family(&self) -> Option<Family> {
        match self {
            NodeParams::Gaussian { .. } => Some(Family::Gaussian),
            NodeParams::Gamma { .. } => Some(Family::Gamma),
            NodeParams::Normal { .. } => Some(Family::Normal),
            NodeParams::Deterministic => None
        }
    }

    /// Concatenates all natural parameters (plate-major; matrices column-major).
    pub fn flatten(&self) -> Vec<f64> {
        match self {
            NodeParams::Gaussian { phi1, phi2 } => {
                let mut v = Vec::new();
                for (l, q) in phi1.iter().zip(phi2.iter()) {
                    v.extend_from_slice(l.as_slice());
                    v.extend_from_slice(q.as_slice());
                }
                v
            },
            NodeParams::Gamma { phi_rate, phi_shape } |
            NodeParams::Normal { phi1 : phi_rate, phi2 : phi_shape } => {
                phi_rate.iter().zip(phi_shape.iter()).flat_map(|(a, b)| [*a, *b]).collect()
            },
            NodeParams::Deterministic => Vec::new()
        }
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn scalar_messages_reach_one_dimensional_gaussians() {
        let mut m = Message::gaussian(2, 1);
        m.add_scalar(1, 2.0, -0.5).unwrap();
        m.add_scalar(1, 1.0, -0.5).unwrap();
        match m {
            Message::Gaussian { lin, quad } => {
                assert_eq!(lin[1][0], 3.0);
                assert_eq!(quad[1][(0, 0)], -1.0);
                assert_eq!(lin[0][0], 0.0);
            },
            _ => unreachable!()
        }
        let mut wide = Message::gaussian(1, 3);
        assert!(wide.add_scalar(0, 1.0, 1.0).is_err());
        assert!(Message::scalar(1).add_gamma(0, 1.0, 1.0).is_err());
    }

    #[test]
    fn flatten_interleaves_plate_elements() {
        let p = NodeParams::Gamma { phi_rate : vec![-1., -2.], phi_shape : vec![0.5, 1.5] };
        assert_eq!(p.flatten(), vec![-1., 0.5, -2., 1.5]);
        assert_eq!(NodeParams::Deterministic.flatten().len(), 0);
    }

}
