use super::*;

/// Which of the two parents of a Dot node a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DotParent {
    A,
    B
}

/// Deterministic inner product f = a^T b between two D-dimensional Gaussian parents,
/// replicated over the broadcast of both parent plates (so a (M,1) parent combined
/// with a (1,N) parent yields an (M,N) node, an outer product over plates).
/// Since a and b are independent under q, the moments are exact:
/// <f> = <a>^T <b> and <f^2> = tr(<aa^T><bb^T>). The node holds no variational
/// parameters; scalar messages it receives from its children are forwarded to
/// its parents as Gaussian messages.
#[derive(Debug, Clone)]
pub struct Dot {

    /// Flat index of the parent A element read by each element of this node.
    map_a : Vec<usize>,

    map_b : Vec<usize>

}

impl Dot {

    pub fn new(map_a : Vec<usize>, map_b : Vec<usize>) -> Result<Self> {
        if map_a.len() != map_b.len() {
            return Err(BayesError::shape("Dot parent maps", &[map_a.len()], &[map_b.len()]));
        }
        Ok(Self { map_a, map_b })
    }

    pub fn len(&self) -> usize {
        self.map_a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map_a.is_empty()
    }

    pub fn moments(&self, a : &GaussianMoments, b : &GaussianMoments) -> ScalarMoments {
        let (mean, second) : (Vec<f64>, Vec<f64>) = self.map_a.iter().zip(self.map_b.iter())
            .map(|(ia, ib)| {
                let m = a.mean[*ia].dot(&b.mean[*ib]);
                // Frobenius product of two symmetric matrices = tr(AB).
                let s = a.second[*ia].dot(&b.second[*ib]);
                (m, s)
            })
            .unzip();
        ScalarMoments { mean, second }
    }

    /// Converts the scalar message (l, q) received at each element of this node (the
    /// coefficients of <f> and <f^2>) into the message (l<b>, q<bb^T>) to parent A (or
    /// the symmetric one to parent B), summed into `out` through the plate map.
    pub fn message_to_parent(
        &self,
        which : DotParent,
        received : &Message,
        other : &GaussianMoments,
        out : &mut Message
    ) -> Result<()> {
        let (lin, quad) = received.as_scalar()?;
        let (own_map, other_map) = match which {
            DotParent::A => (&self.map_a, &self.map_b),
            DotParent::B => (&self.map_b, &self.map_a)
        };
        let (out_lin, out_quad) = match out {
            Message::Gaussian { lin, quad } => (lin, quad),
            _ => return Err(BayesError::config("Dot node parents must be Gaussian"))
        };
        for i in 0..self.len() {
            if lin[i] == 0. && quad[i] == 0. {
                continue;
            }
            let (p, o) = (own_map[i], other_map[i]);
            out_lin[p] += &other.mean[o] * lin[i];
            out_quad[p] += &other.second[o] * quad[i];
        }
        Ok(())
    }

}
