use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::algo::toposort;
use nalgebra::*;
use rand::Rng;
use serde::{Serialize, Deserialize};
use std::fmt::{self, Display};
use crate::distr::*;
use crate::plates::{Plates, PlateArray};
use crate::error::{BayesError, Result};

/// Stable identity of a node inside a FactorGraph (its position in the arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub(crate) usize);

impl NodeId {

    pub fn index(&self) -> usize {
        self.0
    }

}

impl Display for NodeId {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }

}

/// Family-specific content of a node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Gaussian(Gaussian),
    Gamma(Gamma),
    Dot(Dot),
    Normal(Normal)
}

/// A vertex of the factor graph. Parent links are ordered: a Dot node has
/// parents [a, b]; a Normal node [mean, precision]; a Gaussian node under ARD
/// has its Gamma parent as the single entry. Children are back-references
/// used only to route messages.
#[derive(Debug, Clone)]
pub struct Node {
    name : String,
    plates : Plates,
    parents : Vec<NodeId>,
    children : Vec<NodeId>,
    kind : NodeKind
}

impl Node {

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plates(&self) -> &Plates {
        &self.plates
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn family(&self) -> Family {
        match self.kind {
            NodeKind::Gaussian(_) => Family::Gaussian,
            NodeKind::Gamma(_) => Family::Gamma,
            NodeKind::Dot(_) => Family::Dot,
            NodeKind::Normal(_) => Family::Normal
        }
    }

    /// Dimension of the variable (excluding plates).
    pub fn dim(&self) -> usize {
        match &self.kind {
            NodeKind::Gaussian(g) => g.dim(),
            _ => 1
        }
    }

    pub fn params(&self) -> NodeParams {
        match &self.kind {
            NodeKind::Gaussian(g) => g.params(),
            NodeKind::Gamma(g) => g.params(),
            NodeKind::Dot(_) => NodeParams::Deterministic,
            NodeKind::Normal(y) => y.params()
        }
    }

}

/// Validated parameters of a single node, ready to be installed.
#[derive(Debug, Clone)]
pub(crate) enum NodeState {
    Gaussian(GaussianState),
    Gamma(GammaState),
    Normal(Vec<f64>, Vec<f64>),
    Deterministic
}

/// A factor graph of exponential-family nodes, held as an arena addressed by NodeId.
/// Nodes are added in dependency order (parents must exist before their children),
/// and are never removed. Every constructor validates plate and dimension compatibility
/// against the parents it receives, so an invalid model cannot be built.
/// The graph owns all nodes; the petgraph DAG mirrors the parent-to-child relation
/// and is used only to derive the update order.
///
/// Each node exposes the same set of operations (update, initialize_from_prior,
/// initialize_from_value, random, lower_bound_contribution), dispatched over the
/// closed family set. Updates follow the compute-then-commit discipline: the
/// new parameters are derived from an immutable view of the graph, and installed
/// only after they are known to define a valid distribution.
#[derive(Debug, Clone, Default)]
pub struct FactorGraph {

    nodes : Vec<Node>,

    dag : DiGraph<NodeId, ()>,

    dag_ix : Vec<NodeIndex>

}

impl FactorGraph {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item=NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn find(&self, name : &str) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.name == name).map(NodeId)
    }

    pub fn node(&self, id : NodeId) -> Result<&Node> {
        self.nodes.get(id.0).ok_or_else(|| BayesError::config(format!("Unknown node {}", id)))
    }

    pub fn gaussian(&self, id : NodeId) -> Result<&Gaussian> {
        let node = self.node(id)?;
        match &node.kind {
            NodeKind::Gaussian(g) => Ok(g),
            _ => Err(BayesError::config(format!("Node {} is not Gaussian", node.name)))
        }
    }

    pub fn gamma(&self, id : NodeId) -> Result<&Gamma> {
        let node = self.node(id)?;
        match &node.kind {
            NodeKind::Gamma(g) => Ok(g),
            _ => Err(BayesError::config(format!("Node {} is not Gamma", node.name)))
        }
    }

    pub fn normal(&self, id : NodeId) -> Result<&Normal> {
        let node = self.node(id)?;
        match &node.kind {
            NodeKind::Normal(y) => Ok(y),
            _ => Err(BayesError::config(format!("Node {} is not a Normal likelihood", node.name)))
        }
    }

    pub fn gaussian_moments(&self, id : NodeId) -> Result<&GaussianMoments> {
        Ok(self.gaussian(id)?.moments())
    }

    pub fn gamma_moments(&self, id : NodeId) -> Result<&GammaMoments> {
        Ok(self.gamma(id)?.moments())
    }

    /// Moments <f>, <f^2> of a scalar-valued node (a Dot node or a one-dimensional Gaussian).
    pub fn scalar_moments(&self, id : NodeId) -> Result<ScalarMoments> {
        let node = self.node(id)?;
        match &node.kind {
            NodeKind::Dot(d) => {
                let a = self.gaussian_moments(node.parents[0])?;
                let b = self.gaussian_moments(node.parents[1])?;
                Ok(d.moments(a, b))
            },
            NodeKind::Gaussian(g) if g.dim() == 1 => {
                let m = g.moments();
                Ok(ScalarMoments {
                    mean : m.mean.iter().map(|v| v[0]).collect(),
                    second : m.second.iter().map(|s| s[(0, 0)]).collect()
                })
            },
            _ => Err(BayesError::config(format!("Node {} is not scalar-valued", node.name)))
        }
    }

    /// Moments of the ARD parent of a Gaussian node, if it has one.
    pub fn ard_moments(&self, id : NodeId) -> Result<Option<&GammaMoments>> {
        match self.gaussian(id)?.precision() {
            Precision::Ard(alpha) => Ok(Some(self.gamma_moments(*alpha)?)),
            Precision::Fixed(_) => Ok(None)
        }
    }

    fn check_name(&self, name : &str) -> Result<()> {
        if self.find(name).is_some() {
            return Err(BayesError::config(format!("Duplicate node name {}", name)));
        }
        Ok(())
    }

    fn push(&mut self, name : &str, plates : Plates, parents : Vec<NodeId>, kind : NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        let ix = self.dag.add_node(id);
        for p in parents.iter() {
            self.nodes[p.0].children.push(id);
            self.dag.add_edge(self.dag_ix[p.0], ix, ());
        }
        self.dag_ix.push(ix);
        self.nodes.push(Node { name : name.to_string(), plates, parents, children : Vec::new(), kind });
        id
    }

    /// Adds a Gamma(a0, b0) node with the given plates. The posterior starts at the prior.
    pub fn add_gamma(&mut self, name : &str, plates : &[usize], a0 : f64, b0 : f64) -> Result<NodeId> {
        self.check_name(name)?;
        let plates = Plates::new(plates);
        let g = Gamma::new(a0, b0, plates.size())?;
        Ok(self.push(name, plates, Vec::new(), NodeKind::Gamma(g)))
    }

    /// Adds a Gaussian node of dimension mu0.nrows(). Under ARD, the Gamma parent plates
    /// must be (leading.., D), with the leading axes broadcasting into `plates`. The
    /// posterior starts at the prior.
    pub fn add_gaussian(
        &mut self,
        name : &str,
        plates : &[usize],
        mu0 : DVector<f64>,
        precision : Precision
    ) -> Result<NodeId> {
        self.check_name(name)?;
        let plates = Plates::new(plates);
        let dim = mu0.nrows();
        let (parents, ard_map) = match &precision {
            Precision::Fixed(_) => (Vec::new(), Vec::new()),
            Precision::Ard(alpha) => {
                let alpha_node = self.node(*alpha)?;
                self.gamma(*alpha)?;
                let ap = alpha_node.plates();
                if ap.dims().last() != Some(&dim) {
                    return Err(BayesError::config(format!(
                        "ARD parent {} has plates {}, which should end with the dimension {} of {}",
                        alpha_node.name, ap, dim, name
                    )));
                }
                let leading = ap.leading(ap.ndim() - 1);
                (vec![*alpha], plates.broadcast_map(&leading)?)
            }
        };
        let mut g = Gaussian::new(dim, mu0, precision, ard_map, plates.size())?;
        let ard = match parents.first() {
            Some(alpha) => Some(self.gamma_moments(*alpha)?),
            None => None
        };
        let state = g.prior_state(ard, name)?;
        g.commit(state);
        Ok(self.push(name, plates, parents, NodeKind::Gaussian(g)))
    }

    /// Adds the deterministic inner product of two distinct Gaussian nodes of equal
    /// dimension. Its plates are the broadcast of both parent plates.
    pub fn add_dot(&mut self, name : &str, a : NodeId, b : NodeId) -> Result<NodeId> {
        self.check_name(name)?;
        if a == b {
            return Err(BayesError::config("Dot node parents must be distinct nodes"));
        }
        let (ga, gb) = (self.gaussian(a)?, self.gaussian(b)?);
        if ga.dim() != gb.dim() {
            return Err(BayesError::shape("Dot node parents", &[ga.dim()], &[gb.dim()]));
        }
        let (pa, pb) = (self.node(a)?.plates(), self.node(b)?.plates());
        let plates = pa.broadcast(pb)?;
        let dot = Dot::new(plates.broadcast_map(pa)?, plates.broadcast_map(pb)?)?;
        Ok(self.push(name, plates, vec![a, b], NodeKind::Dot(dot)))
    }

    /// Adds a scalar Normal likelihood with a scalar-valued mean (Dot or one-dimensional
    /// Gaussian) and a Gamma precision. Its plates are the broadcast of both parent plates.
    pub fn add_normal(&mut self, name : &str, mean : NodeId, precision : NodeId) -> Result<NodeId> {
        let plates = self.node(mean)?.plates().broadcast(self.node(precision)?.plates())?;
        self.add_normal_with_plates(name, mean, precision, plates.dims())
    }

    /// Adds a scalar Normal likelihood with explicit plates, into which the plates of
    /// both parents must broadcast (e.g. several observations sharing a scalar mean).
    pub fn add_normal_with_plates(
        &mut self,
        name : &str,
        mean : NodeId,
        precision : NodeId,
        plates : &[usize]
    ) -> Result<NodeId> {
        self.check_name(name)?;
        let f = self.scalar_moments(mean)?;
        let tau = self.gamma_moments(precision)?;
        let plates = Plates::new(plates);
        let mean_map = plates.broadcast_map(self.node(mean)?.plates())?;
        let prec_map = plates.broadcast_map(self.node(precision)?.plates())?;
        let mut y = Normal::new(mean_map, prec_map)?;
        let (phi1, phi2) = y.predictive(&f, tau);
        y.commit(phi1, phi2);
        Ok(self.push(name, plates, vec![mean, precision], NodeKind::Normal(y)))
    }

    /// Dependency-respecting update order (parents before children). Deterministic
    /// nodes are skipped, since their moments are always derived on demand.
    pub fn sweep_order(&self) -> Result<Vec<NodeId>> {
        let order = toposort(&self.dag, None)
            .map_err(|_| BayesError::config("Factor graph contains a cycle"))?;
        Ok(order.iter()
            .map(|ix| self.dag[*ix])
            .filter(|id| self.nodes[id.0].family() != Family::Dot)
            .collect())
    }

    /// Summed expected messages from all children of a node.
    pub fn message_to(&self, id : NodeId) -> Result<Message> {
        let node = self.node(id)?;
        let mut msg = match &node.kind {
            NodeKind::Gaussian(g) => Message::gaussian(g.len(), g.dim()),
            NodeKind::Gamma(g) => Message::gamma(g.len()),
            NodeKind::Dot(d) => Message::scalar(d.len()),
            NodeKind::Normal(_) => return Err(BayesError::config(format!("Node {} has no children", node.name)))
        };
        for child in node.children.iter() {
            self.accumulate_message(*child, id, &mut msg)?;
        }
        Ok(msg)
    }

    fn accumulate_message(&self, child : NodeId, parent : NodeId, msg : &mut Message) -> Result<()> {
        let c = self.node(child)?;
        match &c.kind {
            NodeKind::Gaussian(g) => g.message_to_ard(msg),
            NodeKind::Normal(y) => {
                let (mean, prec) = (c.parents[0], c.parents[1]);
                if parent == mean {
                    y.message_to_mean(self.gamma_moments(prec)?, msg)
                } else {
                    y.message_to_precision(&self.scalar_moments(mean)?, msg)
                }
            },
            NodeKind::Dot(d) => {
                let received = self.message_to(child)?;
                let (a, b) = (c.parents[0], c.parents[1]);
                if parent == a {
                    d.message_to_parent(DotParent::A, &received, self.gaussian_moments(b)?, msg)
                } else {
                    d.message_to_parent(DotParent::B, &received, self.gaussian_moments(a)?, msg)
                }
            },
            NodeKind::Gamma(_) => Err(BayesError::config(format!("Gamma node {} cannot be a child", c.name)))
        }
    }

    fn commit(&mut self, id : NodeId, state : NodeState) {
        match (&mut self.nodes[id.0].kind, state) {
            (NodeKind::Gaussian(g), NodeState::Gaussian(s)) => g.commit(s),
            (NodeKind::Gamma(g), NodeState::Gamma(s)) => g.commit(s),
            (NodeKind::Normal(y), NodeState::Normal(phi1, phi2)) => y.commit(phi1, phi2),
            _ => { }
        }
    }

    fn predictive_state(&self, id : NodeId, y : &Normal) -> Result<NodeState> {
        let node = self.node(id)?;
        let f = self.scalar_moments(node.parents[0])?;
        let tau = self.gamma_moments(node.parents[1])?;
        let (phi1, phi2) = y.predictive(&f, tau);
        Ok(NodeState::Normal(phi1, phi2))
    }

    /// Coordinate-ascent update of a single node: the prior natural parameters
    /// plus the summed expected messages from its children. For a Normal node, this
    /// refreshes the predictive distribution of the unobserved elements.
    pub fn update(&mut self, id : NodeId) -> Result<()> {
        let node = self.node(id)?;
        let state = match &node.kind {
            NodeKind::Gaussian(g) => {
                let msg = self.message_to(id)?;
                NodeState::Gaussian(g.posterior(self.ard_moments(id)?, &msg, &node.name)?)
            },
            NodeKind::Gamma(g) => {
                let msg = self.message_to(id)?;
                NodeState::Gamma(g.posterior(&msg, &node.name)?)
            },
            NodeKind::Normal(y) => self.predictive_state(id, y)?,
            NodeKind::Dot(_) => NodeState::Deterministic
        };
        self.commit(id, state);
        Ok(())
    }

    /// Resets a node so that its posterior carries no information beyond its prior.
    pub fn initialize_from_prior(&mut self, id : NodeId) -> Result<()> {
        let node = self.node(id)?;
        let state = match &node.kind {
            NodeKind::Gaussian(g) => NodeState::Gaussian(g.prior_state(self.ard_moments(id)?, &node.name)?),
            NodeKind::Gamma(g) => NodeState::Gamma(g.prior_state(&node.name)?),
            NodeKind::Normal(y) => self.predictive_state(id, y)?,
            NodeKind::Dot(_) => NodeState::Deterministic
        };
        self.commit(id, state);
        Ok(())
    }

    /// Moves the posterior mean to `values`: one row per plate element (row-major plate
    /// order) and one column per variable dimension.
    pub fn initialize_from_value(&mut self, id : NodeId, values : &DMatrix<f64>) -> Result<()> {
        let node = self.node(id)?;
        let state = match &node.kind {
            NodeKind::Gaussian(g) => NodeState::Gaussian(g.state_from_value(values, &node.name)?),
            NodeKind::Gamma(g) => {
                if values.ncols() != 1 {
                    return Err(BayesError::shape(&node.name, &[g.len(), 1], &[values.nrows(), values.ncols()]));
                }
                NodeState::Gamma(g.state_from_value(values.as_slice(), &node.name)?)
            },
            _ => return Err(BayesError::config(format!("Node {} cannot be initialized from a value", node.name)))
        };
        self.commit(id, state);
        Ok(())
    }

    /// Draws a value from the current posterior of the node and moves the posterior
    /// mean there. Used to break the symmetry between latent dimensions.
    pub fn initialize_from_random<R : Rng + ?Sized>(&mut self, id : NodeId, rng : &mut R) -> Result<()> {
        let v = self.random(id, rng)?;
        self.initialize_from_value(id, &v)
    }

    /// One draw per plate element (rows) from the current posterior of the node.
    pub fn random<R : Rng + ?Sized>(&self, id : NodeId, rng : &mut R) -> Result<DMatrix<f64>> {
        let node = self.node(id)?;
        match &node.kind {
            NodeKind::Gaussian(g) => Ok(g.random(rng)),
            NodeKind::Gamma(g) => Ok(g.random(rng)),
            NodeKind::Normal(y) => Ok(y.random(rng)),
            NodeKind::Dot(_) => Err(BayesError::config(format!("Deterministic node {} cannot be sampled", node.name)))
        }
    }

    pub fn observe(&mut self, id : NodeId, data : &PlateArray<f64>, mask : &PlateArray<bool>) -> Result<()> {
        let node = self.nodes.get_mut(id.0)
            .ok_or_else(|| BayesError::config(format!("Unknown node {}", id)))?;
        match &mut node.kind {
            NodeKind::Normal(y) => y.observe(&node.plates, data, mask),
            _ => Err(BayesError::config(format!("Node {} does not hold observations", node.name)))
        }
    }

    /// Term of the lower bound owned by the node: E[log p(x | parents)] - E[log q(x)]
    /// for latent nodes, the expected log-likelihood of observed elements for Normal
    /// nodes, zero for deterministic nodes.
    pub fn lower_bound_contribution(&self, id : NodeId) -> Result<f64> {
        let node = self.node(id)?;
        match &node.kind {
            NodeKind::Gaussian(g) => g.lower_bound(self.ard_moments(id)?),
            NodeKind::Gamma(g) => Ok(g.lower_bound()),
            NodeKind::Dot(_) => Ok(0.),
            NodeKind::Normal(y) => {
                let f = self.scalar_moments(node.parents[0])?;
                Ok(y.lower_bound(&f, self.gamma_moments(node.parents[1])?))
            }
        }
    }

    /// Total evidence lower bound, summed in node order.
    pub fn lower_bound(&self) -> Result<f64> {
        self.ids().map(|id| self.lower_bound_contribution(id)).sum()
    }

    pub fn parameters(&self) -> Vec<NodeParams> {
        self.nodes.iter().map(|n| n.params()).collect()
    }

    /// Validates a parameter set against the node without installing it.
    pub(crate) fn prepare(&self, id : NodeId, params : NodeParams) -> Result<NodeState> {
        let node = self.node(id)?;
        match (&node.kind, params) {
            (NodeKind::Gaussian(g), NodeParams::Gaussian { phi1, phi2 }) => {
                Ok(NodeState::Gaussian(g.state(phi1, phi2, &node.name)?))
            },
            (NodeKind::Gamma(g), NodeParams::Gamma { phi_rate, phi_shape }) => {
                Ok(NodeState::Gamma(g.state(phi_rate, phi_shape, &node.name)?))
            },
            (NodeKind::Normal(y), NodeParams::Normal { phi1, phi2 }) => {
                y.check_params(&phi1, &phi2, &node.name)?;
                Ok(NodeState::Normal(phi1, phi2))
            },
            (NodeKind::Dot(_), NodeParams::Deterministic) => Ok(NodeState::Deterministic),
            (_, p) => Err(BayesError::StructuralMismatch(format!(
                "Node {} ({}) cannot hold {:?} parameters", node.name, node.family(), p.family()
            )))
        }
    }

    /// Installs several parameter sets at once: either all of them are valid and
    /// installed, or the graph is left unchanged.
    pub fn set_parameters(&mut self, params : Vec<(NodeId, NodeParams)>) -> Result<()> {
        let states = params.into_iter()
            .map(|(id, p)| self.prepare(id, p).map(|s| (id, s)))
            .collect::<Result<Vec<_>>>()?;
        for (id, s) in states {
            self.commit(id, s);
        }
        Ok(())
    }

    /// Rebuilds the natural parameters of a node from their flattened form.
    pub fn params_from_flat(&self, id : NodeId, values : &[f64]) -> Result<NodeParams> {
        let node = self.node(id)?;
        let mismatch = |expected : usize| BayesError::StructuralMismatch(format!(
            "Node {} expects {} parameter values, found {}", node.name, expected, values.len()
        ));
        match &node.kind {
            NodeKind::Gaussian(g) => {
                let d = g.dim();
                let stride = d + d * d;
                if values.len() != stride * g.len() {
                    return Err(mismatch(stride * g.len()));
                }
                let (phi1, phi2) : (Vec<DVector<f64>>, Vec<DMatrix<f64>>) = values.chunks(stride)
                    .map(|c| (DVector::from_column_slice(&c[..d]), DMatrix::from_column_slice(d, d, &c[d..])))
                    .unzip();
                Ok(NodeParams::Gaussian { phi1, phi2 })
            },
            NodeKind::Gamma(_) | NodeKind::Normal(_) => {
                let n = node.plates.size();
                if values.len() != 2 * n {
                    return Err(mismatch(2 * n));
                }
                let (a, b) : (Vec<f64>, Vec<f64>) = values.chunks(2).map(|c| (c[0], c[1])).unzip();
                if node.family() == Family::Gamma {
                    Ok(NodeParams::Gamma { phi_rate : a, phi_shape : b })
                } else {
                    Ok(NodeParams::Normal { phi1 : a, phi2 : b })
                }
            },
            NodeKind::Dot(_) => {
                if !values.is_empty() {
                    return Err(mismatch(0));
                }
                Ok(NodeParams::Deterministic)
            }
        }
    }

}

impl Display for FactorGraph {

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in self.nodes.iter() {
            let parents : Vec<&str> = node.parents.iter().map(|p| &self.nodes[p.0].name[..]).collect();
            writeln!(f, "{} : {}{} <- [{}]", node.name, node.family(), node.plates, parents.join(", "))?;
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {

    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn bilinear() -> (FactorGraph, NodeId, NodeId, NodeId, NodeId, NodeId) {
        let mut g = FactorGraph::new();
        let alpha = g.add_gamma("alpha", &[2], 1e-2, 1e-2).unwrap();
        let w = g.add_gaussian("W", &[3, 1], DVector::zeros(2), Precision::Ard(alpha)).unwrap();
        let x = g.add_gaussian("X", &[1, 4], DVector::zeros(2), Precision::Fixed(DMatrix::identity(2, 2))).unwrap();
        let wx = g.add_dot("WX", w, x).unwrap();
        let tau = g.add_gamma("tau", &[], 1e-2, 1e-2).unwrap();
        let y = g.add_normal("Y", wx, tau).unwrap();
        (g, w, x, wx, tau, y)
    }

    #[test]
    fn construction_validates_structure() {
        let (mut g, w, x, wx, tau, y) = bilinear();
        assert_eq!(g.node(wx).unwrap().plates(), &Plates::new(&[3, 4]));
        assert_eq!(g.node(y).unwrap().plates(), &Plates::new(&[3, 4]));
        assert_eq!(g.find("tau"), Some(tau));
        assert!(g.add_gamma("tau", &[], 1., 1.).is_err());
        assert!(g.add_dot("WW", w, w).is_err());
        let z = g.add_gaussian("Z", &[2], DVector::zeros(3), Precision::Fixed(DMatrix::identity(3, 3))).unwrap();
        assert!(g.add_dot("XZ", x, z).is_err());
        // W has plates (3, 1) and X (1, 4), but V is (2, 4).
        let v = g.add_gaussian("V", &[2, 4], DVector::zeros(2), Precision::Fixed(DMatrix::identity(2, 2))).unwrap();
        assert!(g.add_dot("WV", w, v).is_err());
        assert!(g.add_normal("Y2", x, tau).is_err());
        let alpha = g.find("alpha").unwrap();
        assert!(g.add_gaussian("U", &[3], DVector::zeros(3), Precision::Ard(alpha)).is_err());
        let order = g.sweep_order().unwrap();
        assert!(!order.contains(&wx));
        let pos = |id : NodeId| order.iter().position(|o| *o == id).unwrap();
        assert!(pos(alpha) < pos(w));
        assert!(pos(w) < pos(y));
    }

    #[test]
    fn updates_never_decrease_the_bound() {
        let (mut g, w, x, _, _, y) = bilinear();
        let mut rng = StdRng::seed_from_u64(1);
        let data = DMatrix::from_fn(3, 4, |i, j| (i as f64) - 0.5 * (j as f64));
        g.observe(y, &(&data).into(), &PlateArray::filled(&[3, 4], true)).unwrap();
        g.initialize_from_random(x, &mut rng).unwrap();
        g.initialize_from_random(w, &mut rng).unwrap();
        let mut prev = g.lower_bound().unwrap();
        for _ in 0..20 {
            for id in g.sweep_order().unwrap() {
                g.update(id).unwrap();
                let lb = g.lower_bound().unwrap();
                assert!(lb >= prev - 1e-8 * prev.abs().max(1.), "{} < {}", lb, prev);
                prev = lb;
            }
        }
    }

    #[test]
    fn dot_mean_is_product_of_parent_means() {
        let (mut g, w, x, wx, _, _) = bilinear();
        let mut rng = StdRng::seed_from_u64(2);
        g.initialize_from_random(w, &mut rng).unwrap();
        g.initialize_from_random(x, &mut rng).unwrap();
        let f = g.scalar_moments(wx).unwrap();
        let (mw, mx) = (g.gaussian_moments(w).unwrap(), g.gaussian_moments(x).unwrap());
        for i in 0..3 {
            for j in 0..4 {
                let expected : f64 = (0..2).map(|d| mw.mean[i][d] * mx.mean[j][d]).sum();
                assert_relative_eq!(f.mean[i * 4 + j], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn flat_parameters_round_trip_structure() {
        let (g, w, _, wx, tau, _) = bilinear();
        let flat = g.node(w).unwrap().params().flatten();
        assert_eq!(flat.len(), 3 * (2 + 4));
        assert_eq!(g.params_from_flat(w, &flat).unwrap(), g.node(w).unwrap().params());
        assert!(matches!(g.params_from_flat(tau, &flat), Err(BayesError::StructuralMismatch(_))));
        assert_eq!(g.params_from_flat(wx, &[]).unwrap(), NodeParams::Deterministic);
    }

}
