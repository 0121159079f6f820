use nalgebra::*;
use rand::Rng;
use serde::{Serialize, Deserialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use crate::distr::NodeParams;
use crate::graph::{FactorGraph, NodeId};
use crate::plates::PlateArray;
use crate::error::{BayesError, Result};

/// Persisted whole-engine snapshots.
pub mod checkpoint;

pub use checkpoint::*;

/// Options of the variational engine. All fields have defaults, so a JSON
/// configuration file only needs to name the options it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VbConfig {

    /// Location used by save() and load(), and by periodic checkpointing.
    pub autosave : Option<PathBuf>,

    /// Write a checkpoint after every k-th iteration.
    pub autosave_every : Option<usize>,

    /// Relative decrease of the lower bound tolerated between two sweeps before
    /// it is reported as a correctness failure.
    pub bound_tolerance : f64,

    /// Stop update(.) early when the relative change of the bound falls below this value.
    pub tolerance : Option<f64>

}

impl Default for VbConfig {

    fn default() -> Self {
        Self { autosave : None, autosave_every : None, bound_tolerance : 1e-9, tolerance : None }
    }

}

impl VbConfig {

    pub fn from_json_file(path : &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let cfg : VbConfig = serde_json::from_str(&content)?;
        if !(cfg.bound_tolerance >= 0.) || cfg.autosave_every == Some(0) {
            return Err(BayesError::config("Invalid engine configuration"));
        }
        Ok(cfg)
    }

    pub fn autosave(mut self, path : &Path, every : Option<usize>) -> Self {
        self.autosave = Some(path.to_path_buf());
        self.autosave_every = every;
        self
    }

    pub fn tolerance(mut self, tol : f64) -> Self {
        self.tolerance = Some(tol);
        self
    }

}

/// Lifecycle of the engine. Terminated is final; load(.) re-enters Iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VbState {
    Constructed,
    Initializing,
    Iterating,
    Checkpointed,
    Terminated
}

/// In-memory copy of the engine state (parameters of every node, iteration counter
/// and bound trajectory).
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    iteration : usize,
    bounds : Vec<f64>,
    params : Vec<NodeParams>
}

impl Snapshot {

    pub fn iteration(&self) -> usize {
        self.iteration
    }

}

/// Mean-field variational Bayes over a factor graph. Each iteration sweeps the
/// stochastic nodes in dependency order, replacing each node posterior by its
/// conjugate coordinate-ascent optimum given the current moments of all other
/// nodes, then records the total lower bound. Since every single-node update is an
/// exact maximization, the recorded sequence L is non-decreasing; a decrease
/// beyond the configured tolerance signals a bug and is surfaced as an error.
///
/// The engine owns the graph. Node-level operations (observe, initialize_*) are
/// delegated to it, so the engine can track its lifecycle state.
#[derive(Debug, Clone)]
pub struct Vb {

    graph : FactorGraph,

    config : VbConfig,

    order : Vec<NodeId>,

    bounds : Vec<f64>,

    iteration : usize,

    state : VbState

}

impl Vb {

    pub fn new(graph : FactorGraph, config : VbConfig) -> Result<Self> {
        let order = graph.sweep_order()?;
        Ok(Self { graph, config, order, bounds : Vec::new(), iteration : 0, state : VbState::Constructed })
    }

    pub fn graph(&self) -> &FactorGraph {
        &self.graph
    }

    pub fn config(&self) -> &VbConfig {
        &self.config
    }

    pub fn find(&self, name : &str) -> Option<NodeId> {
        self.graph.find(name)
    }

    pub fn state(&self) -> VbState {
        self.state
    }

    /// Number of completed sweeps.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Recorded lower bound after every completed sweep.
    pub fn lower_bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Recomputes the lower bound at the current parameters.
    pub fn lower_bound(&self) -> Result<f64> {
        self.graph.lower_bound()
    }

    fn check_active(&self) -> Result<()> {
        if self.state == VbState::Terminated {
            return Err(BayesError::config("Inference engine was terminated"));
        }
        Ok(())
    }

    fn initializing(&mut self) -> Result<()> {
        self.check_active()?;
        if self.state == VbState::Constructed {
            self.state = VbState::Initializing;
        }
        Ok(())
    }

    pub fn observe(&mut self, id : NodeId, data : &PlateArray<f64>, mask : &PlateArray<bool>) -> Result<()> {
        self.initializing()?;
        self.graph.observe(id, data, mask)
    }

    pub fn initialize_from_prior(&mut self, id : NodeId) -> Result<()> {
        self.initializing()?;
        self.graph.initialize_from_prior(id)
    }

    pub fn initialize_from_value(&mut self, id : NodeId, values : &DMatrix<f64>) -> Result<()> {
        self.initializing()?;
        self.graph.initialize_from_value(id, values)
    }

    pub fn initialize_from_random<R : Rng + ?Sized>(&mut self, id : NodeId, rng : &mut R) -> Result<()> {
        self.initializing()?;
        self.graph.initialize_from_random(id, rng)
    }

    /// Updates a single node outside of a full sweep.
    pub fn update_node(&mut self, id : NodeId) -> Result<()> {
        self.check_active()?;
        self.graph.update(id)
    }

    /// Installs parameters on several nodes at once (all or nothing).
    pub fn set_parameters(&mut self, params : Vec<(NodeId, NodeParams)>) -> Result<()> {
        self.check_active()?;
        self.graph.set_parameters(params)
    }

    /// Runs `repeat` full sweeps, recording the bound after each one.
    pub fn update(&mut self, repeat : usize) -> Result<()> {
        self.check_active()?;
        for _ in 0..repeat {
            self.state = VbState::Iterating;
            let start = Instant::now();
            for ix in 0..self.order.len() {
                self.graph.update(self.order[ix])?;
            }
            let bound = self.graph.lower_bound()?;
            self.iteration += 1;
            let previous = self.bounds.last().copied();
            self.bounds.push(bound);
            log::info!(
                "Iteration {}: loglike={:e} ({:.3} seconds)",
                self.iteration, bound, start.elapsed().as_secs_f64()
            );
            if let Some(prev) = previous {
                if bound < prev - self.config.bound_tolerance * prev.abs().max(1.) {
                    log::error!("Lower bound decreased from {} to {} at iteration {}", prev, bound, self.iteration);
                    return Err(BayesError::BoundDecreased { iteration : self.iteration, previous : prev, current : bound });
                }
            }
            if let (Some(path), Some(every)) = (self.config.autosave.clone(), self.config.autosave_every) {
                if every > 0 && self.iteration % every == 0 {
                    self.save_to(&path)?;
                }
            }
            if let Some(prev) = previous {
                if let Some(tol) = self.config.tolerance {
                    if (bound - prev).abs() <= tol * bound.abs() {
                        log::info!("Converged at iteration {}", self.iteration);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Ends the inference. The engine can still be read, but not updated or reloaded.
    pub fn terminate(&mut self) {
        self.state = VbState::Terminated;
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            iteration : self.iteration,
            bounds : self.bounds.clone(),
            params : self.graph.parameters()
        }
    }

    /// Reinstalls a snapshot taken from this engine.
    pub fn restore(&mut self, snapshot : &Snapshot) -> Result<()> {
        self.check_active()?;
        if snapshot.params.len() != self.graph.len() {
            return Err(BayesError::StructuralMismatch(String::from("Snapshot was taken from a different model")));
        }
        let params = self.graph.ids().zip(snapshot.params.iter().cloned()).collect();
        self.graph.set_parameters(params)?;
        self.iteration = snapshot.iteration;
        self.bounds = snapshot.bounds.clone();
        Ok(())
    }

    fn autosave_path(&self) -> Result<PathBuf> {
        self.config.autosave.clone()
            .ok_or_else(|| BayesError::config("No checkpoint location configured"))
    }

    /// Saves to the configured checkpoint location.
    pub fn save(&mut self) -> Result<()> {
        let path = self.autosave_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&mut self, path : &Path) -> Result<()> {
        Checkpoint::capture(&self.graph, self.iteration, &self.bounds).write(path)?;
        if self.state != VbState::Terminated {
            self.state = VbState::Checkpointed;
        }
        Ok(())
    }

    /// Loads from the configured checkpoint location.
    pub fn load(&mut self) -> Result<()> {
        let path = self.autosave_path()?;
        self.load_from(&path)
    }

    /// Replaces all node parameters, the iteration counter and the bound trajectory by
    /// those of a checkpoint. The checkpoint is validated completely before anything
    /// is changed, so a failed load leaves the engine as it was.
    pub fn load_from(&mut self, path : &Path) -> Result<()> {
        self.check_active()?;
        let ckpt = Checkpoint::read(path)?;
        let params = ckpt.params_for(&self.graph)?;
        self.graph.set_parameters(params)?;
        self.iteration = ckpt.iteration;
        self.bounds = ckpt.bounds;
        self.state = VbState::Iterating;
        log::debug!("Loaded checkpoint {} (iteration {})", path.display(), self.iteration);
        Ok(())
    }

}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::distr::Precision;
    use std::io::Write;

    fn engine() -> (Vb, NodeId) {
        let mut g = FactorGraph::new();
        let mu = g.add_gaussian("mu", &[], DVector::zeros(1), Precision::Fixed(DMatrix::identity(1, 1))).unwrap();
        let tau = g.add_gamma("tau", &[], 1., 1.).unwrap();
        let y = g.add_normal_with_plates("y", mu, tau, &[5]).unwrap();
        let mut vb = Vb::new(g, VbConfig::default()).unwrap();
        let data = PlateArray::new(&[5], vec![0.5, 1.5, 1.0, 0.8, 1.2]).unwrap();
        vb.observe(y, &data, &PlateArray::filled(&[5], true)).unwrap();
        (vb, y)
    }

    #[test]
    fn state_machine_transitions() {
        let (mut vb, _) = engine();
        assert_eq!(vb.state(), VbState::Initializing);
        vb.update(3).unwrap();
        assert_eq!(vb.state(), VbState::Iterating);
        assert_eq!(vb.iteration(), 3);
        assert_eq!(vb.lower_bounds().len(), 3);
        assert!(vb.save().is_err());
        vb.terminate();
        assert!(vb.update(1).is_err());
        assert_eq!(vb.iteration(), 3);
    }

    #[test]
    fn snapshot_restores_parameters() {
        let (mut vb, _) = engine();
        vb.update(1).unwrap();
        let snap = vb.snapshot();
        let before = vb.lower_bound().unwrap();
        vb.update(4).unwrap();
        vb.restore(&snap).unwrap();
        assert_eq!(vb.iteration(), 1);
        assert_eq!(vb.lower_bound().unwrap(), before);
        assert_eq!(vb.snapshot(), snap);
    }

    #[test]
    fn convergence_stops_early() {
        let (vb, _) = engine();
        let mut vb = Vb::new(vb.graph().clone(), VbConfig::default().tolerance(1e-3)).unwrap();
        vb.update(1000).unwrap();
        assert!(vb.iteration() < 1000);
    }

    #[test]
    fn config_reads_partial_json() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{{ \"autosave_every\" : 5, \"tolerance\" : 1e-6 }}").unwrap();
        let cfg = VbConfig::from_json_file(f.path()).unwrap();
        assert_eq!(cfg.autosave_every, Some(5));
        assert_eq!(cfg.tolerance, Some(1e-6));
        assert_eq!(cfg.bound_tolerance, 1e-9);
        assert!(cfg.autosave.is_none());
    }

    #[test]
    fn autosave_writes_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vb.json");
        let (vb, _) = engine();
        let mut vb = Vb::new(vb.graph().clone(), VbConfig::default().autosave(&path, Some(2))).unwrap();
        vb.update(3).unwrap();
        let ckpt = Checkpoint::read(&path).unwrap();
        assert_eq!(ckpt.iteration, 2);
        assert_eq!(ckpt.bounds.len(), 2);
        vb.load().unwrap();
        assert_eq!(vb.iteration(), 2);
        assert_eq!(vb.state(), VbState::Iterating);
    }

    #[test]
    fn failed_monotonicity_check_is_not_checkpointed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vb.json");
        let (vb, _) = engine();
        // A negative tolerance flags any sweep that does not double the bound.
        let mut cfg = VbConfig::default().autosave(&path, Some(1));
        cfg.bound_tolerance = -1.;
        let mut vb = Vb::new(vb.graph().clone(), cfg).unwrap();
        match vb.update(3) {
            Err(BayesError::BoundDecreased { iteration, .. }) => assert_eq!(iteration, 2),
            other => panic!("Unexpected result {:?}", other)
        }
        let ckpt = Checkpoint::read(&path).unwrap();
        assert_eq!(ckpt.iteration, 1);
        assert_eq!(ckpt.bounds.len(), 1);
    }

}
