use serde::{Serialize, Deserialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use crate::distr::{Family, NodeParams};
use crate::graph::{FactorGraph, NodeId};
use crate::plates::Plates;
use crate::error::{BayesError, Result};

pub const FORMAT_VERSION : u32 = 1;

/// Structural identity and flattened natural parameters of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name : String,
    pub family : Family,
    pub plates : Plates,
    pub params : Vec<f64>
}

/// Whole-engine snapshot as persisted to disk: every node's natural parameters,
/// the iteration counter and the recorded lower bound trajectory. Floats are written
/// in their shortest round-trip representation, so a reloaded checkpoint is
/// bit-identical to the saved state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version : u32,
    pub iteration : usize,
    pub bounds : Vec<f64>,
    pub nodes : Vec<NodeRecord>
}

impl Checkpoint {

    pub fn capture(graph : &FactorGraph, iteration : usize, bounds : &[f64]) -> Self {
        let nodes = graph.nodes().iter().map(|n| NodeRecord {
            name : n.name().to_string(),
            family : n.family(),
            plates : n.plates().clone(),
            params : n.params().flatten()
        }).collect();
        Self { version : FORMAT_VERSION, iteration, bounds : bounds.to_vec(), nodes }
    }

    /// Writes to a temporary file in the target directory, which is then renamed over
    /// `path`, so a partially-written checkpoint is never visible at `path`.
    pub fn write(&self, path : &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new(".")
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        {
            let mut w = BufWriter::new(tmp.as_file_mut());
            serde_json::to_writer(&mut w, self)?;
            w.flush()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| BayesError::Io(e.error))?;
        log::debug!("Checkpoint written to {} (iteration {})", path.display(), self.iteration);
        Ok(())
    }

    pub fn read(path : &Path) -> Result<Self> {
        let f = File::open(path)?;
        let ckpt : Checkpoint = serde_json::from_reader(BufReader::new(f))?;
        Ok(ckpt)
    }

    /// Matches every record against the graph and rebuilds the per-node parameters,
    /// without touching the graph.
    pub fn params_for(&self, graph : &FactorGraph) -> Result<Vec<(NodeId, NodeParams)>> {
        if self.version != FORMAT_VERSION {
            return Err(BayesError::StructuralMismatch(format!("Unsupported checkpoint version {}", self.version)));
        }
        if self.nodes.len() != graph.len() {
            return Err(BayesError::StructuralMismatch(format!(
                "Checkpoint holds {} nodes, but the model has {}", self.nodes.len(), graph.len()
            )));
        }
        if self.bounds.len() > self.iteration {
            return Err(BayesError::StructuralMismatch(String::from("Lower bound trajectory longer than the iteration count")));
        }
        graph.ids().zip(self.nodes.iter()).map(|(id, rec)| {
            let node = graph.node(id)?;
            if node.name() != rec.name || node.family() != rec.family || node.plates() != &rec.plates {
                return Err(BayesError::StructuralMismatch(format!(
                    "Node {} ({}{}) does not match checkpoint record {} ({}{})",
                    node.name(), node.family(), node.plates(), rec.name, rec.family, rec.plates
                )));
            }
            Ok((id, graph.params_from_flat(id, &rec.params)?))
        }).collect()
    }

}
