use thiserror::Error;

/// Failure modes of graph construction, inference and checkpointing.
/// Configuration and shape errors are raised eagerly (at graph construction
/// or at observe(.)) and are fatal only to the call that produced them. Numerical
/// degeneracy inside a rotation step is not surfaced through this type, since the
/// rotation recovers locally by falling back to the identity transform.
#[derive(Error, Debug)]
pub enum BayesError {

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch { what : String, expected : Vec<usize>, found : Vec<usize> },

    #[error("Degenerate posterior at node {node}: {msg}")]
    Degenerate { node : String, msg : String },

    #[error("Checkpoint does not match the model structure: {0}")]
    StructuralMismatch(String),

    #[error("Lower bound decreased at iteration {iteration} (from {previous} to {current})")]
    BoundDecreased { iteration : usize, previous : f64, current : f64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error)

}

pub type Result<T> = std::result::Result<T, BayesError>;

impl BayesError {

    pub(crate) fn config<S : Into<String>>(msg : S) -> Self {
        BayesError::Configuration(msg.into())
    }

    pub(crate) fn shape(what : &str, expected : &[usize], found : &[usize]) -> Self {
        BayesError::ShapeMismatch {
            what : what.to_string(),
            expected : expected.to_vec(),
            found : found.to_vec()
        }
    }

}
