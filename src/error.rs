//! Engine-construction errors. Per spec.md §7, failure to offload a flow is
//! never an error to the caller — only construction/lifecycle problems are.

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to spawn offload worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
