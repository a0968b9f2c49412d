//! Served indexes: registry, per-index handles and statistics, plus the
//! narrow seam to the query engine.

pub mod mem;
pub mod registry;
pub mod served;
pub mod stats;

pub use registry::{IndexRegistry, RegistryError};
pub use served::{
    DistributedDesc, FileAccess, IndexType, NotMutable, SearchIndex, Served, ServedIndex,
};
pub use stats::{QueryStats, StatsSnapshot};

/// Failure inside the query executor.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ExecError(pub String);

/// Result of executing or merging a query: the reply body plus the row
/// count fed into per-index statistics.
#[derive(Debug, Default)]
pub struct ExecOutput {
    pub body: Vec<u8>,
    pub rows: u64,
}

/// The query engine behind the serving core. Request and reply bodies are
/// opaque here; the executor owns their layout.
pub trait QueryExecutor: Send + Sync + 'static {
    /// Name of the index a request body targets.
    fn target_index(&self, body: &[u8]) -> Result<String, ExecError>;

    /// Run the request against one local index handle.
    fn execute(&self, index: &Served, body: &[u8]) -> Result<ExecOutput, ExecError>;

    /// Rewrite a request body so a remote agent resolves it against its
    /// own index list.
    fn build_remote(&self, body: &[u8], target_indexes: &str) -> Vec<u8>;

    /// Merge local and remote reply bodies, arrival order.
    fn merge(&self, parts: Vec<Vec<u8>>) -> ExecOutput;
}
