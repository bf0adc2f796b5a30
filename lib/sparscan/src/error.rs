use quadmem::StoreError;
use std::error::Error;

/// A query or update evaluation error.
///
/// Expression-level type errors never surface here: they are contained as
/// [`Value::Unbound`](crate::Value::Unbound) per the SPARQL error semantics
/// and only influence `FILTER` outcomes and `BIND` targets.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum EvaluationError {
    /// Invariant violation reported by the quad store; fatal for the
    /// current query or update.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A `SERVICE` call failed and the clause was not marked `SILENT`.
    #[error("SERVICE <{endpoint}> failed: {source}")]
    Service {
        endpoint: String,
        source: ServiceError,
    },
    /// The execution was cancelled through its [`CancellationToken`](crate::CancellationToken).
    #[error("the SPARQL operation has been cancelled")]
    Cancelled,
    /// A configured execution limit was hit.
    #[error("{what} exceeded the configured limit of {limit}")]
    ResourceExceeded { what: &'static str, limit: usize },
    /// `LOAD` failed and was not marked `SILENT`.
    #[error("LOAD <{source_iri}> failed: {message}")]
    Load { source_iri: String, message: String },
    /// `CLEAR` / `DROP` named a graph the store does not contain.
    #[error("graph {0} does not exist")]
    GraphNotFound(String),
    /// The query uses a collaborator this executor was not configured with
    /// (e.g. `SERVICE` without a service executor).
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// A failure reported by the external SPARQL service executor.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ServiceError {
    /// The endpoint could not be reached.
    #[error("transport error: {0}")]
    Transport(String),
    /// The endpoint answered with something that is not a SPARQL result.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Any other failure from the executor implementation.
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}
