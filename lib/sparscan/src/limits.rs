use crate::error::EvaluationError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Resource limits for one query or update execution.
///
/// ```
/// use sparscan::ExecutionLimits;
///
/// let limits = ExecutionLimits {
///     max_bindings: Some(256),
///     ..ExecutionLimits::default()
/// };
/// assert_eq!(limits.max_bindings, Some(256));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Maximum number of entries in one binding table.
    pub max_bindings: Option<usize>,
    /// Maximum size in bytes of one binding table's string arena.
    pub max_arena_bytes: Option<usize>,
    /// Maximum number of rows materialized at once (ORDER BY / GROUP BY
    /// buffers, subquery and MINUS result sets, service responses).
    pub max_materialized_rows: Option<usize>,
    /// Maximum number of nodes visited by one property-path traversal.
    pub max_path_nodes: Option<usize>,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_bindings: Some(4_096),
            max_arena_bytes: Some(16 * 1024 * 1024),
            max_materialized_rows: Some(1_000_000),
            max_path_nodes: Some(1_000_000),
        }
    }
}

impl ExecutionLimits {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Strict limits suitable for queries from untrusted clients.
    #[must_use]
    pub fn strict() -> Self {
        Self {
            max_bindings: Some(256),
            max_arena_bytes: Some(1024 * 1024),
            max_materialized_rows: Some(10_000),
            max_path_nodes: Some(10_000),
        }
    }

    /// No limits at all; only for trusted local workloads.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            max_bindings: None,
            max_arena_bytes: None,
            max_materialized_rows: None,
            max_path_nodes: None,
        }
    }

    pub(crate) fn check(
        actual: usize,
        limit: Option<usize>,
        what: &'static str,
    ) -> Result<(), EvaluationError> {
        match limit {
            Some(limit) if actual > limit => {
                Err(EvaluationError::ResourceExceeded { what, limit })
            }
            _ => Ok(()),
        }
    }
}

/// Cooperative cancellation handle for one execution.
///
/// Scans inspect the token at the head of each outer loop and each
/// nested-loop-join level; once set, the execution unwinds with
/// [`EvaluationError::Cancelled`] and releases its store resources.
///
/// ```
/// use sparscan::CancellationToken;
///
/// let token = CancellationToken::new();
/// let handle = token.clone();
/// assert!(!token.is_cancelled());
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; a terminal signal, there is no reset.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn check(&self) -> Result<(), EvaluationError> {
        if self.is_cancelled() {
            Err(EvaluationError::Cancelled)
        } else {
            Ok(())
        }
    }
}
