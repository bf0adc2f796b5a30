#![doc = include_str!("../README.md")]
#![doc(test(attr(deny(warnings))))]

mod binding;
mod dataset;
mod error;
mod eval;
mod expression;
mod graph_scan;
mod limits;
mod plan;
mod query;
mod scan;
mod service;
mod subquery;
mod update;
mod vocab;

pub use crate::binding::Value;
pub use crate::dataset::{QuadIter, QuadStore, StoreBatch};
pub use crate::error::{EvaluationError, ServiceError};
pub use crate::eval::{QueryOutcome, QuerySolution, SolutionIter, TripleIter};
pub use crate::limits::{CancellationToken, ExecutionLimits};
pub use crate::query::{
    infer_term_kind, AggregateFunction, BindAssignment, DatasetSpec, ExistsFilter, GraphClause,
    GraphPattern, GraphRef, GraphTarget, OrderKey, PathMode, QuadPatternSpec, Query, QueryKind,
    SelectClause, SelectItem, ServiceClause, SolutionModifiers, SourceBuffer, Span, SubQuery,
    Term, TermKind, TriplePattern, UpdateOp, ValuesBlock,
};
pub use crate::service::{ServiceExecutor, ServiceRow};
pub use crate::update::{Loader, UpdateResult};

use crate::scan::ExecContext;
use crate::update::UpdateContext;
use std::sync::Arc;

/// Executes parsed SPARQL queries and updates against a [`QuadStore`].
///
/// ```
/// use quadmem::{MemoryQuadStore, Quad};
/// use sparscan::{Query, QueryExecutor, QueryKind, QueryOutcome, SourceBuffer};
///
/// let store = MemoryQuadStore::new();
/// let mut batch = store.batch()?;
/// batch.insert(Quad::triple(
///     "<http://example.com/a>",
///     "<http://example.com/knows>",
///     "<http://example.com/b>",
/// ));
/// batch.commit()?;
///
/// let mut buffer = SourceBuffer::new();
/// let pattern = buffer.push_pattern("?s", "<http://example.com/knows>", "?o");
/// let mut query = Query::new(QueryKind::Select, buffer.finish());
/// query.pattern.patterns.push(pattern);
///
/// let QueryOutcome::Solutions(solutions) = QueryExecutor::new().execute(&store, &query)? else {
///     unreachable!("a SELECT produces solutions");
/// };
/// let rows = solutions.collect::<Result<Vec<_>, _>>()?;
/// assert_eq!(rows.len(), 1);
/// # Ok::<_, Box<dyn std::error::Error>>(())
/// ```
#[derive(Clone, Default)]
pub struct QueryExecutor {
    service: Option<Arc<dyn ServiceExecutor>>,
    loader: Option<Arc<dyn Loader>>,
    limits: ExecutionLimits,
}

impl QueryExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the given executor for `SERVICE` clauses.
    #[must_use]
    pub fn with_service_executor(mut self, executor: impl ServiceExecutor + 'static) -> Self {
        self.service = Some(Arc::new(executor));
        self
    }

    /// Use the given loader for `LOAD` operations.
    #[must_use]
    pub fn with_loader(mut self, loader: impl Loader + 'static) -> Self {
        self.loader = Some(Arc::new(loader));
        self
    }

    /// Replace the default [`ExecutionLimits`].
    #[must_use]
    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Evaluates a read query; the result iterators borrow the store and
    /// the query for as long as the caller keeps them.
    pub fn execute<'a>(
        &self,
        store: &'a dyn QuadStore,
        query: &'a Query,
    ) -> Result<QueryOutcome<'a>, EvaluationError> {
        self.execute_cancellable(store, query, CancellationToken::new())
    }

    /// Like [`execute`](Self::execute) with a caller-provided cancellation
    /// token; cancelling it makes the running execution unwind with
    /// [`EvaluationError::Cancelled`].
    pub fn execute_cancellable<'a>(
        &self,
        store: &'a dyn QuadStore,
        query: &'a Query,
        cancel: CancellationToken,
    ) -> Result<QueryOutcome<'a>, EvaluationError> {
        let ctx = ExecContext::new(store, query, self.limits.clone(), cancel);
        eval::run_query(ctx, self.service.clone())
    }

    /// Executes an update request; each operation runs in its own batched
    /// store transaction.
    pub fn execute_update(&self, store: &dyn QuadStore, query: &Query) -> UpdateResult {
        self.execute_update_cancellable(store, query, CancellationToken::new())
    }

    pub fn execute_update_cancellable(
        &self,
        store: &dyn QuadStore,
        query: &Query,
        cancel: CancellationToken,
    ) -> UpdateResult {
        update::execute_update(&UpdateContext {
            store,
            query,
            limits: &self.limits,
            cancel: &cancel,
            service: self.service.clone(),
            loader: self.loader.clone(),
        })
    }
}
