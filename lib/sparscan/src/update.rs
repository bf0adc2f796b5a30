//! SPARQL Update execution.
//!
//! Every operation runs inside one batched store transaction, committed at
//! the end and rolled back on any error; `SILENT` turns a failed operation
//! into success with zero affected quads.

use crate::binding::Value;
use crate::dataset::{QuadStore, StoreBatch};
use crate::error::EvaluationError;
use crate::eval::{run_query, QueryOutcome, QuerySolution};
use crate::limits::{CancellationToken, ExecutionLimits};
use crate::query::{
    GraphClause, GraphPattern, GraphRef, GraphTarget, QuadPatternSpec, Query, QueryKind, Term,
    UpdateOp,
};
use crate::scan::ExecContext;
use crate::service::ServiceExecutor;
use rustc_hash::FxHashMap;
use quadmem::Quad;
use std::error::Error;
use std::sync::Arc;

/// Outcome of one update request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateResult {
    pub success: bool,
    /// Number of quads actually inserted or removed.
    pub affected: u64,
    pub error_message: Option<String>,
}

impl UpdateResult {
    fn ok(affected: u64) -> Self {
        Self {
            success: true,
            affected,
            error_message: None,
        }
    }

    fn failed(error: &EvaluationError) -> Self {
        Self {
            success: false,
            affected: 0,
            error_message: Some(error.to_string()),
        }
    }
}

/// External document loader backing `LOAD`.
pub trait Loader: Send + Sync {
    /// Loads `source` into `graph` (default graph when `None`) and returns
    /// the number of quads added.
    fn load(
        &self,
        source: &str,
        graph: Option<&str>,
        store: &dyn QuadStore,
    ) -> Result<u64, Box<dyn Error + Send + Sync>>;
}

pub(crate) struct UpdateContext<'a> {
    pub store: &'a dyn QuadStore,
    pub query: &'a Query,
    pub limits: &'a ExecutionLimits,
    pub cancel: &'a CancellationToken,
    pub service: Option<Arc<dyn ServiceExecutor>>,
    pub loader: Option<Arc<dyn Loader>>,
}

pub(crate) fn execute_update(ctx: &UpdateContext<'_>) -> UpdateResult {
    let mut total = 0;
    for op in &ctx.query.updates {
        if let Err(e) = ctx.cancel.check() {
            return UpdateResult::failed(&e);
        }
        match run_operation(ctx, op) {
            Ok(affected) => total += affected,
            Err(e) => return UpdateResult::failed(&e),
        }
    }
    UpdateResult::ok(total)
}

fn with_batch<F>(store: &dyn QuadStore, fill: F) -> Result<u64, EvaluationError>
where
    F: FnOnce(&mut dyn StoreBatch) -> Result<(), EvaluationError>,
{
    let mut batch = store.begin_batch()?;
    match fill(batch.as_mut()) {
        Ok(()) => Ok(batch.commit()?),
        Err(e) => {
            batch.rollback();
            Err(e)
        }
    }
}

fn run_operation(ctx: &UpdateContext<'_>, op: &UpdateOp) -> Result<u64, EvaluationError> {
    match op {
        UpdateOp::InsertData { quads } => with_batch(ctx.store, |batch| {
            let mut bnodes = FxHashMap::default();
            for spec in quads {
                if let Some(quad) = ground_quad(ctx.query, spec, None, None, Some(&mut bnodes)) {
                    batch.insert(quad)?;
                }
            }
            Ok(())
        }),
        UpdateOp::DeleteData { quads } => with_batch(ctx.store, |batch| {
            for spec in quads {
                // Blank nodes cannot occur in DELETE DATA; a quad that
                // still has one simply matches nothing.
                if let Some(quad) = ground_quad(ctx.query, spec, None, None, None) {
                    batch.delete(quad)?;
                }
            }
            Ok(())
        }),
        UpdateOp::DeleteWhere { patterns } => {
            let solutions = where_solutions(ctx, patterns, &GraphPattern::default(), None)?;
            with_batch(ctx.store, |batch| {
                for solution in &solutions {
                    for spec in patterns {
                        if let Some(quad) =
                            ground_quad(ctx.query, spec, None, Some(solution), None)
                        {
                            batch.delete(quad)?;
                        }
                    }
                }
                Ok(())
            })
        }
        UpdateOp::DeleteInsert {
            delete,
            insert,
            pattern,
            with,
        } => {
            let with_graph = with.and_then(|term| ctx.query.constant_lexical(term));
            let solutions = where_solutions(ctx, &[], pattern, *with)?;
            with_batch(ctx.store, |batch| {
                for solution in &solutions {
                    for spec in delete {
                        if let Some(quad) = ground_quad(
                            ctx.query,
                            spec,
                            with_graph.as_deref(),
                            Some(solution),
                            None,
                        ) {
                            batch.delete(quad)?;
                        }
                    }
                    let mut bnodes = FxHashMap::default();
                    for spec in insert {
                        if let Some(quad) = ground_quad(
                            ctx.query,
                            spec,
                            with_graph.as_deref(),
                            Some(solution),
                            Some(&mut bnodes),
                        ) {
                            batch.insert(quad)?;
                        }
                    }
                }
                Ok(())
            })
        }
        UpdateOp::Clear { target, silent } | UpdateOp::Drop { target, silent } => {
            silently(*silent, || clear_target(ctx, *target))
        }
        UpdateOp::Create { .. } => {
            // Graphs exist implicitly; CREATE has nothing to do.
            Ok(0)
        }
        UpdateOp::Copy { from, to, silent } => {
            silently(*silent, || copy_graph(ctx, *from, *to, true, false))
        }
        UpdateOp::Move { from, to, silent } => {
            silently(*silent, || copy_graph(ctx, *from, *to, true, true))
        }
        UpdateOp::Add { from, to, silent } => {
            silently(*silent, || copy_graph(ctx, *from, *to, false, false))
        }
        UpdateOp::Load {
            source,
            graph,
            silent,
        } => silently(*silent, || load(ctx, *source, *graph)),
    }
}

fn silently<F>(silent: bool, run: F) -> Result<u64, EvaluationError>
where
    F: FnOnce() -> Result<u64, EvaluationError>,
{
    match run() {
        Ok(affected) => Ok(affected),
        Err(e) if silent => {
            tracing::debug!(error = %e, "SILENT update operation failed");
            Ok(0)
        }
        Err(e) => Err(e),
    }
}

/// Runs the WHERE clause of a template update as a `SELECT *` and
/// materializes its solutions against the pre-update store state.
fn where_solutions(
    ctx: &UpdateContext<'_>,
    patterns: &[QuadPatternSpec],
    pattern: &GraphPattern,
    with: Option<Term>,
) -> Result<Vec<QuerySolution>, EvaluationError> {
    let mut where_pattern = pattern.clone();
    for spec in patterns {
        match spec.graph {
            Some(graph) => where_pattern.graphs.push(GraphClause {
                graph,
                pattern: GraphPattern {
                    patterns: vec![spec.triple],
                    ..GraphPattern::default()
                },
            }),
            None => where_pattern.patterns.push(spec.triple),
        }
    }
    let mut select = Query::new(QueryKind::Select, ctx.query.text.clone());
    select.prefixes = ctx.query.prefixes.clone();
    select.pattern = where_pattern;
    if let Some(term) = with {
        // WITH acts as the default graph for the whole WHERE clause; the
        // dataset clause is exactly that scoping.
        select.dataset.from.push(term);
    }
    let exec = ExecContext::new(
        ctx.store,
        &select,
        ctx.limits.clone(),
        ctx.cancel.clone(),
    );
    let QueryOutcome::Solutions(solutions) = run_query(exec, ctx.service.clone())? else {
        return Ok(Vec::new());
    };
    let mut rows = Vec::new();
    for solution in solutions {
        ExecutionLimits::check(
            rows.len() + 1,
            ctx.limits.max_materialized_rows,
            "update WHERE solutions",
        )?;
        rows.push(solution?);
    }
    Ok(rows)
}

/// Resolves one quad template slot to a concrete lexical form.
fn template_term(
    query: &Query,
    term: Term,
    solution: Option<&QuerySolution>,
    bnodes: Option<&mut FxHashMap<String, String>>,
) -> Option<String> {
    if let Some(name) = query.variable_name(term) {
        if name.starts_with("_:") {
            // A template blank node mints one fresh node per solution;
            // the same label maps to the same fresh node within it.
            let bnodes = bnodes?;
            return Some(
                bnodes
                    .entry(name.to_owned())
                    .or_insert_with(|| format!("_:u{:016x}", rand::random::<u64>()))
                    .clone(),
            );
        }
        return solution?.get(name).and_then(Value::lexical_form);
    }
    query.constant_lexical(term)
}

fn ground_quad(
    query: &Query,
    spec: &QuadPatternSpec,
    with_graph: Option<&str>,
    solution: Option<&QuerySolution>,
    mut bnodes: Option<&mut FxHashMap<String, String>>,
) -> Option<Quad> {
    let subject = template_term(query, spec.triple.subject, solution, bnodes.as_deref_mut())?;
    let predicate = template_term(query, spec.triple.predicate, solution, None)?;
    let object = template_term(query, spec.triple.object, solution, bnodes.as_deref_mut())?;
    if subject.starts_with('"') || !predicate.starts_with('<') {
        return None;
    }
    let graph = match spec.graph {
        Some(term) => template_term(query, term, solution, None)?,
        None => with_graph.map(str::to_owned).unwrap_or_default(),
    };
    if !graph.is_empty() && !graph.starts_with('<') {
        return None;
    }
    Some(Quad::new(subject, predicate, object, graph))
}

fn resolve_graph_ref(query: &Query, graph: GraphRef) -> Result<String, EvaluationError> {
    match graph {
        GraphRef::Default => Ok(String::new()),
        GraphRef::Graph(term) => query.constant_lexical(term).ok_or_else(|| {
            EvaluationError::Unsupported("graph reference must be a concrete IRI".into())
        }),
    }
}

fn clear_target(ctx: &UpdateContext<'_>, target: GraphTarget) -> Result<u64, EvaluationError> {
    let query = ctx.query;
    let (graph_filter, keep): (String, fn(&Quad) -> bool) = match target {
        GraphTarget::Default => (String::new(), Quad::in_default_graph),
        GraphTarget::Named => (String::new(), |quad| !quad.in_default_graph()),
        GraphTarget::All => (String::new(), |_| true),
        GraphTarget::Graph(term) => {
            let graph = query.constant_lexical(term).ok_or_else(|| {
                EvaluationError::Unsupported("graph target must be a concrete IRI".into())
            })?;
            (graph, |_| true)
        }
    };
    let mut doomed = Vec::new();
    for quad in ctx.store.quads("", "", "", &graph_filter) {
        let quad = quad?;
        if keep(&quad) {
            doomed.push(quad);
        }
    }
    if doomed.is_empty() {
        if let GraphTarget::Graph(term) = target {
            let graph = query.constant_lexical(term).unwrap_or_default();
            return Err(EvaluationError::GraphNotFound(graph));
        }
    }
    with_batch(ctx.store, |batch| {
        for quad in doomed {
            batch.delete(quad)?;
        }
        Ok(())
    })
}

fn copy_graph(
    ctx: &UpdateContext<'_>,
    from: GraphRef,
    to: GraphRef,
    clear_destination: bool,
    clear_source: bool,
) -> Result<u64, EvaluationError> {
    let source = resolve_graph_ref(ctx.query, from)?;
    let destination = resolve_graph_ref(ctx.query, to)?;
    if source == destination {
        return Ok(0);
    }
    let select = |graph: &str| -> Result<Vec<Quad>, EvaluationError> {
        let mut quads = Vec::new();
        for quad in ctx.store.quads("", "", "", graph) {
            let quad = quad?;
            // An empty selector means the default graph here, not "any".
            if graph.is_empty() && !quad.in_default_graph() {
                continue;
            }
            quads.push(quad);
        }
        Ok(quads)
    };
    let moved = select(&source)?;
    let doomed_destination = if clear_destination {
        select(&destination)?
    } else {
        Vec::new()
    };
    with_batch(ctx.store, |batch| {
        for quad in doomed_destination {
            batch.delete(quad)?;
        }
        for quad in &moved {
            batch.insert(Quad::new(
                quad.subject.clone(),
                quad.predicate.clone(),
                quad.object.clone(),
                destination.clone(),
            ))?;
        }
        if clear_source {
            for quad in moved {
                batch.delete(quad)?;
            }
        }
        Ok(())
    })
}

fn load(
    ctx: &UpdateContext<'_>,
    source: Term,
    graph: Option<Term>,
) -> Result<u64, EvaluationError> {
    let query = ctx.query;
    let source_iri = query
        .constant_lexical(source)
        .and_then(|lexical| quadmem::iri_content(&lexical).map(str::to_owned))
        .ok_or_else(|| EvaluationError::Unsupported("LOAD source must be an IRI".into()))?;
    let graph = graph.and_then(|term| query.constant_lexical(term));
    let Some(loader) = &ctx.loader else {
        return Err(EvaluationError::Load {
            source_iri,
            message: "no document loader is configured".into(),
        });
    };
    loader
        .load(&source_iri, graph.as_deref(), ctx.store)
        .map_err(|e| EvaluationError::Load {
            source_iri,
            message: e.to_string(),
        })
}
