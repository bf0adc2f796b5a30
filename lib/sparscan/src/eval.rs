//! The result driver: composes scan operators into the full SPARQL
//! solution pipeline.
//!
//! Per candidate the driver applies, in order: join scan, `OPTIONAL`
//! extensions, `EXISTS` / `NOT EXISTS` filters, `BIND` assignments,
//! residual `FILTER`s, the post-query `VALUES` constraint, `MINUS`
//! exclusion, projection, `DISTINCT`, the `ORDER BY` buffer, `OFFSET` and
//! `LIMIT`. `ORDER BY` and `GROUP BY` materialize the full candidate set
//! first.

use crate::binding::{BindingTable, MaterializedRow, Value};
use crate::error::EvaluationError;
use crate::expression;
use crate::graph_scan::{DefaultGraphUnionScan, FixedGraphScan, VariableGraphScan};
use crate::limits::ExecutionLimits;
use crate::plan::{self, ordered_patterns, plan_group};
use crate::query::{
    fnv1a64, AggregateFunction, ExistsFilter, GraphPattern, Query, QueryKind, SelectItem, Span,
    TriplePattern, ValuesBlock,
};
use crate::scan::{
    group_core_scan, plain_group_scan, CrossGraphMultiPatternScan, ExecContext, GraphScope,
    MultiPatternScan, Scan, SequenceJoinScan, ValuesScan,
};
use crate::service::{
    IndexedServicePatternScan, ServiceExecutor, ServiceMaterializer, ServicePatternScan,
};
use crate::subquery::{SubQueryJoinScan, SubQueryScan};
use quadmem::Triple;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

/// One emitted solution mapping.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QuerySolution {
    pairs: Vec<(String, Value)>,
}

impl QuerySolution {
    pub(crate) fn new(pairs: Vec<(String, Value)>) -> Self {
        Self { pairs }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.pairs
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, value)| value)
    }

    /// The `(variable, value)` pairs in projection order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.pairs.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// What a query evaluates to.
pub enum QueryOutcome<'a> {
    /// `SELECT`
    Solutions(SolutionIter<'a>),
    /// `ASK`
    Boolean(bool),
    /// `CONSTRUCT` / `DESCRIBE`
    Graph(TripleIter<'a>),
}

/// Iterator over `SELECT` solutions.
pub struct SolutionIter<'a> {
    driver: Driver<'a>,
}

impl Iterator for SolutionIter<'_> {
    type Item = Result<QuerySolution, EvaluationError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.driver.next_solution()
    }
}

/// Iterator over `CONSTRUCT` / `DESCRIBE` triples.
pub struct TripleIter<'a> {
    inner: TripleSource<'a>,
}

enum TripleSource<'a> {
    Construct(ConstructIter<'a>),
    Describe(DescribeIter<'a>),
}

impl Iterator for TripleIter<'_> {
    type Item = Result<Triple, EvaluationError>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            TripleSource::Construct(iter) => iter.next(),
            TripleSource::Describe(iter) => iter.next(),
        }
    }
}

pub(crate) fn run_query<'a>(
    ctx: Rc<ExecContext<'a>>,
    service: Option<Arc<dyn ServiceExecutor>>,
) -> Result<QueryOutcome<'a>, EvaluationError> {
    match ctx.query.kind {
        QueryKind::Select => Ok(QueryOutcome::Solutions(SolutionIter {
            driver: Driver::new(ctx, service)?,
        })),
        QueryKind::Ask => {
            let mut driver = Driver::new(ctx, service)?;
            match driver.next_solution() {
                Some(Ok(_)) => Ok(QueryOutcome::Boolean(true)),
                Some(Err(e)) => Err(e),
                None => Ok(QueryOutcome::Boolean(false)),
            }
        }
        QueryKind::Construct => {
            let driver = Driver::new(Rc::clone(&ctx), service)?;
            Ok(QueryOutcome::Graph(TripleIter {
                inner: TripleSource::Construct(ConstructIter {
                    ctx,
                    driver,
                    buffer: VecDeque::new(),
                    emitted: FxHashSet::default(),
                    row: 0,
                }),
            }))
        }
        QueryKind::Describe => {
            let driver = Driver::new(Rc::clone(&ctx), service)?;
            Ok(QueryOutcome::Graph(TripleIter {
                inner: TripleSource::Describe(DescribeIter {
                    ctx,
                    driver,
                    buffer: VecDeque::new(),
                    described: FxHashSet::default(),
                }),
            }))
        }
        QueryKind::Update => Err(EvaluationError::Unsupported(
            "updates go through execute_update".into(),
        )),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Initial,
    Scanning,
    EmittingUnionBranch,
    ApplyingOptional,
    Finished,
}

/// One MINUS block, materialized: its solutions plus the `EXISTS` filters
/// that must hold against the combined outer + local bindings before a
/// candidate is excluded.
struct MinusEval<'a> {
    rows: Vec<MaterializedRow>,
    exists: &'a [ExistsFilter],
}

/// One union branch: its composed join scan plus the group chain whose
/// optionals, binds, filters and exclusions apply to its candidates.
struct Branch<'a> {
    scan: Box<dyn Scan + 'a>,
    blocks: Vec<&'a GraphPattern>,
    residual_filters: Vec<Span>,
    minus: Vec<MinusEval<'a>>,
}

pub(crate) struct Driver<'a> {
    ctx: Rc<ExecContext<'a>>,
    bindings: BindingTable,
    branches: Vec<Branch<'a>>,
    branch_idx: usize,
    state: DriverState,
    /// `FROM` graphs, when the query carries a dataset clause.
    from_graphs: Option<Rc<[String]>>,
    /// Pattern scope derived from the dataset clause.
    scope: GraphScope,
    distinct_seen: FxHashSet<u64>,
    emitted: u64,
    skipped: u64,
    buffered: Option<std::vec::IntoIter<QuerySolution>>,
}

impl<'a> Driver<'a> {
    pub fn new(
        ctx: Rc<ExecContext<'a>>,
        service: Option<Arc<dyn ServiceExecutor>>,
    ) -> Result<Self, EvaluationError> {
        let query = ctx.query;
        let from_graphs: Option<Rc<[String]>> = if query.dataset.from.is_empty() {
            None
        } else {
            Some(Rc::from(
                query
                    .dataset
                    .from
                    .iter()
                    .filter_map(|term| query.constant_lexical(*term))
                    .collect::<Vec<_>>(),
            ))
        };
        let scope = match &from_graphs {
            Some(graphs) => GraphScope::OneOf(Rc::clone(graphs)),
            None => GraphScope::Any,
        };
        // GRAPH ?g ranges over FROM NAMED when given; with no dataset
        // clause at all it falls back to the store's enumerator.
        let named_pool: Rc<[String]> = if !query.dataset.from_named.is_empty() {
            Rc::from(
                query
                    .dataset
                    .from_named
                    .iter()
                    .filter_map(|term| query.constant_lexical(*term))
                    .collect::<Vec<_>>(),
            )
        } else if query.dataset.from.is_empty() {
            let mut graphs = Vec::new();
            for graph in ctx.store.named_graphs() {
                graphs.push(graph?);
            }
            Rc::from(graphs)
        } else {
            Rc::from(Vec::new())
        };

        let mut materializer = ServiceMaterializer::new(service);
        let mut chains = Vec::new();
        collect_branches(&query.pattern, Vec::new(), &mut chains);
        let mut branches = Vec::with_capacity(chains.len());
        for chain in chains {
            branches.push(build_branch(
                &ctx,
                chain,
                &scope,
                &from_graphs,
                &named_pool,
                &mut materializer,
            )?);
        }
        Ok(Self {
            bindings: BindingTable::new(&ctx.limits),
            ctx,
            branches,
            branch_idx: 0,
            state: DriverState::Initial,
            from_graphs,
            scope,
            distinct_seen: FxHashSet::default(),
            emitted: 0,
            skipped: 0,
            buffered: None,
        })
    }

    fn needs_buffering(&self) -> bool {
        let query = self.ctx.query;
        !query.modifiers.order_by.is_empty()
            || !query.modifiers.group_by.is_empty()
            || query
                .select
                .items
                .iter()
                .any(|item| matches!(item, SelectItem::Aggregate { .. }))
    }

    pub fn next_solution(&mut self) -> Option<Result<QuerySolution, EvaluationError>> {
        if let Some(buffered) = &mut self.buffered {
            return buffered.next().map(Ok);
        }
        if self.state == DriverState::Finished {
            return None;
        }
        if self.needs_buffering() {
            match self.materialize_all() {
                Ok(rows) => {
                    self.buffered = Some(rows.into_iter());
                    return self.next_solution();
                }
                Err(e) => {
                    self.state = DriverState::Finished;
                    return Some(Err(e));
                }
            }
        }
        loop {
            match self.next_candidate() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    self.state = DriverState::Finished;
                    return Some(Err(e));
                }
            }
            let solution = match self.project() {
                Ok(solution) => solution,
                Err(e) => {
                    self.state = DriverState::Finished;
                    return Some(Err(e));
                }
            };
            if self.ctx.query.select.distinct && !self.distinct_admits(&solution) {
                continue;
            }
            if self.skipped < self.ctx.query.modifiers.offset {
                self.skipped += 1;
                continue;
            }
            if let Some(limit) = self.ctx.query.modifiers.limit {
                if self.emitted >= limit {
                    self.state = DriverState::Finished;
                    return None;
                }
            }
            self.emitted += 1;
            return Some(Ok(solution));
        }
    }

    /// Advances the active branch scan to the next candidate that passes
    /// every per-candidate stage.
    fn next_candidate(&mut self) -> Result<bool, EvaluationError> {
        loop {
            self.ctx.cancel.check()?;
            if self.branch_idx >= self.branches.len() {
                self.state = DriverState::Finished;
                return Ok(false);
            }
            self.state = if self.branch_idx == 0 {
                DriverState::Scanning
            } else {
                DriverState::EmittingUnionBranch
            };
            let yielded = self.branches[self.branch_idx]
                .scan
                .next(&mut self.bindings)?;
            if !yielded {
                self.branch_idx += 1;
                self.bindings.clear();
                continue;
            }
            if self.candidate_passes()? {
                return Ok(true);
            }
        }
    }

    fn candidate_passes(&mut self) -> Result<bool, EvaluationError> {
        let blocks = self.branches[self.branch_idx].blocks.clone();

        // OPTIONAL: run each optional group once against the current
        // bindings; merge the first match, otherwise leave the variables
        // unbound and keep the solution.
        self.state = DriverState::ApplyingOptional;
        for &block in &blocks {
            for optional in &block.optionals {
                let checkpoint = self.bindings.checkpoint();
                let mut scan = self.block_scan(optional)?;
                if !scan.next(&mut self.bindings)? {
                    self.bindings.truncate(checkpoint);
                }
            }
        }

        // EXISTS / NOT EXISTS.
        for block in &blocks {
            for filter in &block.exists {
                let matched =
                    exists_match(&self.ctx, &filter.pattern, &mut self.bindings, &self.scope)?;
                if matched == filter.negated {
                    return Ok(false);
                }
            }
        }

        // BIND, after the per-row seed advances.
        self.ctx.scratch.borrow_mut().row_seed += 1;
        for block in &blocks {
            for bind in &block.binds {
                let value = expression::evaluate(
                    self.ctx.query,
                    bind.expression,
                    &self.bindings,
                    &mut self.ctx.scratch.borrow_mut(),
                );
                if value.is_unbound() {
                    continue;
                }
                let Some(name) = self.ctx.query.variable_name(bind.target) else {
                    continue;
                };
                if !self.bindings.bind(name, &value)? {
                    return Ok(false);
                }
            }
        }

        // Residual FILTERs.
        for span in &self.branches[self.branch_idx].residual_filters {
            if !self.ctx.filter_passes(*span, &self.bindings) {
                return Ok(false);
            }
        }

        // Post-query VALUES constraint.
        if let Some(block) = &self.ctx.query.post_values {
            if !values_compatible(self.ctx.query, block, &self.bindings) {
                return Ok(false);
            }
        }

        // MINUS exclusion.
        for minus in &self.branches[self.branch_idx].minus {
            if minus_excludes(&self.ctx, minus, &self.bindings, &self.scope)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn block_scan(
        &self,
        group: &'a GraphPattern,
    ) -> Result<Box<dyn Scan + 'a>, EvaluationError> {
        match &self.from_graphs {
            Some(graphs) => Ok(Box::new(DefaultGraphUnionScan::new(
                Rc::clone(&self.ctx),
                group,
                Rc::clone(graphs),
            ))),
            None => plain_group_scan(&self.ctx, group, &GraphScope::Any),
        }
    }

    fn project(&self) -> Result<QuerySolution, EvaluationError> {
        let query = self.ctx.query;
        if query.select.items.is_empty() {
            let mut pairs = Vec::new();
            for index in 0..self.bindings.len() {
                let name = self.bindings.name_at(index);
                if !name.starts_with("_:") {
                    pairs.push((name.to_owned(), self.bindings.value(index)));
                }
            }
            return Ok(QuerySolution::new(pairs));
        }
        let mut pairs = Vec::new();
        for item in &query.select.items {
            match item {
                SelectItem::Variable(term) => {
                    let Some(name) = query.variable_name(*term) else {
                        continue;
                    };
                    pairs.push((name.to_owned(), self.bindings.get(name)));
                }
                SelectItem::Expression { expression, alias } => {
                    let value = expression::evaluate(
                        query,
                        *expression,
                        &self.bindings,
                        &mut self.ctx.scratch.borrow_mut(),
                    );
                    let Some(name) = query.variable_name(*alias) else {
                        continue;
                    };
                    pairs.push((name.to_owned(), value));
                }
                SelectItem::Aggregate { .. } => {
                    return Err(EvaluationError::Unsupported(
                        "aggregates require GROUP BY materialization".into(),
                    ));
                }
            }
        }
        Ok(QuerySolution::new(pairs))
    }

    /// DISTINCT check: FNV-1a over the projected values, separator
    /// delimited.
    fn distinct_admits(&mut self, solution: &QuerySolution) -> bool {
        let mut key = String::new();
        for (_, value) in &solution.pairs {
            key.push_str(&value.lexical_form().unwrap_or_default());
            key.push('\u{1f}');
        }
        self.distinct_seen.insert(fnv1a64(key.as_bytes()))
    }

    /// The ORDER BY / GROUP BY path: drains every candidate, aggregates
    /// when asked to, sorts, then applies DISTINCT, OFFSET and LIMIT.
    fn materialize_all(&mut self) -> Result<Vec<QuerySolution>, EvaluationError> {
        let query = self.ctx.query;
        let grouping = !query.modifiers.group_by.is_empty()
            || query
                .select
                .items
                .iter()
                .any(|item| matches!(item, SelectItem::Aggregate { .. }));
        let mut rows: Vec<(Vec<Value>, QuerySolution)> = Vec::new();
        if grouping {
            for solution in self.aggregate_rows()? {
                let keys = order_keys_for(&self.ctx, &solution)?;
                rows.push((keys, solution));
            }
        } else {
            while self.next_candidate()? {
                let solution = self.project()?;
                if query.select.distinct && !self.distinct_admits(&solution) {
                    continue;
                }
                // Order keys see the full bindings, projected or not.
                let keys = {
                    let mut scratch = self.ctx.scratch.borrow_mut();
                    query
                        .modifiers
                        .order_by
                        .iter()
                        .map(|key| {
                            expression::evaluate(query, key.expression, &self.bindings, &mut scratch)
                        })
                        .collect()
                };
                ExecutionLimits::check(
                    rows.len() + 1,
                    self.ctx.limits.max_materialized_rows,
                    "materialized result rows",
                )?;
                rows.push((keys, solution));
            }
        }
        let descending: Vec<bool> = query
            .modifiers
            .order_by
            .iter()
            .map(|key| key.descending)
            .collect();
        rows.sort_by(|(a, _), (b, _)| {
            for (index, (left, right)) in a.iter().zip(b).enumerate() {
                let ordering = expression::compare_order(left, right);
                let ordering = if descending.get(index).copied().unwrap_or(false) {
                    ordering.reverse()
                } else {
                    ordering
                };
                if !ordering.is_eq() {
                    return ordering;
                }
            }
            std::cmp::Ordering::Equal
        });
        let offset = query.modifiers.offset as usize;
        let limit = query
            .modifiers
            .limit
            .map_or(usize::MAX, |limit| limit as usize);
        self.state = DriverState::Finished;
        Ok(rows
            .into_iter()
            .map(|(_, solution)| solution)
            .skip(offset)
            .take(limit)
            .collect())
    }

    /// GROUP BY + aggregate evaluation over the fully drained candidate
    /// set.
    fn aggregate_rows(&mut self) -> Result<Vec<QuerySolution>, EvaluationError> {
        let query = self.ctx.query;
        let group_vars: Vec<String> = query
            .modifiers
            .group_by
            .iter()
            .filter_map(|term| query.variable_name(*term).map(str::to_owned))
            .collect();
        let agg_specs: Vec<&SelectItem> = query
            .select
            .items
            .iter()
            .filter(|item| matches!(item, SelectItem::Aggregate { .. }))
            .collect();
        let mut order: Vec<u64> = Vec::new();
        let mut groups: FxHashMap<u64, (Vec<(String, Value)>, Vec<AggAccum>)> =
            FxHashMap::default();
        while self.next_candidate()? {
            let mut key = String::new();
            let mut key_values = Vec::with_capacity(group_vars.len());
            for name in &group_vars {
                let value = self.bindings.get(name);
                key.push_str(&value.lexical_form().unwrap_or_default());
                key.push('\u{1f}');
                key_values.push((name.clone(), value));
            }
            let hash = fnv1a64(key.as_bytes());
            let entry = groups.entry(hash).or_insert_with(|| {
                order.push(hash);
                let accums = agg_specs.iter().map(|item| AggAccum::new(item)).collect();
                (key_values, accums)
            });
            for (accum, item) in entry.1.iter_mut().zip(&agg_specs) {
                let SelectItem::Aggregate { argument, .. } = item else {
                    continue;
                };
                match argument {
                    Some(span) => {
                        let value = expression::evaluate(
                            query,
                            *span,
                            &self.bindings,
                            &mut self.ctx.scratch.borrow_mut(),
                        );
                        accum.push(value);
                    }
                    // COUNT(*) counts the row itself.
                    None => accum.push_row(),
                }
            }
            ExecutionLimits::check(
                groups.len(),
                self.ctx.limits.max_materialized_rows,
                "aggregation groups",
            )?;
        }
        // A fully aggregated query (no GROUP BY) always has one group.
        if groups.is_empty() && group_vars.is_empty() && !agg_specs.is_empty() {
            let hash = 0;
            order.push(hash);
            groups.insert(
                hash,
                (
                    Vec::new(),
                    agg_specs.iter().map(|item| AggAccum::new(item)).collect(),
                ),
            );
        }
        let mut solutions = Vec::new();
        'groups: for hash in order {
            let Some((key_values, accums)) = groups.remove(&hash) else {
                continue;
            };
            // Bind group keys and aggregate aliases for HAVING and
            // expression projection.
            let mut table = BindingTable::new(&self.ctx.limits);
            for (name, value) in &key_values {
                table.bind(name, value)?;
            }
            let mut accum_iter = accums.into_iter();
            let mut pairs = Vec::new();
            for item in &query.select.items {
                match item {
                    SelectItem::Variable(term) => {
                        let Some(name) = query.variable_name(*term) else {
                            continue;
                        };
                        let value = key_values
                            .iter()
                            .find(|(candidate, _)| candidate == name)
                            .map_or(Value::Unbound, |(_, value)| value.clone());
                        pairs.push((name.to_owned(), value));
                    }
                    SelectItem::Aggregate { alias, .. } => {
                        let Some(name) = query.variable_name(*alias) else {
                            continue;
                        };
                        let value = accum_iter
                            .next()
                            .map_or(Value::Unbound, AggAccum::finish);
                        table.bind(name, &value)?;
                        pairs.push((name.to_owned(), value));
                    }
                    SelectItem::Expression { expression, alias } => {
                        let Some(name) = query.variable_name(*alias) else {
                            continue;
                        };
                        let value = expression::evaluate(
                            query,
                            *expression,
                            &table,
                            &mut self.ctx.scratch.borrow_mut(),
                        );
                        pairs.push((name.to_owned(), value));
                    }
                }
            }
            for having in &query.modifiers.having {
                if !self.ctx.filter_passes(*having, &table) {
                    continue 'groups;
                }
            }
            let solution = QuerySolution::new(pairs);
            if query.select.distinct && !self.distinct_admits(&solution) {
                continue;
            }
            solutions.push(solution);
        }
        Ok(solutions)
    }
}

/// Order keys for an already-projected (grouped) solution.
fn order_keys_for(
    ctx: &Rc<ExecContext<'_>>,
    solution: &QuerySolution,
) -> Result<Vec<Value>, EvaluationError> {
    let mut table = BindingTable::new(&ctx.limits);
    for (name, value) in &solution.pairs {
        table.bind(name, value)?;
    }
    let mut scratch = ctx.scratch.borrow_mut();
    Ok(ctx
        .query
        .modifiers
        .order_by
        .iter()
        .map(|key| expression::evaluate(ctx.query, key.expression, &table, &mut scratch))
        .collect())
}

/// Splits a union tree into leaf branches; each branch keeps the chain of
/// enclosing groups whose stages apply to it.
fn collect_branches<'a>(
    pattern: &'a GraphPattern,
    mut chain: Vec<&'a GraphPattern>,
    out: &mut Vec<Vec<&'a GraphPattern>>,
) {
    chain.push(pattern);
    if let Some(union) = &pattern.union {
        collect_branches(&union.0, chain.clone(), out);
        collect_branches(&union.1, chain, out);
    } else {
        out.push(chain);
    }
}

fn build_branch<'a>(
    ctx: &Rc<ExecContext<'a>>,
    blocks: Vec<&'a GraphPattern>,
    scope: &GraphScope,
    from_graphs: &Option<Rc<[String]>>,
    named_pool: &Rc<[String]>,
    materializer: &mut ServiceMaterializer,
) -> Result<Branch<'a>, EvaluationError> {
    let query = ctx.query;
    let mut stages: Vec<Box<dyn Scan + 'a>> = Vec::new();
    let mut residual_filters = Vec::new();
    let mut minus = Vec::new();
    for &block in &blocks {
        for values in &block.values {
            stages.push(Box::new(ValuesScan::new(Rc::clone(ctx), values)));
        }
        let plan = plan_group(
            query,
            &block.patterns,
            &block.filters,
            &FxHashSet::default(),
        );
        residual_filters.extend(plan.residual.iter().copied());
        let ordered = ordered_patterns(&block.patterns, &plan);
        let mut service_stages = Some(build_service_stages(ctx, block, materializer)?);
        let service_first =
            !block.services.is_empty() && plan::service_first(query, &block.patterns);
        if service_first {
            stages.extend(service_stages.take().unwrap_or_default());
        }
        if block.subqueries.len() == 1 && !block.patterns.is_empty() && block.services.is_empty()
        {
            // Subquery + local patterns fuse into the dedicated join scan.
            stages.push(Box::new(SubQueryJoinScan::new(
                Rc::clone(ctx),
                &block.subqueries[0],
                ordered,
                plan.filters_at,
                scope.clone(),
            )));
        } else {
            for sub in &block.subqueries {
                stages.push(Box::new(SubQueryScan::new(
                    Rc::clone(ctx),
                    sub,
                    scope.clone(),
                )));
            }
            if !block.patterns.is_empty() {
                let scan: Box<dyn Scan + 'a> = match from_graphs {
                    Some(graphs) => Box::new(CrossGraphMultiPatternScan::new(
                        Rc::clone(ctx),
                        ordered,
                        plan.filters_at,
                        Rc::clone(graphs),
                    )),
                    None => Box::new(MultiPatternScan::new(
                        Rc::clone(ctx),
                        ordered,
                        plan.filters_at,
                        scope.clone(),
                    )),
                };
                stages.push(scan);
            }
        }
        for clause in &block.graphs {
            match query.variable_name(clause.graph) {
                Some(variable) => {
                    stages.push(Box::new(VariableGraphScan::new(
                        Rc::clone(ctx),
                        variable.to_owned(),
                        &clause.pattern,
                        Rc::clone(named_pool),
                    )));
                }
                None => {
                    let graph = query.constant_lexical(clause.graph).unwrap_or_default();
                    stages.push(Box::new(FixedGraphScan::new(ctx, &clause.pattern, &graph)?));
                }
            }
        }
        if let Some(rest) = service_stages.take() {
            stages.extend(rest);
        }
        for minus_block in &block.minus {
            minus.push(materialize_minus(ctx, minus_block, scope)?);
        }
    }
    Ok(Branch {
        scan: Box::new(SequenceJoinScan::new(ctx.cancel.clone(), stages)),
        blocks,
        residual_filters,
        minus,
    })
}

fn build_service_stages<'a>(
    ctx: &Rc<ExecContext<'a>>,
    block: &'a GraphPattern,
    materializer: &mut ServiceMaterializer,
) -> Result<Vec<Box<dyn Scan + 'a>>, EvaluationError> {
    let mut stages: Vec<Box<dyn Scan + 'a>> = Vec::new();
    for clause in &block.services {
        let join_variables = plan::shared_variables(ctx.query, &clause.pattern, block);
        let result = materializer.fetch(ctx, clause, join_variables)?;
        if result.has_index() {
            stages.push(Box::new(IndexedServicePatternScan::new(result)));
        } else {
            stages.push(Box::new(ServicePatternScan::new(result)));
        }
    }
    Ok(stages)
}

/// Materializes a MINUS block's solutions with a local binding frame:
/// its core patterns, then its optionals, then exclusion by its own
/// nested MINUS blocks. `EXISTS` filters stay deferred to candidate time.
fn materialize_minus<'a>(
    ctx: &Rc<ExecContext<'a>>,
    block: &'a GraphPattern,
    scope: &GraphScope,
) -> Result<MinusEval<'a>, EvaluationError> {
    let mut nested = Vec::new();
    for inner in &block.minus {
        nested.push(materialize_minus(ctx, inner, scope)?);
    }
    let mut table = BindingTable::new(&ctx.limits);
    let mut scan = group_core_scan(ctx, block, scope)?;
    let mut rows = Vec::new();
    'rows: while scan.next(&mut table)? {
        ctx.cancel.check()?;
        for optional in &block.optionals {
            let checkpoint = table.checkpoint();
            let mut optional_scan = plain_group_scan(ctx, optional, scope)?;
            if !optional_scan.next(&mut table)? {
                table.truncate(checkpoint);
            }
        }
        for inner in &nested {
            // Inner exclusion removes the row from this block's results,
            // so the outer MINUS does not see it.
            if minus_excludes(ctx, inner, &table, scope)? {
                continue 'rows;
            }
        }
        ExecutionLimits::check(
            rows.len() + 1,
            ctx.limits.max_materialized_rows,
            "MINUS block rows",
        )?;
        rows.push(table.materialize());
    }
    Ok(MinusEval {
        rows,
        exists: &block.exists,
    })
}

/// SPARQL 1.1 §8.3 MINUS: a candidate is excluded iff some block solution
/// shares at least one variable with it and agrees on all shared ones.
fn minus_excludes(
    ctx: &Rc<ExecContext<'_>>,
    eval: &MinusEval<'_>,
    bindings: &BindingTable,
    scope: &GraphScope,
) -> Result<bool, EvaluationError> {
    'rows: for row in &eval.rows {
        let mut any_shared = false;
        for (name, value) in &row.pairs {
            if name.starts_with("_:") {
                continue;
            }
            if let Some(index) = bindings.find(name) {
                any_shared = true;
                if !bindings.value(index).same_term(value) {
                    continue 'rows;
                }
            }
        }
        if !any_shared {
            // Domain-disjoint solutions never exclude.
            continue;
        }
        if eval.exists.is_empty() {
            return Ok(true);
        }
        // EXISTS inside MINUS sees the combined outer + local bindings.
        let mut combined = BindingTable::new(&ctx.limits);
        for index in 0..bindings.len() {
            combined.bind(bindings.name_at(index), &bindings.value(index))?;
        }
        let mut compatible = true;
        for (name, value) in &row.pairs {
            if !combined.bind(name, value)? {
                compatible = false;
                break;
            }
        }
        if !compatible {
            continue;
        }
        let mut all_pass = true;
        for filter in eval.exists {
            let matched = exists_match(ctx, &filter.pattern, &mut combined, scope)?;
            if matched == filter.negated {
                all_pass = false;
                break;
            }
        }
        if all_pass {
            return Ok(true);
        }
    }
    Ok(false)
}

struct ExistsFrame {
    rows: Vec<MaterializedRow>,
    cursor: usize,
    checkpoint: usize,
}

/// `EXISTS { ... }` against the store with the outer solution as fixed
/// bindings.
///
/// Iterative by construction: an explicit frame stack bounded by the
/// pattern count, one materialized result list per frame. The cursor
/// advances within a frame, the frame count grows only on a successful
/// advance and shrinks only on exhaustion, so the loop terminates when
/// all patterns are satisfied or the stack empties.
pub(crate) fn exists_match(
    ctx: &Rc<ExecContext<'_>>,
    block: &GraphPattern,
    bindings: &mut BindingTable,
    scope: &GraphScope,
) -> Result<bool, EvaluationError> {
    let base = bindings.checkpoint();
    let patterns = &block.patterns;
    if patterns.is_empty() {
        let passes = block
            .filters
            .iter()
            .all(|span| ctx.filter_passes(*span, bindings));
        return Ok(passes);
    }
    let mut stack = vec![open_exists_frame(ctx, patterns[0], bindings, scope)?];
    loop {
        ctx.cancel.check()?;
        let Some(frame) = stack.last_mut() else {
            bindings.truncate(base);
            return Ok(false);
        };
        bindings.truncate(frame.checkpoint);
        if frame.cursor >= frame.rows.len() {
            stack.pop();
            continue;
        }
        let row = frame.rows[frame.cursor].clone();
        frame.cursor += 1;
        if !row.bind_into(bindings)? {
            continue;
        }
        if stack.len() == patterns.len() {
            if block
                .filters
                .iter()
                .all(|span| ctx.filter_passes(*span, bindings))
            {
                bindings.truncate(base);
                return Ok(true);
            }
            continue;
        }
        let next_index = stack.len();
        let frame = open_exists_frame(ctx, patterns[next_index], bindings, scope)?;
        stack.push(frame);
    }
}

/// Runs one pattern to exhaustion against the current bindings and
/// materializes each yield's new bindings as an owned row.
fn open_exists_frame(
    ctx: &Rc<ExecContext<'_>>,
    pattern: TriplePattern,
    bindings: &mut BindingTable,
    scope: &GraphScope,
) -> Result<ExistsFrame, EvaluationError> {
    let checkpoint = bindings.checkpoint();
    let mut scan = crate::scan::TriplePatternScan::new(Rc::clone(ctx), pattern, scope.clone());
    let mut rows = Vec::new();
    while scan.next(bindings)? {
        let mut row = MaterializedRow::default();
        for index in checkpoint..bindings.len() {
            row.pairs
                .push((bindings.name_at(index).to_owned(), bindings.value(index)));
        }
        ExecutionLimits::check(
            rows.len() + 1,
            ctx.limits.max_materialized_rows,
            "EXISTS frame rows",
        )?;
        rows.push(row);
    }
    bindings.truncate(checkpoint);
    Ok(ExistsFrame {
        rows,
        cursor: 0,
        checkpoint,
    })
}

/// Post-query `VALUES`: the candidate must be compatible with at least
/// one data row.
fn values_compatible(query: &Query, block: &ValuesBlock, bindings: &BindingTable) -> bool {
    block.rows.iter().any(|row| {
        block.variables.iter().zip(row).all(|(variable, value)| {
            let Some(term) = value else {
                return true; // UNDEF is compatible with anything.
            };
            let Some(name) = query.variable_name(*variable) else {
                return true;
            };
            match bindings.get_lexical(name) {
                Some(bound) => query.constant_lexical(*term).as_deref() == Some(bound.as_str()),
                None => true,
            }
        })
    })
}

struct AggAccum {
    function: AggregateFunction,
    distinct: bool,
    separator: String,
    seen: FxHashSet<u64>,
    count: u64,
    sum: Value,
    sum_failed: bool,
    min: Option<Value>,
    max: Option<Value>,
    sample: Option<Value>,
    concat: Option<String>,
}

impl AggAccum {
    fn new(item: &SelectItem) -> Self {
        let (function, distinct, separator) = match item {
            SelectItem::Aggregate {
                function,
                distinct,
                separator,
                ..
            } => (
                *function,
                *distinct,
                separator.clone().unwrap_or_else(|| " ".to_owned()),
            ),
            _ => (AggregateFunction::Count, false, " ".to_owned()),
        };
        Self {
            function,
            distinct,
            separator,
            seen: FxHashSet::default(),
            count: 0,
            sum: Value::Int(0),
            sum_failed: false,
            min: None,
            max: None,
            sample: None,
            concat: None,
        }
    }

    /// `COUNT(*)`: the row counts regardless of any binding.
    fn push_row(&mut self) {
        self.count += 1;
    }

    fn push(&mut self, value: Value) {
        if value.is_unbound() {
            return;
        }
        if self.distinct {
            let key = fnv1a64(value.lexical_form().unwrap_or_default().as_bytes());
            if !self.seen.insert(key) {
                return;
            }
        }
        self.count += 1;
        match self.function {
            AggregateFunction::Count => {}
            AggregateFunction::Sum | AggregateFunction::Avg => {
                let next = expression::arithmetic('+', &self.sum, &value);
                if next.is_unbound() {
                    self.sum_failed = true;
                } else {
                    self.sum = next;
                }
            }
            AggregateFunction::Min => {
                let replace = self.min.as_ref().is_none_or(|current| {
                    expression::compare_order(&value, current).is_lt()
                });
                if replace {
                    self.min = Some(value);
                }
            }
            AggregateFunction::Max => {
                let replace = self.max.as_ref().is_none_or(|current| {
                    expression::compare_order(&value, current).is_gt()
                });
                if replace {
                    self.max = Some(value);
                }
            }
            AggregateFunction::Sample => {
                if self.sample.is_none() {
                    self.sample = Some(value);
                }
            }
            AggregateFunction::GroupConcat => {
                let text = match &value {
                    Value::Str { text, .. } => text.clone(),
                    Value::Iri(iri) => iri.clone(),
                    Value::Int(i) => i.to_string(),
                    Value::Float(f) => f.to_string(),
                    Value::Bool(b) => if *b { "true" } else { "false" }.to_owned(),
                    Value::Unbound => return,
                };
                match &mut self.concat {
                    Some(concat) => {
                        concat.push_str(&self.separator);
                        concat.push_str(&text);
                    }
                    None => self.concat = Some(text),
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self.function {
            AggregateFunction::Count => Value::Int(self.count.min(i64::MAX as u64) as i64),
            AggregateFunction::Sum => {
                if self.sum_failed {
                    Value::Unbound
                } else {
                    self.sum
                }
            }
            AggregateFunction::Avg => {
                if self.sum_failed {
                    Value::Unbound
                } else if self.count == 0 {
                    Value::Int(0)
                } else {
                    expression::arithmetic('/', &self.sum, &Value::Int(self.count as i64))
                }
            }
            AggregateFunction::Min => self.min.unwrap_or(Value::Unbound),
            AggregateFunction::Max => self.max.unwrap_or(Value::Unbound),
            AggregateFunction::Sample => self.sample.unwrap_or(Value::Unbound),
            AggregateFunction::GroupConcat => Value::string(self.concat.unwrap_or_default()),
        }
    }
}

/// Instantiates the `CONSTRUCT` template per solution, renaming template
/// blank nodes per row and deduplicating emitted triples.
struct ConstructIter<'a> {
    ctx: Rc<ExecContext<'a>>,
    driver: Driver<'a>,
    buffer: VecDeque<Triple>,
    emitted: FxHashSet<u64>,
    row: u64,
}

impl ConstructIter<'_> {
    fn template_term(&self, pattern_term: crate::query::Term, solution: &QuerySolution) -> Option<String> {
        let query = self.ctx.query;
        match pattern_term.kind {
            crate::query::TermKind::Variable => {
                let name = query.variable_name(pattern_term)?;
                solution.get(name).and_then(Value::lexical_form)
            }
            crate::query::TermKind::BlankNode => {
                let label = query.term_text(pattern_term);
                Some(format!("_:c{}x{}", self.row, &label[2..]))
            }
            _ => query.constant_lexical(pattern_term),
        }
    }
}

impl Iterator for ConstructIter<'_> {
    type Item = Result<Triple, EvaluationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(triple) = self.buffer.pop_front() {
                return Some(Ok(triple));
            }
            let solution = match self.driver.next_solution()? {
                Ok(solution) => solution,
                Err(e) => return Some(Err(e)),
            };
            self.row += 1;
            let query = self.ctx.query;
            for pattern in &query.template {
                let Some(subject) = self.template_term(pattern.subject, &solution) else {
                    continue;
                };
                let Some(predicate) = self.template_term(pattern.predicate, &solution) else {
                    continue;
                };
                let Some(object) = self.template_term(pattern.object, &solution) else {
                    continue;
                };
                // Literal subjects and non-IRI predicates are illegal
                // triples; the row is skipped, not the query failed.
                if subject.starts_with('"') || !predicate.starts_with('<') {
                    continue;
                }
                let key = fnv1a64(format!("{subject}\u{1f}{predicate}\u{1f}{object}").as_bytes());
                if self.emitted.insert(key) {
                    self.buffer.push_back(Triple::new(subject, predicate, object));
                }
            }
        }
    }
}

/// Simple `DESCRIBE`: every store quad whose subject is one of the
/// description targets, each target described once.
struct DescribeIter<'a> {
    ctx: Rc<ExecContext<'a>>,
    driver: Driver<'a>,
    buffer: VecDeque<Triple>,
    described: FxHashSet<String>,
}

impl Iterator for DescribeIter<'_> {
    type Item = Result<Triple, EvaluationError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(triple) = self.buffer.pop_front() {
                return Some(Ok(triple));
            }
            let solution = match self.driver.next_solution()? {
                Ok(solution) => solution,
                Err(e) => return Some(Err(e)),
            };
            let query = self.ctx.query;
            let mut targets = Vec::new();
            if query.describe_targets.is_empty() {
                for (_, value) in &solution.pairs {
                    if let Some(lexical) = value.lexical_form() {
                        targets.push(lexical);
                    }
                }
            } else {
                for term in &query.describe_targets {
                    match query.variable_name(*term) {
                        Some(name) => {
                            if let Some(lexical) = solution.get(name).and_then(Value::lexical_form)
                            {
                                targets.push(lexical);
                            }
                        }
                        None => {
                            if let Some(lexical) = query.constant_lexical(*term) {
                                targets.push(lexical);
                            }
                        }
                    }
                }
            }
            for target in targets {
                if !target.starts_with('<') && !target.starts_with("_:") {
                    continue;
                }
                if !self.described.insert(target.clone()) {
                    continue;
                }
                for quad in self.ctx.store.quads(&target, "", "", "") {
                    match quad {
                        Ok(quad) => self.buffer.push_back(quad.into()),
                        Err(e) => return Some(Err(e.into())),
                    }
                }
            }
        }
    }
}
