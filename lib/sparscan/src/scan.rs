//! Scan operators: uniform pull iterators over quad index lookups.
//!
//! Every operator implements [`Scan`]: `next` either extends the shared
//! binding table and returns `true`, or restores the table to the
//! checkpoint it recorded on its first call and returns `false`. Between
//! yields an operator only touches entries at or above its checkpoint,
//! which makes plain table truncation sufficient for backtracking.

use crate::binding::BindingTable;
use crate::dataset::{QuadIter, QuadStore};
use crate::error::EvaluationError;
use crate::expression::{self, EvalScratch};
use crate::limits::{CancellationToken, ExecutionLimits};
use crate::query::{PathMode, Query, Span, Term, TriplePattern, ValuesBlock};
use rustc_hash::FxHashSet;
use std::cell::RefCell;
use std::rc::Rc;

/// Shared per-execution state every operator holds on to.
pub(crate) struct ExecContext<'a> {
    pub store: &'a dyn QuadStore,
    pub query: &'a Query,
    pub limits: ExecutionLimits,
    pub cancel: CancellationToken,
    pub scratch: RefCell<EvalScratch>,
}

impl<'a> ExecContext<'a> {
    pub fn new(
        store: &'a dyn QuadStore,
        query: &'a Query,
        limits: ExecutionLimits,
        cancel: CancellationToken,
    ) -> Rc<Self> {
        Rc::new(Self {
            store,
            query,
            limits,
            cancel,
            scratch: RefCell::new(EvalScratch::new()),
        })
    }

    pub fn filter_passes(&self, span: Span, bindings: &BindingTable) -> bool {
        expression::filter_passes(self.query, span, bindings, &mut self.scratch.borrow_mut())
    }
}

/// Which graphs a pattern lookup ranges over.
#[derive(Clone)]
pub(crate) enum GraphScope {
    /// All graphs, the default graph included.
    Any,
    /// One concrete graph (lexical `<...>` form).
    Fixed(Rc<str>),
    /// Each lookup independently loops over these graphs (`FROM` union).
    OneOf(Rc<[String]>),
}

/// The pull-iterator contract shared by all operators.
pub(crate) trait Scan {
    /// Advances to the next solution, binding into `bindings`.
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError>;

    /// Forgets all iteration state so the next `next` call re-opens the
    /// scan against the then-current bindings.
    fn reset(&mut self);
}

/// How one pattern position relates to the binding table.
enum Slot {
    /// Constant; the store already filtered on it.
    Fixed,
    /// Unbound variable to bind (or re-check) per quad.
    Var(String),
}

fn term_slot(query: &Query, term: Term, bindings: &BindingTable) -> (String, Slot) {
    if let Some(name) = query.variable_name(term) {
        if let Some(lexical) = bindings.get_lexical(name) {
            return (lexical, Slot::Fixed);
        }
        return (String::new(), Slot::Var(name.to_owned()));
    }
    match query.constant_lexical(term) {
        Some(lexical) => (lexical, Slot::Fixed),
        // An unresolvable constant (unknown prefix) can never match.
        None => (query.term_text(term).to_owned(), Slot::Fixed),
    }
}

enum PatternState<'a> {
    Direct {
        iter: QuadIter<'a>,
        /// Inverse paths swap subject and object at bind time.
        swap: bool,
    },
    /// Property-path results, fully materialized as `(start, end)` pairs.
    Buffered {
        pairs: Vec<(String, String)>,
        cursor: usize,
    },
}

/// Scans one triple pattern, including its property-path modes.
pub(crate) struct TriplePatternScan<'a> {
    ctx: Rc<ExecContext<'a>>,
    pattern: TriplePattern,
    scope: GraphScope,
    state: Option<PatternState<'a>>,
    slots: [Slot; 3],
    checkpoint: usize,
    done: bool,
}

impl<'a> TriplePatternScan<'a> {
    pub fn new(ctx: Rc<ExecContext<'a>>, pattern: TriplePattern, scope: GraphScope) -> Self {
        Self {
            ctx,
            pattern,
            scope,
            state: None,
            slots: [Slot::Fixed, Slot::Fixed, Slot::Fixed],
            checkpoint: 0,
            done: false,
        }
    }

    fn lookup(&self, subject: &str, predicate: &str, object: &str) -> QuadIter<'a> {
        let store = self.ctx.store;
        match &self.scope {
            GraphScope::Any => store.quads(subject, predicate, object, ""),
            GraphScope::Fixed(graph) => store.quads(subject, predicate, object, graph),
            GraphScope::OneOf(graphs) => {
                let graphs = Rc::clone(graphs);
                let (subject, predicate, object) =
                    (subject.to_owned(), predicate.to_owned(), object.to_owned());
                Box::new((0..graphs.len()).flat_map(move |i| {
                    store.quads(&subject, &predicate, &object, &graphs[i])
                }))
            }
        }
    }

    fn open(&mut self, bindings: &BindingTable) -> Result<(), EvaluationError> {
        let query = self.ctx.query;
        let (subject, s_slot) = term_slot(query, self.pattern.subject, bindings);
        let (predicate, p_slot) = term_slot(query, self.pattern.predicate, bindings);
        let (object, o_slot) = term_slot(query, self.pattern.object, bindings);
        self.slots = [s_slot, p_slot, o_slot];
        self.state = Some(match self.pattern.path {
            PathMode::Direct => PatternState::Direct {
                iter: self.lookup(&subject, &predicate, &object),
                swap: false,
            },
            PathMode::Inverse => PatternState::Direct {
                iter: self.lookup(&object, &predicate, &subject),
                swap: true,
            },
            PathMode::ZeroOrOne => PatternState::Buffered {
                pairs: self.zero_or_one_pairs(&subject, &predicate, &object)?,
                cursor: 0,
            },
            PathMode::ZeroOrMore | PathMode::OneOrMore => PatternState::Buffered {
                pairs: self.closure_pairs(
                    &subject,
                    &predicate,
                    self.pattern.path == PathMode::ZeroOrMore,
                )?,
                cursor: 0,
            },
        });
        Ok(())
    }

    /// `p?`: the raw matches plus one reflexive emission for a concrete
    /// start node.
    fn zero_or_one_pairs(
        &self,
        subject: &str,
        predicate: &str,
        object: &str,
    ) -> Result<Vec<(String, String)>, EvaluationError> {
        let mut pairs = Vec::new();
        for quad in self.lookup(subject, predicate, object) {
            let quad = quad?;
            pairs.push((quad.subject, quad.object));
        }
        if !subject.is_empty() {
            let reflexive = (subject.to_owned(), subject.to_owned());
            if !pairs.contains(&reflexive) {
                pairs.push(reflexive);
            }
        }
        Ok(pairs)
    }

    /// `p*` / `p+`: breadth-first closure with a monotone visited set.
    ///
    /// An unbound subject seeds one traversal per distinct subject of the
    /// predicate; the zero-length emission then applies per start node.
    fn closure_pairs(
        &self,
        subject: &str,
        predicate: &str,
        reflexive: bool,
    ) -> Result<Vec<(String, String)>, EvaluationError> {
        let mut starts = Vec::new();
        if subject.is_empty() {
            let mut seen = FxHashSet::default();
            for quad in self.lookup("", predicate, "") {
                let quad = quad?;
                if seen.insert(quad.subject.clone()) {
                    starts.push(quad.subject);
                }
            }
        } else {
            starts.push(subject.to_owned());
        }
        let mut pairs = Vec::new();
        let mut emitted = FxHashSet::default();
        for start in starts {
            self.ctx.cancel.check()?;
            if reflexive && emitted.insert((start.clone(), start.clone())) {
                pairs.push((start.clone(), start.clone()));
            }
            let mut visited = FxHashSet::default();
            visited.insert(start.clone());
            let mut frontier = vec![start.clone()];
            while let Some(node) = frontier.pop() {
                self.ctx.cancel.check()?;
                ExecutionLimits::check(
                    visited.len(),
                    self.ctx.limits.max_path_nodes,
                    "property path visited nodes",
                )?;
                for quad in self.lookup(&node, predicate, "") {
                    let target = quad?.object;
                    if emitted.insert((start.clone(), target.clone())) {
                        pairs.push((start.clone(), target.clone()));
                    }
                    if visited.insert(target.clone()) {
                        frontier.push(target);
                    }
                }
            }
        }
        Ok(pairs)
    }
}

fn bind_slots(
    slots: &[Slot; 3],
    bindings: &mut BindingTable,
    components: [&str; 3],
) -> Result<bool, EvaluationError> {
    for (slot, component) in slots.iter().zip(components) {
        match slot {
            Slot::Fixed => {}
            Slot::Var(name) => {
                if component.is_empty() || !bindings.bind_lexical(name, component)? {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Constant or already-bound endpoints filter buffered path pairs; the
/// traversal only pre-filtered on the start side.
fn endpoints_match(
    pattern: TriplePattern,
    query: &Query,
    bindings: &BindingTable,
    start: &str,
    end: &str,
) -> bool {
    let expected = |term: Term| -> Option<String> {
        if let Some(name) = query.variable_name(term) {
            bindings.get_lexical(name)
        } else {
            query.constant_lexical(term)
        }
    };
    if let Some(required) = expected(pattern.subject) {
        if required != start {
            return false;
        }
    }
    if let Some(required) = expected(pattern.object) {
        if required != end {
            return false;
        }
    }
    true
}

impl Scan for TriplePatternScan<'_> {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        if self.done {
            return Ok(false);
        }
        self.ctx.cancel.check()?;
        if self.state.is_none() {
            self.checkpoint = bindings.checkpoint();
            self.open(bindings)?;
        } else {
            bindings.truncate(self.checkpoint);
        }
        let Some(state) = &mut self.state else {
            return Ok(false);
        };
        match state {
            PatternState::Direct { iter, swap } => {
                let swap = *swap;
                for quad in iter.by_ref() {
                    let quad = quad?;
                    let components = if swap {
                        [quad.object.as_str(), quad.predicate.as_str(), quad.subject.as_str()]
                    } else {
                        [quad.subject.as_str(), quad.predicate.as_str(), quad.object.as_str()]
                    };
                    if bind_slots(&self.slots, bindings, components)? {
                        return Ok(true);
                    }
                    bindings.truncate(self.checkpoint);
                }
            }
            PatternState::Buffered { pairs, cursor } => {
                while *cursor < pairs.len() {
                    let (start, end) = &pairs[*cursor];
                    *cursor += 1;
                    if endpoints_match(self.pattern, self.ctx.query, bindings, start, end) {
                        if bind_slots(&self.slots, bindings, [start, "", end])? {
                            return Ok(true);
                        }
                        bindings.truncate(self.checkpoint);
                    }
                }
            }
        }
        self.done = true;
        bindings.truncate(self.checkpoint);
        Ok(false)
    }

    fn reset(&mut self) {
        self.state = None;
        self.done = false;
    }
}

/// How deep one nested-loop level group goes; longer required-pattern
/// lists are evaluated as a chain of groups.
pub(crate) const MAX_JOIN_DEPTH: usize = 4;

struct JoinLevel<'a> {
    scan: TriplePatternScan<'a>,
    /// Filters the planner pushed down to this level.
    filters: Vec<Span>,
}

/// Fixed-depth nested-loop join over triple patterns.
///
/// Union mode carries a second ordered pattern list: when the first list is
/// exhausted the selector swaps and iteration starts over, preserving
/// first-branch-then-second-branch order.
pub(crate) struct MultiPatternScan<'a> {
    ctx: Rc<ExecContext<'a>>,
    patterns: Vec<TriplePattern>,
    filters_at: Vec<Vec<Span>>,
    secondary: Option<Vec<TriplePattern>>,
    on_secondary: bool,
    scope: GraphScope,
    levels: Vec<JoinLevel<'a>>,
    /// Patterns beyond [`MAX_JOIN_DEPTH`], evaluated as a chained deeper
    /// group re-opened per yield of this one.
    tail: Option<Box<MultiPatternScan<'a>>>,
    tail_checkpoint: usize,
    tail_open: bool,
    started: bool,
    done: bool,
}

impl<'a> MultiPatternScan<'a> {
    pub fn new(
        ctx: Rc<ExecContext<'a>>,
        patterns: Vec<TriplePattern>,
        filters_at: Vec<Vec<Span>>,
        scope: GraphScope,
    ) -> Self {
        let mut patterns = patterns;
        let mut filters_at = filters_at;
        filters_at.resize(patterns.len(), Vec::new());
        let (tail_patterns, tail_filters) = if patterns.len() > MAX_JOIN_DEPTH {
            (
                patterns.split_off(MAX_JOIN_DEPTH),
                filters_at.split_off(MAX_JOIN_DEPTH),
            )
        } else {
            (Vec::new(), Vec::new())
        };
        let tail = if tail_patterns.is_empty() {
            None
        } else {
            Some(Box::new(Self::new(
                Rc::clone(&ctx),
                tail_patterns,
                tail_filters,
                scope.clone(),
            )))
        };
        Self {
            ctx,
            patterns,
            filters_at,
            secondary: None,
            on_secondary: false,
            scope,
            levels: Vec::new(),
            tail,
            tail_checkpoint: 0,
            tail_open: false,
            started: false,
            done: false,
        }
    }

    /// Union mode: `first` then `second`, each a plain ordered list.
    pub fn union(
        ctx: Rc<ExecContext<'a>>,
        first: Vec<TriplePattern>,
        second: Vec<TriplePattern>,
        scope: GraphScope,
    ) -> Self {
        let mut scan = Self::new(ctx, first, Vec::new(), scope);
        scan.secondary = Some(second);
        scan
    }

    fn active_patterns(&self) -> &[TriplePattern] {
        if self.on_secondary {
            self.secondary.as_deref().unwrap_or(&self.patterns)
        } else {
            &self.patterns
        }
    }

    fn level_filters(&self, level: usize) -> Vec<Span> {
        if self.on_secondary {
            Vec::new()
        } else {
            self.filters_at.get(level).cloned().unwrap_or_default()
        }
    }

    /// Advances the level stack until the deepest level yields; classic
    /// open/rollback/ascend control flow.
    fn advance_levels(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        let depth = self.active_patterns().len();
        if depth == 0 {
            // An empty group matches exactly once.
            let first = self.levels.is_empty() && !self.started;
            return Ok(first);
        }
        let mut level = if self.levels.is_empty() { 0 } else { self.levels.len() - 1 };
        loop {
            self.ctx.cancel.check()?;
            if self.levels.len() <= level {
                let pattern = self.active_patterns()[level];
                self.levels.push(JoinLevel {
                    scan: TriplePatternScan::new(Rc::clone(&self.ctx), pattern, self.scope.clone()),
                    filters: self.level_filters(level),
                });
            }
            let yielded = self.levels[level].scan.next(bindings)?;
            if yielded {
                let passes = self.levels[level]
                    .filters
                    .iter()
                    .all(|span| self.ctx.filter_passes(*span, bindings));
                if !passes {
                    continue;
                }
                if level + 1 == depth {
                    return Ok(true);
                }
                level += 1;
            } else {
                let exhausted = self.levels.pop().is_some();
                debug_assert!(exhausted, "level stack underflow");
                if level == 0 {
                    return Ok(false);
                }
                level -= 1;
            }
        }
    }
}

impl Scan for MultiPatternScan<'_> {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        if self.done {
            return Ok(false);
        }
        loop {
            self.ctx.cancel.check()?;
            // A yielding tail extends the currently advanced head row.
            if self.tail_open {
                if let Some(tail) = &mut self.tail {
                    if tail.next(bindings)? {
                        return Ok(true);
                    }
                    tail.reset();
                    self.tail_open = false;
                    bindings.truncate(self.tail_checkpoint);
                }
            }
            let head_yielded = self.advance_levels(bindings)?;
            self.started = true;
            if head_yielded {
                if self.tail.is_some() {
                    self.tail_checkpoint = bindings.checkpoint();
                    self.tail_open = true;
                    continue;
                }
                return Ok(true);
            }
            if !self.on_secondary && self.secondary.is_some() {
                // Swap the pattern selector to the second ordered list.
                self.on_secondary = true;
                self.started = false;
                self.levels.clear();
                continue;
            }
            self.done = true;
            return Ok(false);
        }
    }

    fn reset(&mut self) {
        self.levels.clear();
        self.on_secondary = false;
        self.started = false;
        self.done = false;
        self.tail_open = false;
        if let Some(tail) = &mut self.tail {
            tail.reset();
        }
    }
}

/// `FROM` cross-graph join: every pattern level independently loops over
/// the dataset's graphs, so one solution may draw pattern `i` from graph A
/// and pattern `j` from graph B.
pub(crate) struct CrossGraphMultiPatternScan<'a> {
    inner: MultiPatternScan<'a>,
}

impl<'a> CrossGraphMultiPatternScan<'a> {
    pub fn new(
        ctx: Rc<ExecContext<'a>>,
        patterns: Vec<TriplePattern>,
        filters_at: Vec<Vec<Span>>,
        graphs: Rc<[String]>,
    ) -> Self {
        Self {
            inner: MultiPatternScan::new(ctx, patterns, filters_at, GraphScope::OneOf(graphs)),
        }
    }
}

impl Scan for CrossGraphMultiPatternScan<'_> {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        self.inner.next(bindings)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// Generalized nested-loop join over heterogeneous operator stages
/// (pattern groups, graph scans, subqueries, service scans, VALUES).
pub(crate) struct SequenceJoinScan<'a> {
    cancel: CancellationToken,
    stages: Vec<Box<dyn Scan + 'a>>,
    open: Vec<bool>,
    started: bool,
    done: bool,
}

impl<'a> SequenceJoinScan<'a> {
    pub fn new(cancel: CancellationToken, stages: Vec<Box<dyn Scan + 'a>>) -> Self {
        let open = vec![false; stages.len()];
        Self {
            cancel,
            stages,
            open,
            started: false,
            done: false,
        }
    }
}

impl Scan for SequenceJoinScan<'_> {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        if self.done {
            return Ok(false);
        }
        if self.stages.is_empty() {
            self.done = true;
            return Ok(!self.started);
        }
        let mut level = if self.started { self.stages.len() - 1 } else { 0 };
        self.started = true;
        loop {
            self.cancel.check()?;
            if !self.open[level] {
                self.stages[level].reset();
                self.open[level] = true;
            }
            if self.stages[level].next(bindings)? {
                if level + 1 == self.stages.len() {
                    return Ok(true);
                }
                level += 1;
            } else {
                self.open[level] = false;
                if level == 0 {
                    self.done = true;
                    return Ok(false);
                }
                level -= 1;
            }
        }
    }

    fn reset(&mut self) {
        for (stage, open) in self.stages.iter_mut().zip(&mut self.open) {
            stage.reset();
            *open = false;
        }
        self.started = false;
        self.done = false;
    }
}

/// Joins an inline `VALUES` block: each compatible data row extends the
/// current bindings.
pub(crate) struct ValuesScan<'a> {
    ctx: Rc<ExecContext<'a>>,
    block: &'a ValuesBlock,
    cursor: usize,
    checkpoint: usize,
    started: bool,
}

impl<'a> ValuesScan<'a> {
    pub fn new(ctx: Rc<ExecContext<'a>>, block: &'a ValuesBlock) -> Self {
        Self {
            ctx,
            block,
            cursor: 0,
            checkpoint: 0,
            started: false,
        }
    }
}

impl Scan for ValuesScan<'_> {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        if !self.started {
            self.checkpoint = bindings.checkpoint();
            self.started = true;
        } else {
            bindings.truncate(self.checkpoint);
        }
        let query = self.ctx.query;
        'rows: while self.cursor < self.block.rows.len() {
            self.ctx.cancel.check()?;
            let row = &self.block.rows[self.cursor];
            self.cursor += 1;
            for (variable, value) in self.block.variables.iter().zip(row) {
                let Some(term) = value else {
                    continue; // UNDEF leaves the variable as it is.
                };
                let Some(name) = query.variable_name(*variable) else {
                    continue;
                };
                let Some(lexical) = query.constant_lexical(*term) else {
                    continue;
                };
                if !bindings.bind_lexical(name, &lexical)? {
                    bindings.truncate(self.checkpoint);
                    continue 'rows;
                }
            }
            return Ok(true);
        }
        bindings.truncate(self.checkpoint);
        Ok(false)
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.started = false;
    }
}

/// `{ A } UNION { B }` over arbitrary branch scans, first branch then
/// second.
pub(crate) struct UnionGroupScan<'a> {
    first: Box<dyn Scan + 'a>,
    second: Box<dyn Scan + 'a>,
    on_second: bool,
    done: bool,
}

impl Scan for UnionGroupScan<'_> {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        if self.done {
            return Ok(false);
        }
        if !self.on_second {
            if self.first.next(bindings)? {
                return Ok(true);
            }
            self.on_second = true;
        }
        if self.second.next(bindings)? {
            return Ok(true);
        }
        self.done = true;
        Ok(false)
    }

    fn reset(&mut self) {
        self.first.reset();
        self.second.reset();
        self.on_second = false;
        self.done = false;
    }
}

/// Builds the scan for a group that only carries required patterns,
/// filters, inline `VALUES` and `UNION` branches (the shape `OPTIONAL`,
/// `MINUS`, `GRAPH` and subquery bodies take). Anything richer belongs to
/// the result driver.
pub(crate) fn plain_group_scan<'a>(
    ctx: &Rc<ExecContext<'a>>,
    group: &'a crate::query::GraphPattern,
    scope: &GraphScope,
) -> Result<Box<dyn Scan + 'a>, EvaluationError> {
    if !group.graphs.is_empty()
        || !group.services.is_empty()
        || !group.subqueries.is_empty()
        || !group.optionals.is_empty()
        || !group.minus.is_empty()
        || !group.exists.is_empty()
        || !group.binds.is_empty()
    {
        return Err(EvaluationError::Unsupported(
            "nested group is too complex for this position".into(),
        ));
    }
    group_core_scan(ctx, group, scope)
}

/// Like [`plain_group_scan`] but silently ignores the members the caller
/// evaluates itself (the MINUS materializer handles optionals and nested
/// MINUS blocks on its own).
pub(crate) fn group_core_scan<'a>(
    ctx: &Rc<ExecContext<'a>>,
    group: &'a crate::query::GraphPattern,
    scope: &GraphScope,
) -> Result<Box<dyn Scan + 'a>, EvaluationError> {
    if let Some(union) = &group.union {
        let scan = UnionGroupScan {
            first: group_core_scan(ctx, &union.0, scope)?,
            second: group_core_scan(ctx, &union.1, scope)?,
            on_second: false,
            done: false,
        };
        if group.patterns.is_empty() && group.filters.is_empty() && group.values.is_empty() {
            return Ok(Box::new(scan));
        }
        let mut stages: Vec<Box<dyn Scan + 'a>> = vec![Box::new(scan)];
        stages.push(plain_pattern_stage(ctx, group, scope)?);
        return Ok(Box::new(SequenceJoinScan::new(ctx.cancel.clone(), stages)));
    }
    if group.values.is_empty() {
        return plain_pattern_stage(ctx, group, scope);
    }
    let mut stages: Vec<Box<dyn Scan + 'a>> = group
        .values
        .iter()
        .map(|block| Box::new(ValuesScan::new(Rc::clone(ctx), block)) as Box<dyn Scan + 'a>)
        .collect();
    stages.push(plain_pattern_stage(ctx, group, scope)?);
    Ok(Box::new(SequenceJoinScan::new(ctx.cancel.clone(), stages)))
}

/// The planned pattern join of a group with its filters attached.
fn plain_pattern_stage<'a>(
    ctx: &Rc<ExecContext<'a>>,
    group: &'a crate::query::GraphPattern,
    scope: &GraphScope,
) -> Result<Box<dyn Scan + 'a>, EvaluationError> {
    let plan = crate::plan::plan_group(
        ctx.query,
        &group.patterns,
        &group.filters,
        &rustc_hash::FxHashSet::default(),
    );
    let ordered = crate::plan::ordered_patterns(&group.patterns, &plan);
    let scan = MultiPatternScan::new(
        Rc::clone(ctx),
        ordered,
        plan.filters_at,
        scope.clone(),
    );
    if plan.residual.is_empty() {
        Ok(Box::new(scan))
    } else {
        Ok(Box::new(FilteredScan::new(
            Rc::clone(ctx),
            Box::new(scan),
            plan.residual,
        )))
    }
}

/// Wraps a scan with residual filters that could not be pushed into a
/// specific join level.
pub(crate) struct FilteredScan<'a> {
    ctx: Rc<ExecContext<'a>>,
    inner: Box<dyn Scan + 'a>,
    filters: Vec<Span>,
}

impl<'a> FilteredScan<'a> {
    pub fn new(ctx: Rc<ExecContext<'a>>, inner: Box<dyn Scan + 'a>, filters: Vec<Span>) -> Self {
        Self { ctx, inner, filters }
    }
}

impl Scan for FilteredScan<'_> {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        while self.inner.next(bindings)? {
            if self
                .filters
                .iter()
                .all(|span| self.ctx.filter_passes(*span, bindings))
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryKind, SourceBuffer};
    use quadmem::{MemoryQuadStore, Quad};

    fn store_with(triples: &[(&str, &str, &str)]) -> MemoryQuadStore {
        let store = MemoryQuadStore::new();
        let mut batch = store.batch().unwrap();
        for (s, p, o) in triples {
            batch.insert(Quad::triple(*s, *p, *o));
        }
        batch.commit().unwrap();
        store
    }

    fn context<'a>(store: &'a MemoryQuadStore, query: &'a Query) -> Rc<ExecContext<'a>> {
        ExecContext::new(
            store,
            query,
            ExecutionLimits::default(),
            CancellationToken::new(),
        )
    }

    fn drain(scan: &mut dyn Scan, bindings: &mut BindingTable) -> Vec<Vec<(String, String)>> {
        let mut rows = Vec::new();
        while scan.next(bindings).unwrap() {
            rows.push(
                (0..bindings.len())
                    .map(|i| (bindings.name_at(i).to_owned(), bindings.lexical(i)))
                    .collect(),
            );
        }
        rows
    }

    #[test]
    fn single_pattern_scan_binds_variables() {
        let store = store_with(&[
            ("<http://e/a>", "<http://e/knows>", "<http://e/b>"),
            ("<http://e/b>", "<http://e/knows>", "<http://e/c>"),
            ("<http://e/a>", "<http://e/age>", "\"30\""),
        ]);
        let mut buffer = SourceBuffer::new();
        let pattern = buffer.push_pattern("?x", "<http://e/knows>", "?y");
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let mut bindings = BindingTable::new(&ctx.limits);
        let mut scan = TriplePatternScan::new(Rc::clone(&ctx), pattern, GraphScope::Any);
        let rows = drain(&mut scan, &mut bindings);
        assert_eq!(rows.len(), 2);
        assert!(bindings.is_empty());
    }

    #[test]
    fn join_consistency_on_shared_variable() {
        let store = store_with(&[
            ("<http://e/a>", "<http://e/knows>", "<http://e/b>"),
            ("<http://e/b>", "<http://e/knows>", "<http://e/c>"),
            ("<http://e/a>", "<http://e/age>", "\"30\""),
        ]);
        let mut buffer = SourceBuffer::new();
        let first = buffer.push_pattern("?x", "<http://e/knows>", "?y");
        let second = buffer.push_pattern("?y", "<http://e/knows>", "?z");
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let mut bindings = BindingTable::new(&ctx.limits);
        let mut scan = MultiPatternScan::new(
            Rc::clone(&ctx),
            vec![first, second],
            Vec::new(),
            GraphScope::Any,
        );
        let rows = drain(&mut scan, &mut bindings);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert!(row.contains(&("x".to_owned(), "<http://e/a>".to_owned())));
        assert!(row.contains(&("y".to_owned(), "<http://e/b>".to_owned())));
        assert!(row.contains(&("z".to_owned(), "<http://e/c>".to_owned())));
    }

    #[test]
    fn deep_groups_chain_beyond_the_depth_limit() {
        let store = store_with(&[
            ("<http://e/n1>", "<http://e/next>", "<http://e/n2>"),
            ("<http://e/n2>", "<http://e/next>", "<http://e/n3>"),
            ("<http://e/n3>", "<http://e/next>", "<http://e/n4>"),
            ("<http://e/n4>", "<http://e/next>", "<http://e/n5>"),
            ("<http://e/n5>", "<http://e/next>", "<http://e/n6>"),
            ("<http://e/n6>", "<http://e/next>", "<http://e/n7>"),
        ]);
        let mut buffer = SourceBuffer::new();
        let patterns: Vec<_> = (0..6)
            .map(|i| {
                buffer.push_pattern(
                    &format!("?v{i}"),
                    "<http://e/next>",
                    &format!("?v{}", i + 1),
                )
            })
            .collect();
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let mut bindings = BindingTable::new(&ctx.limits);
        let mut scan =
            MultiPatternScan::new(Rc::clone(&ctx), patterns, Vec::new(), GraphScope::Any);
        let rows = drain(&mut scan, &mut bindings);
        // Only the full chain n1..n7 satisfies all six levels.
        assert_eq!(rows.len(), 1);
        assert!(rows[0].contains(&("v6".to_owned(), "<http://e/n7>".to_owned())));
    }

    #[test]
    fn one_or_more_path_is_cycle_safe() {
        let store = store_with(&[
            ("<http://e/a>", "<http://e/r>", "<http://e/b>"),
            ("<http://e/b>", "<http://e/r>", "<http://e/c>"),
            ("<http://e/c>", "<http://e/r>", "<http://e/a>"),
        ]);
        let mut buffer = SourceBuffer::new();
        let pattern =
            buffer.push_path_pattern("<http://e/a>", "<http://e/r>", "?end", PathMode::OneOrMore);
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let mut bindings = BindingTable::new(&ctx.limits);
        let mut scan = TriplePatternScan::new(Rc::clone(&ctx), pattern, GraphScope::Any);
        let mut ends: Vec<String> = drain(&mut scan, &mut bindings)
            .into_iter()
            .map(|row| row[0].1.clone())
            .collect();
        ends.sort();
        // The cycle brings <a> back exactly once; no node repeats.
        assert_eq!(ends, vec!["<http://e/a>", "<http://e/b>", "<http://e/c>"]);
    }

    #[test]
    fn zero_or_more_emits_reflexive_once() {
        let store = store_with(&[
            ("<http://e/a>", "<http://e/r>", "<http://e/b>"),
            ("<http://e/b>", "<http://e/r>", "<http://e/c>"),
        ]);
        let mut buffer = SourceBuffer::new();
        let pattern =
            buffer.push_path_pattern("<http://e/a>", "<http://e/r>", "?end", PathMode::ZeroOrMore);
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let mut bindings = BindingTable::new(&ctx.limits);
        let mut scan = TriplePatternScan::new(Rc::clone(&ctx), pattern, GraphScope::Any);
        let mut ends: Vec<String> = drain(&mut scan, &mut bindings)
            .into_iter()
            .map(|row| row[0].1.clone())
            .collect();
        ends.sort();
        assert_eq!(ends, vec!["<http://e/a>", "<http://e/b>", "<http://e/c>"]);
    }

    #[test]
    fn inverse_path_swaps_endpoints() {
        let store = store_with(&[("<http://e/a>", "<http://e/r>", "<http://e/b>")]);
        let mut buffer = SourceBuffer::new();
        let pattern =
            buffer.push_path_pattern("?who", "<http://e/r>", "<http://e/a>", PathMode::Inverse);
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let mut bindings = BindingTable::new(&ctx.limits);
        let mut scan = TriplePatternScan::new(Rc::clone(&ctx), pattern, GraphScope::Any);
        let rows = drain(&mut scan, &mut bindings);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], ("who".to_owned(), "<http://e/b>".to_owned()));
    }

    #[test]
    fn zero_or_one_path() {
        let store = store_with(&[("<http://e/a>", "<http://e/r>", "<http://e/b>")]);
        let mut buffer = SourceBuffer::new();
        let pattern =
            buffer.push_path_pattern("<http://e/a>", "<http://e/r>", "?end", PathMode::ZeroOrOne);
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let mut bindings = BindingTable::new(&ctx.limits);
        let mut scan = TriplePatternScan::new(Rc::clone(&ctx), pattern, GraphScope::Any);
        let mut ends: Vec<String> = drain(&mut scan, &mut bindings)
            .into_iter()
            .map(|row| row[0].1.clone())
            .collect();
        ends.sort();
        assert_eq!(ends, vec!["<http://e/a>", "<http://e/b>"]);
    }

    #[test]
    fn union_mode_preserves_branch_order() {
        let store = store_with(&[
            ("<http://e/a>", "<http://e/p>", "\"1\""),
            ("<http://e/b>", "<http://e/q>", "\"2\""),
        ]);
        let mut buffer = SourceBuffer::new();
        let first = buffer.push_pattern("?s", "<http://e/p>", "?v");
        let second = buffer.push_pattern("?s", "<http://e/q>", "?v");
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let mut bindings = BindingTable::new(&ctx.limits);
        let mut scan =
            MultiPatternScan::union(Rc::clone(&ctx), vec![first], vec![second], GraphScope::Any);
        let rows = drain(&mut scan, &mut bindings);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0].1, "<http://e/a>");
        assert_eq!(rows[1][0].1, "<http://e/b>");
    }

    #[test]
    fn cancellation_stops_scans() {
        let store = store_with(&[("<http://e/a>", "<http://e/p>", "\"1\"")]);
        let mut buffer = SourceBuffer::new();
        let pattern = buffer.push_pattern("?s", "?p", "?o");
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let mut bindings = BindingTable::new(&ctx.limits);
        let mut scan = TriplePatternScan::new(Rc::clone(&ctx), pattern, GraphScope::Any);
        ctx.cancel.cancel();
        assert!(matches!(
            scan.next(&mut bindings),
            Err(EvaluationError::Cancelled)
        ));
    }
}
