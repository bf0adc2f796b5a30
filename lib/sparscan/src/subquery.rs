//! Nested `SELECT` evaluation.

use crate::binding::{BindingTable, MaterializedRow};
use crate::error::EvaluationError;
use crate::limits::ExecutionLimits;
use crate::query::{fnv1a64, SelectItem, SubQuery, TriplePattern};
use crate::scan::{plain_group_scan, ExecContext, GraphScope, MultiPatternScan, Scan};
use rustc_hash::FxHashSet;
use std::rc::Rc;

/// Evaluates the subquery bottom-up into owned projected rows.
///
/// A fresh binding table (and with it a fresh string arena) backs every
/// invocation, so no inner value can outlive the materialized copies.
pub(crate) fn materialize_subquery<'a>(
    ctx: &Rc<ExecContext<'a>>,
    sub: &'a SubQuery,
    scope: &GraphScope,
) -> Result<Vec<MaterializedRow>, EvaluationError> {
    let mut inner = BindingTable::new(&ctx.limits);
    let mut scan = plain_group_scan(ctx, &sub.pattern, scope)?;
    let mut rows = Vec::new();
    let mut seen = FxHashSet::default();
    let mut skipped = 0u64;
    while scan.next(&mut inner)? {
        ctx.cancel.check()?;
        let row = project_row(ctx, sub, &inner)?;
        if sub.select.distinct {
            let mut key = String::new();
            for (name, value) in &row.pairs {
                key.push_str(name);
                key.push('\u{1f}');
                key.push_str(&value.lexical_form().unwrap_or_default());
                key.push('\u{1f}');
            }
            if !seen.insert(fnv1a64(key.as_bytes())) {
                continue;
            }
        }
        if skipped < sub.offset {
            skipped += 1;
            continue;
        }
        if let Some(limit) = sub.limit {
            if rows.len() as u64 >= limit {
                break;
            }
        }
        ExecutionLimits::check(
            rows.len() + 1,
            ctx.limits.max_materialized_rows,
            "subquery result rows",
        )?;
        rows.push(row);
    }
    Ok(rows)
}

fn project_row(
    ctx: &Rc<ExecContext<'_>>,
    sub: &SubQuery,
    inner: &BindingTable,
) -> Result<MaterializedRow, EvaluationError> {
    if sub.select.items.is_empty() {
        // `SELECT *`: every named variable; blank-node placeholders stay
        // local to the subquery.
        let mut row = MaterializedRow::default();
        for index in 0..inner.len() {
            let name = inner.name_at(index);
            if !name.starts_with("_:") {
                row.pairs.push((name.to_owned(), inner.value(index)));
            }
        }
        return Ok(row);
    }
    let mut row = MaterializedRow::default();
    for item in &sub.select.items {
        match item {
            SelectItem::Variable(term) => {
                let Some(name) = ctx.query.variable_name(*term) else {
                    continue;
                };
                let value = inner.get(name);
                if !value.is_unbound() {
                    row.pairs.push((name.to_owned(), value));
                }
            }
            SelectItem::Expression { .. } | SelectItem::Aggregate { .. } => {
                return Err(EvaluationError::Unsupported(
                    "subqueries project plain variables".into(),
                ));
            }
        }
    }
    Ok(row)
}

/// Projects pre-materialized subquery rows into the outer binding table;
/// row-by-row, with the ordinary consistency check as the join predicate.
pub(crate) struct SubQueryScan<'a> {
    ctx: Rc<ExecContext<'a>>,
    sub: &'a SubQuery,
    scope: GraphScope,
    rows: Option<Rc<Vec<MaterializedRow>>>,
    cursor: usize,
    checkpoint: usize,
    started: bool,
}

impl<'a> SubQueryScan<'a> {
    pub fn new(ctx: Rc<ExecContext<'a>>, sub: &'a SubQuery, scope: GraphScope) -> Self {
        Self {
            ctx,
            sub,
            scope,
            rows: None,
            cursor: 0,
            checkpoint: 0,
            started: false,
        }
    }
}

impl Scan for SubQueryScan<'_> {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        self.ctx.cancel.check()?;
        if !self.started {
            self.checkpoint = bindings.checkpoint();
            self.started = true;
            if self.rows.is_none() {
                self.rows = Some(Rc::new(materialize_subquery(
                    &self.ctx,
                    self.sub,
                    &self.scope,
                )?));
            }
        } else {
            bindings.truncate(self.checkpoint);
        }
        let rows = self.rows.clone().unwrap_or_default();
        while self.cursor < rows.len() {
            let row = &rows[self.cursor];
            self.cursor += 1;
            if row.bind_into(bindings)? {
                return Ok(true);
            }
            bindings.truncate(self.checkpoint);
        }
        bindings.truncate(self.checkpoint);
        Ok(false)
    }

    fn reset(&mut self) {
        // The subquery is uncorrelated; its materialized rows survive
        // re-opens, only the cursor rewinds.
        self.cursor = 0;
        self.started = false;
    }
}

/// Composes a subquery with outer triple patterns by nested loop: for each
/// subquery row, checkpoint, copy the projected bindings into the outer
/// table, then iterate the outer pattern scan; on exhaustion restore and
/// advance the subquery.
pub(crate) struct SubQueryJoinScan<'a> {
    ctx: Rc<ExecContext<'a>>,
    sub_rows: SubQueryScan<'a>,
    patterns: MultiPatternScan<'a>,
    patterns_open: bool,
}

impl<'a> SubQueryJoinScan<'a> {
    pub fn new(
        ctx: Rc<ExecContext<'a>>,
        sub: &'a SubQuery,
        outer: Vec<TriplePattern>,
        outer_filters: Vec<Vec<crate::query::Span>>,
        scope: GraphScope,
    ) -> Self {
        let sub_rows = SubQueryScan::new(Rc::clone(&ctx), sub, scope.clone());
        let patterns = MultiPatternScan::new(Rc::clone(&ctx), outer, outer_filters, scope);
        Self {
            ctx,
            sub_rows,
            patterns,
            patterns_open: false,
        }
    }
}

impl Scan for SubQueryJoinScan<'_> {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        loop {
            self.ctx.cancel.check()?;
            if self.patterns_open {
                if self.patterns.next(bindings)? {
                    return Ok(true);
                }
                self.patterns.reset();
                self.patterns_open = false;
            }
            if !self.sub_rows.next(bindings)? {
                return Ok(false);
            }
            self.patterns_open = true;
        }
    }

    fn reset(&mut self) {
        self.sub_rows.reset();
        self.patterns.reset();
        self.patterns_open = false;
    }
}
