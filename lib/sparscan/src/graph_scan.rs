//! Named-graph scoping operators: `GRAPH ?g`, `GRAPH <g>` and the
//! `FROM`-union evaluation of whole groups.

use crate::binding::BindingTable;
use crate::error::EvaluationError;
use crate::query::GraphPattern;
use crate::scan::{plain_group_scan, ExecContext, GraphScope, Scan};
use std::rc::Rc;

/// `GRAPH ?g { ... }`: iterates every candidate named graph, binds the
/// graph variable to the graph IRI and runs the inner group against that
/// graph.
pub(crate) struct VariableGraphScan<'a> {
    ctx: Rc<ExecContext<'a>>,
    variable: String,
    group: &'a GraphPattern,
    /// Named graphs in scope: `FROM NAMED` when given, otherwise the
    /// store's enumerator output.
    graphs: Rc<[String]>,
    cursor: usize,
    inner: Option<Box<dyn Scan + 'a>>,
    checkpoint: usize,
    started: bool,
    done: bool,
}

impl<'a> VariableGraphScan<'a> {
    pub fn new(
        ctx: Rc<ExecContext<'a>>,
        variable: String,
        group: &'a GraphPattern,
        graphs: Rc<[String]>,
    ) -> Self {
        Self {
            ctx,
            variable,
            group,
            graphs,
            cursor: 0,
            inner: None,
            checkpoint: 0,
            started: false,
            done: false,
        }
    }
}

impl Scan for VariableGraphScan<'_> {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        if self.done {
            return Ok(false);
        }
        if !self.started {
            self.checkpoint = bindings.checkpoint();
            self.started = true;
        }
        loop {
            self.ctx.cancel.check()?;
            if let Some(inner) = &mut self.inner {
                if inner.next(bindings)? {
                    return Ok(true);
                }
                self.inner = None;
            }
            bindings.truncate(self.checkpoint);
            let Some(graph) = self.graphs.get(self.cursor) else {
                self.done = true;
                return Ok(false);
            };
            self.cursor += 1;
            // A pre-bound graph variable narrows the iteration to its
            // graph through the ordinary consistency check.
            if !bindings.bind_lexical(&self.variable, graph)? {
                bindings.truncate(self.checkpoint);
                continue;
            }
            let scope = GraphScope::Fixed(Rc::from(graph.as_str()));
            self.inner = Some(plain_group_scan(&self.ctx, self.group, &scope)?);
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.inner = None;
        self.started = false;
        self.done = false;
    }
}

/// `GRAPH <g> { ... }`: the inner group against one concrete graph.
pub(crate) struct FixedGraphScan<'a> {
    inner: Box<dyn Scan + 'a>,
}

impl<'a> FixedGraphScan<'a> {
    pub fn new(
        ctx: &Rc<ExecContext<'a>>,
        group: &'a GraphPattern,
        graph: &str,
    ) -> Result<Self, EvaluationError> {
        let scope = GraphScope::Fixed(Rc::from(graph));
        Ok(Self {
            inner: plain_group_scan(ctx, group, &scope)?,
        })
    }
}

impl Scan for FixedGraphScan<'_> {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        self.inner.next(bindings)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }
}

/// `FROM` union evaluation of a whole group: the full inner group runs
/// independently against each dataset graph and the results are unioned,
/// in graph order.
pub(crate) struct DefaultGraphUnionScan<'a> {
    ctx: Rc<ExecContext<'a>>,
    group: &'a GraphPattern,
    graphs: Rc<[String]>,
    cursor: usize,
    inner: Option<Box<dyn Scan + 'a>>,
    checkpoint: usize,
    started: bool,
    done: bool,
}

impl<'a> DefaultGraphUnionScan<'a> {
    pub fn new(ctx: Rc<ExecContext<'a>>, group: &'a GraphPattern, graphs: Rc<[String]>) -> Self {
        Self {
            ctx,
            group,
            graphs,
            cursor: 0,
            inner: None,
            checkpoint: 0,
            started: false,
            done: false,
        }
    }
}

impl Scan for DefaultGraphUnionScan<'_> {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        if self.done {
            return Ok(false);
        }
        if !self.started {
            self.checkpoint = bindings.checkpoint();
            self.started = true;
        }
        loop {
            self.ctx.cancel.check()?;
            if let Some(inner) = &mut self.inner {
                if inner.next(bindings)? {
                    return Ok(true);
                }
                self.inner = None;
            }
            bindings.truncate(self.checkpoint);
            let Some(graph) = self.graphs.get(self.cursor) else {
                self.done = true;
                return Ok(false);
            };
            self.cursor += 1;
            let scope = GraphScope::Fixed(Rc::from(graph.as_str()));
            self.inner = Some(plain_group_scan(&self.ctx, self.group, &scope)?);
        }
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.inner = None;
        self.started = false;
        self.done = false;
    }
}
