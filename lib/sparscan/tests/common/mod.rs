//! Shared fixtures: an assembler for the span-based query representation
//! (standing in for the external parser) and store helpers.
#![allow(dead_code)]

use quadmem::{MemoryQuadStore, Quad};
use sparscan::{
    AggregateFunction, BindAssignment, DatasetSpec, ExistsFilter, GraphClause, GraphPattern,
    GraphRef, GraphTarget, OrderKey, PathMode, QuadPatternSpec, Query, QueryExecutor, QueryKind,
    QueryOutcome, QuerySolution, SelectClause, SelectItem, ServiceClause, SolutionModifiers,
    SourceBuffer, SubQuery, UpdateOp, Value, ValuesBlock,
};

pub fn store_with(triples: &[(&str, &str, &str)]) -> MemoryQuadStore {
    let store = MemoryQuadStore::new();
    let mut batch = store.batch().unwrap();
    for (s, p, o) in triples {
        batch.insert(Quad::triple(*s, *p, *o));
    }
    batch.commit().unwrap();
    store
}

pub fn store_with_quads(quads: &[(&str, &str, &str, &str)]) -> MemoryQuadStore {
    let store = MemoryQuadStore::new();
    let mut batch = store.batch().unwrap();
    for (s, p, o, g) in quads {
        batch.insert(Quad::new(*s, *p, *o, *g));
    }
    batch.commit().unwrap();
    store
}

pub fn solutions(store: &MemoryQuadStore, query: &Query) -> Vec<QuerySolution> {
    solutions_with(&QueryExecutor::new(), store, query)
}

pub fn solutions_with(
    executor: &QueryExecutor,
    store: &MemoryQuadStore,
    query: &Query,
) -> Vec<QuerySolution> {
    let QueryOutcome::Solutions(iter) = executor.execute(store, query).unwrap() else {
        panic!("expected solutions");
    };
    iter.collect::<Result<Vec<_>, _>>().unwrap()
}

pub fn lex(solution: &QuerySolution, variable: &str) -> Option<String> {
    solution.get(variable).and_then(Value::lexical_form)
}

pub fn int_lit(value: i64) -> String {
    format!("\"{value}\"^^<http://www.w3.org/2001/XMLSchema#integer>")
}

/// Assembles a [`Query`] the way the upstream parser would: terms and
/// expression spans reference one growing source text.
pub struct QueryBuilder {
    buffer: SourceBuffer,
    kind: QueryKind,
    select: SelectClause,
    groups: Vec<GraphPattern>,
    template: Vec<sparscan::TriplePattern>,
    describe_targets: Vec<sparscan::Term>,
    modifiers: SolutionModifiers,
    dataset: DatasetSpec,
    post_values: Option<ValuesBlock>,
    updates: Vec<UpdateOp>,
    prefixes: Vec<(String, String)>,
}

impl QueryBuilder {
    fn new(kind: QueryKind) -> Self {
        Self {
            buffer: SourceBuffer::new(),
            kind,
            select: SelectClause::default(),
            groups: vec![GraphPattern::default()],
            template: Vec::new(),
            describe_targets: Vec::new(),
            modifiers: SolutionModifiers::default(),
            dataset: DatasetSpec::default(),
            post_values: None,
            updates: Vec::new(),
            prefixes: Vec::new(),
        }
    }

    /// `SELECT ?a ?b`; an empty list is `SELECT *`.
    pub fn select(vars: &[&str]) -> Self {
        let mut builder = Self::new(QueryKind::Select);
        for var in vars {
            let term = builder.buffer.push_term(var);
            builder.select.items.push(SelectItem::Variable(term));
        }
        builder
    }

    pub fn ask() -> Self {
        Self::new(QueryKind::Ask)
    }

    pub fn construct(template: &[(&str, &str, &str)]) -> Self {
        let mut builder = Self::new(QueryKind::Construct);
        for (s, p, o) in template {
            let pattern = builder.buffer.push_pattern(s, p, o);
            builder.template.push(pattern);
        }
        builder
    }

    pub fn describe(targets: &[&str]) -> Self {
        let mut builder = Self::new(QueryKind::Describe);
        for target in targets {
            let term = builder.buffer.push_term(target);
            builder.describe_targets.push(term);
        }
        builder
    }

    pub fn update() -> Self {
        Self::new(QueryKind::Update)
    }

    fn group(&mut self) -> &mut GraphPattern {
        self.groups.last_mut().unwrap()
    }

    pub fn prefix(mut self, prefix: &str, namespace: &str) -> Self {
        self.prefixes.push((prefix.to_owned(), namespace.to_owned()));
        self
    }

    pub fn triple(mut self, s: &str, p: &str, o: &str) -> Self {
        let pattern = self.buffer.push_pattern(s, p, o);
        self.group().patterns.push(pattern);
        self
    }

    pub fn path(mut self, s: &str, p: &str, mode: PathMode, o: &str) -> Self {
        let pattern = self.buffer.push_path_pattern(s, p, o, mode);
        self.group().patterns.push(pattern);
        self
    }

    pub fn filter(mut self, expression: &str) -> Self {
        let span = self.buffer.push_span(expression);
        self.group().filters.push(span);
        self
    }

    pub fn bind(mut self, expression: &str, target: &str) -> Self {
        let expression = self.buffer.push_span(expression);
        let target = self.buffer.push_term(target);
        self.group().binds.push(BindAssignment { expression, target });
        self
    }

    fn nested(mut self, build: impl FnOnce(Self) -> Self) -> (Self, GraphPattern) {
        self.groups.push(GraphPattern::default());
        let mut built = build(self);
        let group = built.groups.pop().unwrap();
        (built, group)
    }

    pub fn optional(self, build: impl FnOnce(Self) -> Self) -> Self {
        let (mut this, group) = self.nested(build);
        this.group().optionals.push(group);
        this
    }

    pub fn minus(self, build: impl FnOnce(Self) -> Self) -> Self {
        let (mut this, group) = self.nested(build);
        this.group().minus.push(group);
        this
    }

    pub fn exists(self, build: impl FnOnce(Self) -> Self) -> Self {
        let (mut this, group) = self.nested(build);
        this.group().exists.push(ExistsFilter {
            negated: false,
            pattern: group,
        });
        this
    }

    pub fn not_exists(self, build: impl FnOnce(Self) -> Self) -> Self {
        let (mut this, group) = self.nested(build);
        this.group().exists.push(ExistsFilter {
            negated: true,
            pattern: group,
        });
        this
    }

    pub fn union(self, a: impl FnOnce(Self) -> Self, b: impl FnOnce(Self) -> Self) -> Self {
        let (this, first) = self.nested(a);
        let (mut this, second) = this.nested(b);
        this.group().union = Some(Box::new((first, second)));
        this
    }

    pub fn graph(self, graph: &str, build: impl FnOnce(Self) -> Self) -> Self {
        let (mut this, group) = self.nested(build);
        let graph = this.buffer.push_term(graph);
        this.group().graphs.push(GraphClause {
            graph,
            pattern: group,
        });
        this
    }

    /// `SERVICE <endpoint> { patterns }`: the body text is pushed both as
    /// a raw span (sent to the endpoint) and as parsed patterns (used for
    /// join-variable discovery).
    pub fn service(
        mut self,
        endpoint: &str,
        silent: bool,
        patterns: &[(&str, &str, &str)],
    ) -> Self {
        let endpoint = self.buffer.push_term(endpoint);
        let body_text = patterns
            .iter()
            .map(|(s, p, o)| format!("{s} {p} {o}"))
            .collect::<Vec<_>>()
            .join(" . ");
        let body = self.buffer.push_span(&body_text);
        let mut pattern = GraphPattern::default();
        for (s, p, o) in patterns {
            pattern.patterns.push(self.buffer.push_pattern(s, p, o));
        }
        self.group().services.push(ServiceClause {
            endpoint,
            silent,
            pattern,
            body,
        });
        self
    }

    pub fn subquery(
        self,
        vars: &[&str],
        distinct: bool,
        limit: Option<u64>,
        offset: u64,
        build: impl FnOnce(Self) -> Self,
    ) -> Self {
        let (mut this, group) = self.nested(build);
        let mut select = SelectClause {
            distinct,
            items: Vec::new(),
        };
        for var in vars {
            let term = this.buffer.push_term(var);
            select.items.push(SelectItem::Variable(term));
        }
        this.group().subqueries.push(SubQuery {
            select,
            pattern: group,
            limit,
            offset,
        });
        this
    }

    fn values_block(&mut self, vars: &[&str], rows: &[&[Option<&str>]]) -> ValuesBlock {
        let variables = vars
            .iter()
            .map(|var| self.buffer.push_term(var))
            .collect();
        let rows = rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| cell.map(|token| self.buffer.push_term(token)))
                    .collect()
            })
            .collect();
        ValuesBlock { variables, rows }
    }

    pub fn values(mut self, vars: &[&str], rows: &[&[Option<&str>]]) -> Self {
        let block = self.values_block(vars, rows);
        self.group().values.push(block);
        self
    }

    pub fn post_values(mut self, vars: &[&str], rows: &[&[Option<&str>]]) -> Self {
        let block = self.values_block(vars, rows);
        self.post_values = Some(block);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.select.distinct = true;
        self
    }

    pub fn order_by(mut self, expression: &str, descending: bool) -> Self {
        let expression = self.buffer.push_span(expression);
        self.modifiers.order_by.push(OrderKey {
            expression,
            descending,
        });
        self
    }

    pub fn group_by(mut self, var: &str) -> Self {
        let term = self.buffer.push_term(var);
        self.modifiers.group_by.push(term);
        self
    }

    pub fn having(mut self, expression: &str) -> Self {
        let span = self.buffer.push_span(expression);
        self.modifiers.having.push(span);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.modifiers.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.modifiers.offset = offset;
        self
    }

    pub fn from(mut self, graph: &str) -> Self {
        let term = self.buffer.push_term(graph);
        self.dataset.from.push(term);
        self
    }

    pub fn from_named(mut self, graph: &str) -> Self {
        let term = self.buffer.push_term(graph);
        self.dataset.from_named.push(term);
        self
    }

    pub fn aggregate(
        mut self,
        function: AggregateFunction,
        distinct: bool,
        argument: Option<&str>,
        alias: &str,
    ) -> Self {
        let argument = argument.map(|expr| self.buffer.push_span(expr));
        let alias = self.buffer.push_term(alias);
        self.select.items.push(SelectItem::Aggregate {
            function,
            distinct,
            argument,
            separator: None,
            alias,
        });
        self
    }

    pub fn group_concat(mut self, argument: &str, separator: &str, alias: &str) -> Self {
        let argument = Some(self.buffer.push_span(argument));
        let alias = self.buffer.push_term(alias);
        self.select.items.push(SelectItem::Aggregate {
            function: AggregateFunction::GroupConcat,
            distinct: false,
            argument,
            separator: Some(separator.to_owned()),
            alias,
        });
        self
    }

    pub fn select_expr(mut self, expression: &str, alias: &str) -> Self {
        let expression = self.buffer.push_span(expression);
        let alias = self.buffer.push_term(alias);
        self.select.items.push(SelectItem::Expression { expression, alias });
        self
    }

    fn quad_specs(&mut self, quads: &[(&str, &str, &str, &str)]) -> Vec<QuadPatternSpec> {
        quads
            .iter()
            .map(|(s, p, o, g)| QuadPatternSpec {
                triple: self.buffer.push_pattern(s, p, o),
                graph: if g.is_empty() {
                    None
                } else {
                    Some(self.buffer.push_term(g))
                },
            })
            .collect()
    }

    pub fn insert_data(mut self, quads: &[(&str, &str, &str, &str)]) -> Self {
        let quads = self.quad_specs(quads);
        self.updates.push(UpdateOp::InsertData { quads });
        self
    }

    pub fn delete_data(mut self, quads: &[(&str, &str, &str, &str)]) -> Self {
        let quads = self.quad_specs(quads);
        self.updates.push(UpdateOp::DeleteData { quads });
        self
    }

    pub fn delete_where(mut self, patterns: &[(&str, &str, &str, &str)]) -> Self {
        let patterns = self.quad_specs(patterns);
        self.updates.push(UpdateOp::DeleteWhere { patterns });
        self
    }

    pub fn delete_insert(
        self,
        delete: &[(&str, &str, &str, &str)],
        insert: &[(&str, &str, &str, &str)],
        with: Option<&str>,
        build: impl FnOnce(Self) -> Self,
    ) -> Self {
        let (mut this, pattern) = self.nested(build);
        let delete = this.quad_specs(delete);
        let insert = this.quad_specs(insert);
        let with = with.map(|graph| this.buffer.push_term(graph));
        this.updates.push(UpdateOp::DeleteInsert {
            delete,
            insert,
            pattern,
            with,
        });
        this
    }

    fn graph_target(&mut self, graph: Option<&str>) -> GraphTarget {
        match graph {
            Some(graph) => GraphTarget::Graph(self.buffer.push_term(graph)),
            None => GraphTarget::Default,
        }
    }

    pub fn clear(mut self, graph: Option<&str>, silent: bool) -> Self {
        let target = self.graph_target(graph);
        self.updates.push(UpdateOp::Clear { target, silent });
        self
    }

    pub fn clear_all(mut self) -> Self {
        self.updates.push(UpdateOp::Clear {
            target: GraphTarget::All,
            silent: false,
        });
        self
    }

    pub fn drop_graph(mut self, graph: &str, silent: bool) -> Self {
        let target = self.graph_target(Some(graph));
        self.updates.push(UpdateOp::Drop { target, silent });
        self
    }

    pub fn create(mut self, graph: &str, silent: bool) -> Self {
        let graph = self.buffer.push_term(graph);
        self.updates.push(UpdateOp::Create { graph, silent });
        self
    }

    fn graph_ref(&mut self, graph: Option<&str>) -> GraphRef {
        match graph {
            Some(graph) => GraphRef::Graph(self.buffer.push_term(graph)),
            None => GraphRef::Default,
        }
    }

    pub fn copy(mut self, from: Option<&str>, to: Option<&str>, silent: bool) -> Self {
        let from = self.graph_ref(from);
        let to = self.graph_ref(to);
        self.updates.push(UpdateOp::Copy { from, to, silent });
        self
    }

    pub fn move_graph(mut self, from: Option<&str>, to: Option<&str>, silent: bool) -> Self {
        let from = self.graph_ref(from);
        let to = self.graph_ref(to);
        self.updates.push(UpdateOp::Move { from, to, silent });
        self
    }

    pub fn add(mut self, from: Option<&str>, to: Option<&str>, silent: bool) -> Self {
        let from = self.graph_ref(from);
        let to = self.graph_ref(to);
        self.updates.push(UpdateOp::Add { from, to, silent });
        self
    }

    pub fn load(mut self, source: &str, graph: Option<&str>, silent: bool) -> Self {
        let source = self.buffer.push_term(source);
        let graph = graph.map(|g| self.buffer.push_term(g));
        self.updates.push(UpdateOp::Load {
            source,
            graph,
            silent,
        });
        self
    }

    pub fn build(mut self) -> Query {
        assert_eq!(self.groups.len(), 1, "unbalanced group nesting");
        let pattern = self.groups.pop().unwrap();
        let mut query = Query::new(self.kind, self.buffer.finish());
        query.select = self.select;
        query.pattern = pattern;
        query.template = self.template;
        query.describe_targets = self.describe_targets;
        query.modifiers = self.modifiers;
        query.dataset = self.dataset;
        query.post_values = self.post_values;
        query.updates = self.updates;
        query.prefixes = self.prefixes;
        query
    }
}
