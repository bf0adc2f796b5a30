//! The parsed query representation the engine consumes.
//!
//! An upstream parser hands the engine one [`Query`] value: the raw source
//! text plus a tree whose terms and expressions are `(offset, length)` spans
//! into that text. Prefixed names, the `a` shorthand and bare numeric
//! literals are expanded on use, never rewritten in place. [`SourceBuffer`]
//! is the assembly half of the contract: it appends lexical forms to the
//! source text and mints the matching spans.

use crate::vocab::{rdf, xsd};

/// 32-bit FNV-1a, the variable-name hash used across all binding tables.
#[inline]
pub(crate) fn fnv1a32(input: &str) -> u32 {
    let mut hash = 0x811c_9dc5u32;
    for byte in input.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// 64-bit FNV-1a, used for query fingerprints and value deduplication.
#[inline]
pub(crate) fn fnv1a64(input: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in input {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// A byte range into the query source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub offset: u32,
    pub length: u32,
}

impl Span {
    pub fn new(offset: usize, length: usize) -> Self {
        Self {
            offset: u32::try_from(offset).unwrap_or(u32::MAX),
            length: u32::try_from(length).unwrap_or(0),
        }
    }

    #[inline]
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        let start = self.offset as usize;
        let end = start + self.length as usize;
        source.get(start..end).unwrap_or("")
    }
}

/// What a term span denotes, before expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    /// `<http://...>`
    Iri,
    /// Quoted literal (with optional `@lang` / `^^datatype` suffix) or a
    /// bare numeric / boolean token.
    Literal,
    /// `?name` or `$name`
    Variable,
    /// `_:label`; behaves as a non-projectable variable inside patterns.
    BlankNode,
    /// The `a` predicate shorthand for `rdf:type`.
    TypeShorthand,
    /// `prefix:local`, expanded through the query's prefix table.
    PrefixedName,
}

/// A tagged reference into the query source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Term {
    pub kind: TermKind,
    pub span: Span,
}

impl Term {
    pub fn new(kind: TermKind, span: Span) -> Self {
        Self { kind, span }
    }

    #[inline]
    pub fn is_variable(&self) -> bool {
        matches!(self.kind, TermKind::Variable | TermKind::BlankNode)
    }
}

/// Property-path annotation on a triple pattern's predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathMode {
    #[default]
    Direct,
    /// `^p`
    Inverse,
    /// `p*`
    ZeroOrMore,
    /// `p+`
    OneOrMore,
    /// `p?`
    ZeroOrOne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriplePattern {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
    pub path: PathMode,
}

impl TriplePattern {
    pub fn new(subject: Term, predicate: Term, object: Term) -> Self {
        Self {
            subject,
            predicate,
            object,
            path: PathMode::Direct,
        }
    }

    pub fn with_path(subject: Term, predicate: Term, object: Term, path: PathMode) -> Self {
        Self {
            subject,
            predicate,
            object,
            path,
        }
    }
}

/// A triple pattern with an optional explicit graph, as used by updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuadPatternSpec {
    pub triple: TriplePattern,
    /// `None` scopes the pattern to the operation's default graph (or the
    /// `WITH` graph when one is given).
    pub graph: Option<Term>,
}

/// `BIND(expression AS ?target)`
#[derive(Debug, Clone, Copy)]
pub struct BindAssignment {
    pub expression: Span,
    pub target: Term,
}

/// `GRAPH <g> { ... }` / `GRAPH ?g { ... }`
#[derive(Debug, Clone)]
pub struct GraphClause {
    pub graph: Term,
    pub pattern: GraphPattern,
}

/// `SERVICE [SILENT] <endpoint> { ... }`
#[derive(Debug, Clone)]
pub struct ServiceClause {
    pub endpoint: Term,
    pub silent: bool,
    /// Parsed body, used for join-variable discovery.
    pub pattern: GraphPattern,
    /// Raw body text, forwarded verbatim to the endpoint.
    pub body: Span,
}

/// `FILTER [NOT] EXISTS { ... }`
#[derive(Debug, Clone)]
pub struct ExistsFilter {
    pub negated: bool,
    pub pattern: GraphPattern,
}

/// `VALUES (?a ?b) { (1 2) (UNDEF 3) }`
#[derive(Debug, Clone)]
pub struct ValuesBlock {
    pub variables: Vec<Term>,
    /// One entry per variable per row; `None` is `UNDEF`.
    pub rows: Vec<Vec<Option<Term>>>,
}

/// A nested `{ SELECT ... }`.
#[derive(Debug, Clone)]
pub struct SubQuery {
    pub select: SelectClause,
    pub pattern: GraphPattern,
    pub limit: Option<u64>,
    pub offset: u64,
}

/// One `{ ... }` group: an ordered collection of pattern elements.
#[derive(Debug, Clone, Default)]
pub struct GraphPattern {
    pub patterns: Vec<TriplePattern>,
    pub filters: Vec<Span>,
    pub binds: Vec<BindAssignment>,
    pub optionals: Vec<GraphPattern>,
    pub graphs: Vec<GraphClause>,
    pub services: Vec<ServiceClause>,
    pub subqueries: Vec<SubQuery>,
    /// `{ A } UNION { B }`; the group then usually carries no other content.
    pub union: Option<Box<(GraphPattern, GraphPattern)>>,
    pub minus: Vec<GraphPattern>,
    pub exists: Vec<ExistsFilter>,
    pub values: Vec<ValuesBlock>,
}

impl GraphPattern {
    /// Does this group carry anything the driver has to run beyond the
    /// required patterns and filters?
    pub(crate) fn is_plain(&self) -> bool {
        self.binds.is_empty()
            && self.optionals.is_empty()
            && self.graphs.is_empty()
            && self.services.is_empty()
            && self.subqueries.is_empty()
            && self.union.is_none()
            && self.minus.is_empty()
            && self.exists.is_empty()
            && self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Sample,
    GroupConcat,
}

/// One projected item in a `SELECT` clause.
#[derive(Debug, Clone)]
pub enum SelectItem {
    Variable(Term),
    /// `(AGG(expr) AS ?alias)`; `argument` is `None` for `COUNT(*)`.
    Aggregate {
        function: AggregateFunction,
        distinct: bool,
        argument: Option<Span>,
        /// `GROUP_CONCAT(...; separator="...")`
        separator: Option<String>,
        alias: Term,
    },
    /// `(expr AS ?alias)`
    Expression { expression: Span, alias: Term },
}

/// The `SELECT` clause; an empty item list means `SELECT *`.
#[derive(Debug, Clone, Default)]
pub struct SelectClause {
    pub distinct: bool,
    pub items: Vec<SelectItem>,
}

/// One `ORDER BY` key.
#[derive(Debug, Clone, Copy)]
pub struct OrderKey {
    pub expression: Span,
    pub descending: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SolutionModifiers {
    pub order_by: Vec<OrderKey>,
    pub group_by: Vec<Term>,
    pub having: Vec<Span>,
    pub limit: Option<u64>,
    pub offset: u64,
}

/// `FROM` / `FROM NAMED` clauses.
#[derive(Debug, Clone, Default)]
pub struct DatasetSpec {
    pub from: Vec<Term>,
    pub from_named: Vec<Term>,
}

impl DatasetSpec {
    pub fn is_empty(&self) -> bool {
        self.from.is_empty() && self.from_named.is_empty()
    }
}

/// Target of `CLEAR` / `DROP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphTarget {
    Default,
    Named,
    All,
    Graph(Term),
}

/// Source or destination of `COPY` / `MOVE` / `ADD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphRef {
    Default,
    Graph(Term),
}

/// One SPARQL update operation.
#[derive(Debug, Clone)]
pub enum UpdateOp {
    InsertData {
        quads: Vec<QuadPatternSpec>,
    },
    DeleteData {
        quads: Vec<QuadPatternSpec>,
    },
    /// `DELETE WHERE { ... }`: the pattern doubles as the delete template.
    DeleteWhere {
        patterns: Vec<QuadPatternSpec>,
    },
    DeleteInsert {
        delete: Vec<QuadPatternSpec>,
        insert: Vec<QuadPatternSpec>,
        pattern: GraphPattern,
        /// `WITH <g>`: default graph for the WHERE clause and for unscoped
        /// template patterns.
        with: Option<Term>,
    },
    Clear {
        target: GraphTarget,
        silent: bool,
    },
    Drop {
        target: GraphTarget,
        silent: bool,
    },
    Create {
        graph: Term,
        silent: bool,
    },
    Copy {
        from: GraphRef,
        to: GraphRef,
        silent: bool,
    },
    Move {
        from: GraphRef,
        to: GraphRef,
        silent: bool,
    },
    Add {
        from: GraphRef,
        to: GraphRef,
        silent: bool,
    },
    Load {
        source: Term,
        graph: Option<Term>,
        silent: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    Ask,
    Construct,
    Describe,
    Update,
}

/// A parsed, fingerprinted query or update request.
///
/// All terms, filter expressions and `BIND` expressions reference `text`
/// through spans; the struct owns the text so the tree stays self-contained.
#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    pub kind: QueryKind,
    /// `prefix -> namespace IRI` (namespace without angle brackets).
    pub prefixes: Vec<(String, String)>,
    pub select: SelectClause,
    pub pattern: GraphPattern,
    /// `CONSTRUCT` template.
    pub template: Vec<TriplePattern>,
    /// `DESCRIBE` targets (variables or IRIs).
    pub describe_targets: Vec<Term>,
    pub modifiers: SolutionModifiers,
    pub dataset: DatasetSpec,
    /// Trailing (post-query) `VALUES` block.
    pub post_values: Option<ValuesBlock>,
    pub updates: Vec<UpdateOp>,
}

impl Query {
    pub fn new(kind: QueryKind, text: String) -> Self {
        Self {
            text,
            kind,
            prefixes: Vec::new(),
            select: SelectClause::default(),
            pattern: GraphPattern::default(),
            template: Vec::new(),
            describe_targets: Vec::new(),
            modifiers: SolutionModifiers::default(),
            dataset: DatasetSpec::default(),
            post_values: None,
            updates: Vec::new(),
        }
    }

    /// FNV-1a fingerprint of the source text; keys the per-execution
    /// service result cache.
    pub fn fingerprint(&self) -> u64 {
        fnv1a64(self.text.as_bytes())
    }

    #[inline]
    pub fn span_text(&self, span: Span) -> &str {
        span.text(&self.text)
    }

    #[inline]
    pub fn term_text(&self, term: Term) -> &str {
        term.span.text(&self.text)
    }

    /// The binding name of a variable or blank-node term.
    ///
    /// Variables drop their `?` / `$` sigil; blank nodes keep the full
    /// `_:label` so they can never collide with user variables.
    pub fn variable_name(&self, term: Term) -> Option<&str> {
        match term.kind {
            TermKind::Variable => {
                let text = self.term_text(term);
                Some(text.strip_prefix(['?', '$']).unwrap_or(text))
            }
            TermKind::BlankNode => Some(self.term_text(term)),
            _ => None,
        }
    }

    /// Expands `prefix:local` through the prefix table into a bare IRI.
    pub fn expand_prefixed(&self, name: &str) -> Option<String> {
        let (prefix, local) = name.split_once(':')?;
        let namespace = self
            .prefixes
            .iter()
            .find(|(candidate, _)| candidate == prefix)
            .map(|(_, namespace)| namespace)?;
        Some(format!("{namespace}{local}"))
    }

    /// Resolves a constant (non-variable) term to the canonical store
    /// lexical form. Numeric and boolean shorthand literals are auto-typed,
    /// prefixed names and `a` expand, quoted literals keep their shape
    /// (with a prefixed datatype expanded when present).
    pub fn constant_lexical(&self, term: Term) -> Option<String> {
        let text = self.term_text(term);
        match term.kind {
            TermKind::Variable | TermKind::BlankNode => None,
            TermKind::Iri => Some(text.to_owned()),
            TermKind::TypeShorthand => Some(format!("<{}>", rdf::TYPE)),
            TermKind::PrefixedName => Some(format!("<{}>", self.expand_prefixed(text)?)),
            TermKind::Literal => Some(self.literal_lexical(text)),
        }
    }

    fn literal_lexical(&self, text: &str) -> String {
        if let Some(quoted_end) = quoted_end(text) {
            let suffix = &text[quoted_end..];
            // A prefixed datatype is the only part that needs rewriting.
            if let Some(datatype) = suffix.strip_prefix("^^") {
                if !datatype.starts_with('<') {
                    if let Some(expanded) = self.expand_prefixed(datatype) {
                        return format!("{}^^<{expanded}>", &text[..quoted_end]);
                    }
                }
            }
            return text.to_owned();
        }
        match text {
            "true" | "false" => format!("\"{text}\"^^<{}>", xsd::BOOLEAN),
            _ => {
                let datatype = if text.contains(['e', 'E']) {
                    xsd::DOUBLE
                } else if text.contains('.') {
                    xsd::DECIMAL
                } else {
                    xsd::INTEGER
                };
                format!("\"{text}\"^^<{datatype}>")
            }
        }
    }
}

/// Byte offset just past the closing quote of a quoted literal, if the text
/// starts with one.
fn quoted_end(text: &str) -> Option<usize> {
    if !text.starts_with('"') {
        return None;
    }
    let bytes = text.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// Infers the [`TermKind`] of a single lexical token the way the upstream
/// parser tags it.
pub fn infer_term_kind(token: &str) -> TermKind {
    if token.starts_with(['?', '$']) {
        TermKind::Variable
    } else if token.starts_with('<') {
        TermKind::Iri
    } else if token.starts_with("_:") {
        TermKind::BlankNode
    } else if token == "a" {
        TermKind::TypeShorthand
    } else if token.starts_with('"')
        || token.starts_with(|c: char| c.is_ascii_digit())
        || token.starts_with(['+', '-'])
        || token == "true"
        || token == "false"
    {
        TermKind::Literal
    } else {
        TermKind::PrefixedName
    }
}

/// Incrementally assembles the source text of a [`Query`], minting spans
/// and terms as tokens are appended. This is the constructive half of the
/// representation contract; the test-suites and embedded callers use it in
/// place of a full parser.
#[derive(Debug, Default)]
pub struct SourceBuffer {
    text: String,
}

impl SourceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw snippet (an expression, a service body) and returns
    /// its span.
    pub fn push_span(&mut self, snippet: &str) -> Span {
        let offset = self.text.len();
        self.text.push_str(snippet);
        self.text.push(' ');
        Span::new(offset, snippet.len())
    }

    /// Appends one term token and returns the tagged term.
    pub fn push_term(&mut self, token: &str) -> Term {
        let kind = infer_term_kind(token);
        Term::new(kind, self.push_span(token))
    }

    /// Appends the three terms of a triple pattern.
    pub fn push_pattern(&mut self, subject: &str, predicate: &str, object: &str) -> TriplePattern {
        TriplePattern::new(
            self.push_term(subject),
            self.push_term(predicate),
            self.push_term(object),
        )
    }

    /// Appends a triple pattern with a property-path annotation.
    pub fn push_path_pattern(
        &mut self,
        subject: &str,
        predicate: &str,
        object: &str,
        path: PathMode,
    ) -> TriplePattern {
        TriplePattern::with_path(
            self.push_term(subject),
            self.push_term(predicate),
            self.push_term(object),
            path,
        )
    }

    pub fn finish(self) -> String {
        self.text
    }
}
