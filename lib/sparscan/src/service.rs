//! Federated `SERVICE` evaluation.
//!
//! Transport lives behind [`ServiceExecutor`]; the engine fetches each
//! endpoint/query pair exactly once per execution, materializes the rows
//! and joins them locally. Small result sets stay a linear in-memory list;
//! large ones get an index keyed by the clause's join variables.

use crate::binding::{BindingTable, MaterializedRow, Value};
use crate::error::{EvaluationError, ServiceError};
use crate::limits::ExecutionLimits;
use crate::query::{fnv1a64, ServiceClause};
use crate::scan::{ExecContext, Scan};
use rustc_hash::FxHashMap;
use std::rc::Rc;
use std::sync::Arc;

/// Row count at which the materializer switches from the linear list to
/// the indexed representation.
pub(crate) const SERVICE_INDEX_THRESHOLD: usize = 64;

/// One solution row from a remote endpoint: variable name (without the
/// sigil) to term in lexical form.
#[derive(Debug, Clone, Default)]
pub struct ServiceRow {
    pub bindings: Vec<(String, String)>,
}

impl ServiceRow {
    pub fn new(bindings: Vec<(String, String)>) -> Self {
        Self { bindings }
    }
}

/// Executes `SELECT` queries against remote SPARQL endpoints.
///
/// Implementations own transport and response parsing; failures surface as
/// [`ServiceError`] and are swallowed by `SERVICE SILENT`.
pub trait ServiceExecutor: Send + Sync {
    fn execute_select(
        &self,
        endpoint: &str,
        query: &str,
    ) -> Result<Vec<ServiceRow>, ServiceError>;
}

pub(crate) struct ServiceResult {
    rows: Vec<MaterializedRow>,
    /// Bucketed row indices keyed by the hash of the join-variable values.
    index: Option<ServiceIndex>,
}

impl ServiceResult {
    pub(crate) fn has_index(&self) -> bool {
        self.index.is_some()
    }
}

struct ServiceIndex {
    join_variables: Vec<String>,
    buckets: FxHashMap<u64, Vec<usize>>,
}

fn join_key(values: impl Iterator<Item = Option<String>>) -> Option<u64> {
    let mut key = String::new();
    for value in values {
        key.push_str(&value?);
        key.push('\u{1f}');
    }
    Some(fnv1a64(key.as_bytes()))
}

/// Fetches and caches `SERVICE` results, one fetch per endpoint/query
/// pair per execution.
pub(crate) struct ServiceMaterializer {
    executor: Option<Arc<dyn ServiceExecutor>>,
    cache: FxHashMap<u64, Rc<ServiceResult>>,
}

impl ServiceMaterializer {
    pub fn new(executor: Option<Arc<dyn ServiceExecutor>>) -> Self {
        Self {
            executor,
            cache: FxHashMap::default(),
        }
    }

    pub fn fetch(
        &mut self,
        ctx: &ExecContext<'_>,
        clause: &ServiceClause,
        join_variables: Vec<String>,
    ) -> Result<Rc<ServiceResult>, EvaluationError> {
        let query = ctx.query;
        let Some(endpoint) = query
            .constant_lexical(clause.endpoint)
            .and_then(|lexical| quadmem::iri_content(&lexical).map(str::to_owned))
        else {
            return if clause.silent {
                Ok(Rc::new(ServiceResult {
                    rows: Vec::new(),
                    index: None,
                }))
            } else {
                Err(EvaluationError::Unsupported(
                    "SERVICE endpoint must be a concrete IRI".into(),
                ))
            };
        };
        let body = query.span_text(clause.body);
        let key = fnv1a64(format!("{endpoint}\u{1f}{body}").as_bytes());
        if let Some(result) = self.cache.get(&key) {
            return Ok(Rc::clone(result));
        }
        let result = Rc::new(self.fetch_uncached(ctx, clause, &endpoint, body, join_variables)?);
        self.cache.insert(key, Rc::clone(&result));
        Ok(result)
    }

    fn fetch_uncached(
        &self,
        ctx: &ExecContext<'_>,
        clause: &ServiceClause,
        endpoint: &str,
        body: &str,
        join_variables: Vec<String>,
    ) -> Result<ServiceResult, EvaluationError> {
        let empty = ServiceResult {
            rows: Vec::new(),
            index: None,
        };
        let Some(executor) = &self.executor else {
            if clause.silent {
                return Ok(empty);
            }
            return Err(EvaluationError::Unsupported(
                "no SPARQL service executor is configured".into(),
            ));
        };
        let remote_query = format!("SELECT * WHERE {{ {body} }}");
        let raw = match executor.execute_select(endpoint, &remote_query) {
            Ok(rows) => rows,
            Err(error) => {
                if clause.silent {
                    tracing::debug!(endpoint, %error, "SILENT service call failed");
                    return Ok(empty);
                }
                return Err(EvaluationError::Service {
                    endpoint: endpoint.to_owned(),
                    source: error,
                });
            }
        };
        ExecutionLimits::check(
            raw.len(),
            ctx.limits.max_materialized_rows,
            "service result rows",
        )?;
        let rows: Vec<MaterializedRow> = raw
            .into_iter()
            .map(|row| MaterializedRow {
                pairs: row
                    .bindings
                    .into_iter()
                    .map(|(name, lexical)| (name, Value::from_lexical(&lexical)))
                    .collect(),
            })
            .collect();
        let index = if rows.len() > SERVICE_INDEX_THRESHOLD && !join_variables.is_empty() {
            let mut buckets: FxHashMap<u64, Vec<usize>> = FxHashMap::default();
            for (position, row) in rows.iter().enumerate() {
                let key = join_key(
                    join_variables
                        .iter()
                        .map(|name| row.get(name).and_then(Value::lexical_form)),
                );
                if let Some(key) = key {
                    buckets.entry(key).or_default().push(position);
                }
            }
            tracing::debug!(
                rows = rows.len(),
                keys = join_variables.len(),
                "indexed service materialization"
            );
            Some(ServiceIndex {
                join_variables,
                buckets,
            })
        } else {
            tracing::debug!(rows = rows.len(), "in-memory service materialization");
            None
        };
        Ok(ServiceResult { rows, index })
    }
}

/// Linear scan over materialized service rows; the bind-time consistency
/// check is the join predicate.
pub(crate) struct ServicePatternScan {
    result: Rc<ServiceResult>,
    cursor: usize,
    checkpoint: usize,
    started: bool,
}

impl ServicePatternScan {
    pub fn new(result: Rc<ServiceResult>) -> Self {
        Self {
            result,
            cursor: 0,
            checkpoint: 0,
            started: false,
        }
    }
}

impl Scan for ServicePatternScan {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        if !self.started {
            self.checkpoint = bindings.checkpoint();
            self.started = true;
        } else {
            bindings.truncate(self.checkpoint);
        }
        while self.cursor < self.result.rows.len() {
            let row = &self.result.rows[self.cursor];
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
        self.cursor = 0;
        self.started = false;
    }
}

/// Indexed variant: resolves the join key from the current bindings and
/// only walks the matching bucket. Falls back to the linear walk when a
/// join variable is still unbound.
pub(crate) struct IndexedServicePatternScan {
    result: Rc<ServiceResult>,
    bucket: Option<Vec<usize>>,
    cursor: usize,
    checkpoint: usize,
    started: bool,
}

impl IndexedServicePatternScan {
    pub fn new(result: Rc<ServiceResult>) -> Self {
        Self {
            result,
            bucket: None,
            cursor: 0,
            checkpoint: 0,
            started: false,
        }
    }

    fn open(&mut self, bindings: &BindingTable) {
        let Some(index) = &self.result.index else {
            self.bucket = None;
            return;
        };
        let key = join_key(
            index
                .join_variables
                .iter()
                .map(|name| bindings.get_lexical(name)),
        );
        self.bucket = match key {
            Some(key) => Some(index.buckets.get(&key).cloned().unwrap_or_default()),
            // Unbound join variable: no usable key.
            None => None,
        };
    }
}

impl Scan for IndexedServicePatternScan {
    fn next(&mut self, bindings: &mut BindingTable) -> Result<bool, EvaluationError> {
        if !self.started {
            self.checkpoint = bindings.checkpoint();
            self.started = true;
            self.open(bindings);
        } else {
            bindings.truncate(self.checkpoint);
        }
        loop {
            let position = match &self.bucket {
                Some(bucket) => {
                    let Some(position) = bucket.get(self.cursor) else {
                        break;
                    };
                    *position
                }
                None => {
                    if self.cursor >= self.result.rows.len() {
                        break;
                    }
                    self.cursor
                }
            };
            self.cursor += 1;
            if self.result.rows[position].bind_into(bindings)? {
                return Ok(true);
            }
            bindings.truncate(self.checkpoint);
        }
        bindings.truncate(self.checkpoint);
        Ok(false)
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.bucket = None;
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::CancellationToken;
    use crate::query::{GraphPattern, Query, QueryKind, SourceBuffer, Term, TermKind};
    use quadmem::MemoryQuadStore;

    struct FixedService {
        rows: Vec<ServiceRow>,
        fail: bool,
    }

    impl ServiceExecutor for FixedService {
        fn execute_select(
            &self,
            _endpoint: &str,
            _query: &str,
        ) -> Result<Vec<ServiceRow>, ServiceError> {
            if self.fail {
                Err(ServiceError::Transport("connection refused".into()))
            } else {
                Ok(self.rows.clone())
            }
        }
    }

    fn clause(buffer: &mut SourceBuffer) -> ServiceClause {
        let endpoint = buffer.push_term("<http://remote/sparql>");
        let body = buffer.push_span("?s <http://e/p> ?v");
        ServiceClause {
            endpoint,
            silent: false,
            pattern: GraphPattern::default(),
            body,
        }
    }

    fn context<'a>(
        store: &'a MemoryQuadStore,
        query: &'a Query,
    ) -> Rc<ExecContext<'a>> {
        ExecContext::new(
            store,
            query,
            ExecutionLimits::default(),
            CancellationToken::new(),
        )
    }

    #[test]
    fn rows_join_through_binding_consistency() {
        let store = MemoryQuadStore::new();
        let mut buffer = SourceBuffer::new();
        let clause = clause(&mut buffer);
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let executor = Arc::new(FixedService {
            rows: vec![
                ServiceRow::new(vec![
                    ("s".into(), "<http://e/a>".into()),
                    ("v".into(), "\"1\"".into()),
                ]),
                ServiceRow::new(vec![
                    ("s".into(), "<http://e/b>".into()),
                    ("v".into(), "\"2\"".into()),
                ]),
            ],
            fail: false,
        });
        let mut materializer = ServiceMaterializer::new(Some(executor));
        let result = materializer.fetch(&ctx, &clause, Vec::new()).unwrap();
        let mut scan = ServicePatternScan::new(Rc::clone(&result));
        let mut bindings = BindingTable::new(&ctx.limits);
        // Pre-bound ?s restricts the service rows to the matching one.
        bindings.bind_lexical("s", "<http://e/b>").unwrap();
        assert!(scan.next(&mut bindings).unwrap());
        assert_eq!(bindings.get_lexical("v").unwrap(), "\"2\"");
        assert!(!scan.next(&mut bindings).unwrap());
    }

    #[test]
    fn fetch_is_cached_per_endpoint_and_body() {
        let store = MemoryQuadStore::new();
        let mut buffer = SourceBuffer::new();
        let clause = clause(&mut buffer);
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let executor = Arc::new(FixedService {
            rows: vec![ServiceRow::new(vec![("v".into(), "\"1\"".into())])],
            fail: false,
        });
        let mut materializer = ServiceMaterializer::new(Some(executor));
        let first = materializer.fetch(&ctx, &clause, Vec::new()).unwrap();
        let second = materializer.fetch(&ctx, &clause, Vec::new()).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn silent_swallows_transport_errors() {
        let store = MemoryQuadStore::new();
        let mut buffer = SourceBuffer::new();
        let mut silent_clause = clause(&mut buffer);
        silent_clause.silent = true;
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let executor = Arc::new(FixedService {
            rows: Vec::new(),
            fail: true,
        });
        let mut materializer = ServiceMaterializer::new(Some(executor));
        let result = materializer.fetch(&ctx, &silent_clause, Vec::new()).unwrap();
        assert!(result.rows.is_empty());

        let mut loud = clause(&mut SourceBuffer::new());
        loud.endpoint = silent_clause.endpoint;
        loud.body = silent_clause.body;
        let executor = Arc::new(FixedService {
            rows: Vec::new(),
            fail: true,
        });
        let mut materializer = ServiceMaterializer::new(Some(executor));
        assert!(matches!(
            materializer.fetch(&ctx, &loud, Vec::new()),
            Err(EvaluationError::Service { .. })
        ));
    }

    #[test]
    fn large_results_get_indexed() {
        let store = MemoryQuadStore::new();
        let mut buffer = SourceBuffer::new();
        let clause = clause(&mut buffer);
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let rows: Vec<ServiceRow> = (0..SERVICE_INDEX_THRESHOLD + 10)
            .map(|i| {
                ServiceRow::new(vec![
                    ("s".into(), format!("<http://e/s{i}>")),
                    ("v".into(), format!("\"{i}\"")),
                ])
            })
            .collect();
        let executor = Arc::new(FixedService { rows, fail: false });
        let mut materializer = ServiceMaterializer::new(Some(executor));
        let result = materializer
            .fetch(&ctx, &clause, vec!["s".into()])
            .unwrap();
        assert!(result.index.is_some());

        let mut scan = IndexedServicePatternScan::new(Rc::clone(&result));
        let mut bindings = BindingTable::new(&ctx.limits);
        bindings.bind_lexical("s", "<http://e/s7>").unwrap();
        assert!(scan.next(&mut bindings).unwrap());
        assert_eq!(bindings.get_lexical("v").unwrap(), "\"7\"");
        assert!(!scan.next(&mut bindings).unwrap());
    }

    #[test]
    fn unresolvable_endpoint_is_an_error_unless_silent() {
        let store = MemoryQuadStore::new();
        let mut buffer = SourceBuffer::new();
        let endpoint = Term::new(TermKind::Variable, buffer.push_span("?endpoint"));
        let body = buffer.push_span("?s ?p ?o");
        let query = Query::new(QueryKind::Select, buffer.finish());
        let ctx = context(&store, &query);
        let mut materializer = ServiceMaterializer::new(None);
        let loud = ServiceClause {
            endpoint,
            silent: false,
            pattern: GraphPattern::default(),
            body,
        };
        assert!(materializer.fetch(&ctx, &loud, Vec::new()).is_err());
        let silent = ServiceClause {
            silent: true,
            ..loud
        };
        assert!(materializer
            .fetch(&ctx, &silent, Vec::new())
            .unwrap()
            .rows
            .is_empty());
    }
}
