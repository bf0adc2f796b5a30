//! Join ordering, filter pushdown and the service-order decision.
//!
//! Deliberately simple cardinality heuristics: a pattern's selectivity is
//! estimated from its constant count and how many of its variables are
//! already bound; filters sink to the earliest join level at which all
//! their variables are bound.

use crate::query::{GraphPattern, Query, Span, TriplePattern};
use rustc_hash::FxHashSet;

/// The evaluation plan for one pattern group.
#[derive(Debug, Default)]
pub(crate) struct GroupPlan {
    /// Permutation of the group's pattern indices, most selective first.
    pub order: Vec<usize>,
    /// Filters pushed down per level (aligned with `order`).
    pub filters_at: Vec<Vec<Span>>,
    /// Filters whose variables are never all bound inside the join; they
    /// run post-join.
    pub residual: Vec<Span>,
}

/// Variables a single expression span references.
pub(crate) fn expression_variables(text: &str) -> FxHashSet<String> {
    let mut variables = FxHashSet::default();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'?' || bytes[i] == b'$' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len()
                && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
            {
                end += 1;
            }
            if end > start {
                variables.insert(text[start..end].to_owned());
            }
            i = end;
        } else {
            i += 1;
        }
    }
    variables
}

fn pattern_variables(query: &Query, pattern: &TriplePattern) -> Vec<String> {
    [pattern.subject, pattern.predicate, pattern.object]
        .into_iter()
        .filter_map(|term| query.variable_name(term).map(str::to_owned))
        .collect()
}

/// All variables a group can bind, for service join-key discovery.
pub(crate) fn group_variables(query: &Query, group: &GraphPattern) -> FxHashSet<String> {
    let mut variables = FxHashSet::default();
    collect_group_variables(query, group, &mut variables);
    variables
}

fn collect_group_variables(query: &Query, group: &GraphPattern, out: &mut FxHashSet<String>) {
    for pattern in &group.patterns {
        out.extend(pattern_variables(query, pattern));
    }
    for bind in &group.binds {
        if let Some(name) = query.variable_name(bind.target) {
            out.insert(name.to_owned());
        }
    }
    for values in &group.values {
        for variable in &values.variables {
            if let Some(name) = query.variable_name(*variable) {
                out.insert(name.to_owned());
            }
        }
    }
    for clause in &group.graphs {
        if let Some(name) = query.variable_name(clause.graph) {
            out.insert(name.to_owned());
        }
        collect_group_variables(query, &clause.pattern, out);
    }
    for sub in &group.subqueries {
        collect_group_variables(query, &sub.pattern, out);
    }
    if let Some(union) = &group.union {
        collect_group_variables(query, &union.0, out);
        collect_group_variables(query, &union.1, out);
    }
    for optional in &group.optionals {
        collect_group_variables(query, optional, out);
    }
}

/// Estimated selectivity: constants narrow the index lookup the most,
/// already-bound variables nearly as much.
fn selectivity_score(query: &Query, pattern: &TriplePattern, bound: &FxHashSet<String>) -> usize {
    let mut score = 0;
    for term in [pattern.subject, pattern.predicate, pattern.object] {
        match query.variable_name(term) {
            None => score += 2,
            Some(name) if bound.contains(name) => score += 2,
            Some(_) => {}
        }
    }
    score
}

/// Orders a group's required patterns greedily by selectivity and assigns
/// each filter to the earliest level at which it is evaluable.
pub(crate) fn plan_group(
    query: &Query,
    patterns: &[TriplePattern],
    filters: &[Span],
    prebound: &FxHashSet<String>,
) -> GroupPlan {
    let mut bound = prebound.clone();
    let mut remaining: Vec<usize> = (0..patterns.len()).collect();
    let mut order = Vec::with_capacity(patterns.len());
    let mut bound_after = Vec::with_capacity(patterns.len());
    while !remaining.is_empty() {
        let pick = remaining
            .iter()
            .enumerate()
            .max_by_key(|(position, index)| {
                // Stable tie-break on source order: earlier patterns win.
                (
                    selectivity_score(query, &patterns[**index], &bound),
                    usize::MAX - *position,
                )
            })
            .map_or(0, |(position, _)| position);
        let index = remaining.remove(pick);
        bound.extend(pattern_variables(query, &patterns[index]));
        order.push(index);
        bound_after.push(bound.clone());
    }
    let mut filters_at = vec![Vec::new(); order.len()];
    let mut residual = Vec::new();
    for filter in filters {
        let needed = expression_variables(query.span_text(*filter));
        if needed.is_subset(prebound) && !order.is_empty() {
            filters_at[0].push(*filter);
            continue;
        }
        let level = bound_after
            .iter()
            .position(|bound| needed.iter().all(|v| bound.contains(v) || prebound.contains(v)));
        match level {
            Some(level) => filters_at[level].push(*filter),
            None => residual.push(*filter),
        }
    }
    tracing::trace!(patterns = patterns.len(), ?order, "planned join order");
    GroupPlan {
        order,
        filters_at,
        residual,
    }
}

/// Local-first vs service-first for a group with a `SERVICE` clause:
/// run local patterns first when at least one of them is selective
/// (two or more concrete positions), otherwise fetch the service first.
pub(crate) fn service_first(query: &Query, patterns: &[TriplePattern]) -> bool {
    let empty = FxHashSet::default();
    let selective_local = patterns
        .iter()
        .any(|pattern| selectivity_score(query, pattern, &empty) >= 4);
    let decision = !selective_local;
    tracing::debug!(service_first = decision, "planned service order");
    decision
}

/// Applies a plan's permutation to the pattern list.
pub(crate) fn ordered_patterns(
    patterns: &[TriplePattern],
    plan: &GroupPlan,
) -> Vec<TriplePattern> {
    plan.order.iter().map(|i| patterns[*i]).collect()
}

/// Terms referenced by `SELECT *`-style projection of a pattern, used by
/// service scans to pick join keys.
pub(crate) fn shared_variables(
    query: &Query,
    service_pattern: &GraphPattern,
    rest: &GraphPattern,
) -> Vec<String> {
    let service_vars = group_variables(query, service_pattern);
    let outer_vars = group_variables(query, rest);
    let mut shared: Vec<String> = service_vars
        .intersection(&outer_vars)
        .cloned()
        .collect();
    shared.sort();
    shared
}
