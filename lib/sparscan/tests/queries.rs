//! End-to-end SELECT / ASK / CONSTRUCT / DESCRIBE behavior.

mod common;

use common::{int_lit, lex, solutions, store_with, QueryBuilder};
use quadmem::Triple;
use sparscan::{
    AggregateFunction, PathMode, QueryExecutor, QueryOutcome, Value,
};

#[test]
fn join_consistency() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/knows>", "<http://e/b>"),
        ("<http://e/b>", "<http://e/knows>", "<http://e/c>"),
        ("<http://e/a>", "<http://e/age>", "\"30\""),
    ]);
    let query = QueryBuilder::select(&["?x", "?y"])
        .triple("?x", "<http://e/knows>", "?y")
        .triple("?y", "<http://e/knows>", "?z")
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(lex(&rows[0], "x").unwrap(), "<http://e/a>");
    assert_eq!(lex(&rows[0], "y").unwrap(), "<http://e/b>");
}

#[test]
fn optional_leaves_variables_unbound() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/name>", "\"A\""),
        ("<http://e/b>", "<http://e/name>", "\"B\""),
        ("<http://e/a>", "<http://e/email>", "\"a@x\""),
    ]);
    let query = QueryBuilder::select(&["?n", "?e"])
        .triple("?s", "<http://e/name>", "?n")
        .optional(|q| q.triple("?s", "<http://e/email>", "?e"))
        .build();
    let mut rows: Vec<(String, Option<String>)> = solutions(&store, &query)
        .iter()
        .map(|row| (lex(row, "n").unwrap(), lex(row, "e")))
        .collect();
    rows.sort();
    assert_eq!(
        rows,
        vec![
            ("\"A\"".to_owned(), Some("\"a@x\"".to_owned())),
            ("\"B\"".to_owned(), None),
        ]
    );
}

#[test]
fn minus_with_disjoint_domain_excludes_nothing() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/b>", "<http://e/p>", "\"2\""),
    ]);
    let query = QueryBuilder::select(&["?s"])
        .triple("?s", "<http://e/p>", "?v")
        .minus(|q| q.triple("?x", "<http://e/q>", "?y"))
        .build();
    assert_eq!(solutions(&store, &query).len(), 2);
}

#[test]
fn minus_excludes_on_agreement() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/b>", "<http://e/p>", "\"2\""),
        ("<http://e/a>", "<http://e/q>", "\"x\""),
    ]);
    let query = QueryBuilder::select(&["?s"])
        .triple("?s", "<http://e/p>", "?v")
        .minus(|q| q.triple("?s", "<http://e/q>", "?y"))
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(lex(&rows[0], "s").unwrap(), "<http://e/b>");
}

#[test]
fn nested_minus_negates_the_inner_exclusion() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/b>", "<http://e/p>", "\"2\""),
        ("<http://e/a>", "<http://e/q>", "\"5\""),
        ("<http://e/b>", "<http://e/q>", "\"6\""),
        ("<http://e/b>", "<http://e/r>", "\"7\""),
    ]);
    // MINUS { ?s q ?w MINUS { ?s r ?x } }: the inner MINUS removes <b>
    // from the block, so only <a> is excluded outside.
    let query = QueryBuilder::select(&["?s"])
        .triple("?s", "<http://e/p>", "?v")
        .minus(|q| {
            q.triple("?s", "<http://e/q>", "?w")
                .minus(|inner| inner.triple("?s", "<http://e/r>", "?x"))
        })
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(lex(&rows[0], "s").unwrap(), "<http://e/b>");
}

#[test]
fn minus_with_exists_sees_combined_bindings() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/b>", "<http://e/p>", "\"2\""),
        ("<http://e/a>", "<http://e/q>", "\"x\""),
    ]);
    // The MINUS block repeats the outer pattern but only counts when the
    // EXISTS over the combined bindings holds.
    let query = QueryBuilder::select(&["?s"])
        .triple("?s", "<http://e/p>", "?v")
        .minus(|q| {
            q.triple("?s", "<http://e/p>", "?v")
                .exists(|e| e.triple("?s", "<http://e/q>", "?w"))
        })
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(lex(&rows[0], "s").unwrap(), "<http://e/b>");
}

#[test]
fn transitive_path_has_no_reflexive_solution() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/r>", "<http://e/b>"),
        ("<http://e/b>", "<http://e/r>", "<http://e/c>"),
        ("<http://e/c>", "<http://e/r>", "<http://e/d>"),
    ]);
    let query = QueryBuilder::select(&["?end"])
        .path("<http://e/a>", "<http://e/r>", PathMode::OneOrMore, "?end")
        .build();
    let mut ends: Vec<String> = solutions(&store, &query)
        .iter()
        .map(|row| lex(row, "end").unwrap())
        .collect();
    ends.sort();
    assert_eq!(ends, vec!["<http://e/b>", "<http://e/c>", "<http://e/d>"]);
}

#[test]
fn distinct_collapses_repeated_types() {
    // The `a` shorthand expands to the full rdf:type IRI.
    let store = store_with(&[
        (
            "<http://e/x>",
            "<http://www.w3.org/1999/02/22-rdf-syntax-ns#type>",
            "<http://e/T>",
        ),
        (
            "<http://e/y>",
            "<http://www.w3.org/1999/02/22-rdf-syntax-ns#type>",
            "<http://e/T>",
        ),
        (
            "<http://e/z>",
            "<http://www.w3.org/1999/02/22-rdf-syntax-ns#type>",
            "<http://e/U>",
        ),
    ]);
    let query = QueryBuilder::select(&["?t"])
        .distinct()
        .triple("?s", "a", "?t")
        .build();
    let mut types: Vec<String> = solutions(&store, &query)
        .iter()
        .map(|row| lex(row, "t").unwrap())
        .collect();
    types.sort();
    assert_eq!(types, vec!["<http://e/T>", "<http://e/U>"]);
}

#[test]
fn exists_filter_keeps_matching_subjects() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/a>", "<http://e/q>", "\"2\""),
        ("<http://e/b>", "<http://e/p>", "\"3\""),
    ]);
    let query = QueryBuilder::select(&["?s"])
        .triple("?s", "<http://e/p>", "?v")
        .exists(|q| q.triple("?s", "<http://e/q>", "?w"))
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(lex(&rows[0], "s").unwrap(), "<http://e/a>");
}

#[test]
fn not_exists_inverts_the_filter() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/a>", "<http://e/q>", "\"2\""),
        ("<http://e/b>", "<http://e/p>", "\"3\""),
    ]);
    let query = QueryBuilder::select(&["?s"])
        .triple("?s", "<http://e/p>", "?v")
        .not_exists(|q| q.triple("?s", "<http://e/q>", "?w"))
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(lex(&rows[0], "s").unwrap(), "<http://e/b>");
}

#[test]
fn union_emits_first_branch_then_second() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/b>", "<http://e/q>", "\"2\""),
    ]);
    let query = QueryBuilder::select(&["?s"])
        .union(
            |a| a.triple("?s", "<http://e/p>", "?v"),
            |b| b.triple("?s", "<http://e/q>", "?v"),
        )
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 2);
    assert_eq!(lex(&rows[0], "s").unwrap(), "<http://e/a>");
    assert_eq!(lex(&rows[1], "s").unwrap(), "<http://e/b>");
}

#[test]
fn bind_extends_and_filter_restricts() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", int_lit(3).as_str()),
        ("<http://e/b>", "<http://e/p>", int_lit(7).as_str()),
    ]);
    let query = QueryBuilder::select(&["?s", "?d"])
        .triple("?s", "<http://e/p>", "?v")
        .bind("?v * 2", "?d")
        .filter("?d > 10")
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(lex(&rows[0], "s").unwrap(), "<http://e/b>");
    assert_eq!(rows[0].get("d"), Some(&Value::Int(14)));
}

#[test]
fn inline_values_joins_and_post_values_constrains() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/b>", "<http://e/p>", "\"2\""),
        ("<http://e/c>", "<http://e/p>", "\"3\""),
    ]);
    let query = QueryBuilder::select(&["?s", "?v"])
        .values(&["?s"], &[&[Some("<http://e/a>")], &[Some("<http://e/b>")]])
        .triple("?s", "<http://e/p>", "?v")
        .build();
    let mut rows: Vec<String> = solutions(&store, &query)
        .iter()
        .map(|row| lex(row, "s").unwrap())
        .collect();
    rows.sort();
    assert_eq!(rows, vec!["<http://e/a>", "<http://e/b>"]);

    let query = QueryBuilder::select(&["?s", "?v"])
        .triple("?s", "<http://e/p>", "?v")
        .post_values(&["?v"], &[&[Some("\"2\"")]])
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(lex(&rows[0], "s").unwrap(), "<http://e/b>");
}

#[test]
fn order_offset_limit_pipeline() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", int_lit(3).as_str()),
        ("<http://e/b>", "<http://e/p>", int_lit(1).as_str()),
        ("<http://e/c>", "<http://e/p>", int_lit(2).as_str()),
        ("<http://e/d>", "<http://e/p>", int_lit(4).as_str()),
    ]);
    let query = QueryBuilder::select(&["?s", "?v"])
        .triple("?s", "<http://e/p>", "?v")
        .order_by("?v", false)
        .offset(1)
        .limit(2)
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 2);
    assert_eq!(lex(&rows[0], "s").unwrap(), "<http://e/c>");
    assert_eq!(lex(&rows[1], "s").unwrap(), "<http://e/a>");

    let query = QueryBuilder::select(&["?s"])
        .triple("?s", "<http://e/p>", "?v")
        .order_by("?v", true)
        .limit(1)
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(lex(&rows[0], "s").unwrap(), "<http://e/d>");
}

#[test]
fn aggregates_per_group() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", int_lit(1).as_str()),
        ("<http://e/a>", "<http://e/p>", int_lit(2).as_str()),
        ("<http://e/b>", "<http://e/p>", int_lit(5).as_str()),
    ]);
    let query = QueryBuilder::select(&["?s"])
        .aggregate(AggregateFunction::Count, false, Some("?v"), "?n")
        .aggregate(AggregateFunction::Sum, false, Some("?v"), "?total")
        .aggregate(AggregateFunction::Avg, false, Some("?v"), "?mean")
        .aggregate(AggregateFunction::Min, false, Some("?v"), "?low")
        .aggregate(AggregateFunction::Max, false, Some("?v"), "?high")
        .triple("?s", "<http://e/p>", "?v")
        .group_by("?s")
        .build();
    let mut rows = solutions(&store, &query);
    rows.sort_by_key(|row| lex(row, "s"));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("n"), Some(&Value::Int(2)));
    assert_eq!(rows[0].get("total"), Some(&Value::Int(3)));
    assert_eq!(rows[0].get("mean"), Some(&Value::Float(1.5)));
    assert_eq!(rows[0].get("low"), Some(&Value::typed("1", "http://www.w3.org/2001/XMLSchema#integer")));
    assert_eq!(rows[0].get("high"), Some(&Value::typed("2", "http://www.w3.org/2001/XMLSchema#integer")));
    assert_eq!(rows[1].get("n"), Some(&Value::Int(1)));
    assert_eq!(rows[1].get("total"), Some(&Value::Int(5)));
}

#[test]
fn count_distinct_group_concat_and_having() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"x\""),
        ("<http://e/a>", "<http://e/p>", "\"x\""),
        ("<http://e/a>", "<http://e/p>", "\"y\""),
        ("<http://e/b>", "<http://e/p>", "\"z\""),
    ]);
    let query = QueryBuilder::select(&["?s"])
        .aggregate(AggregateFunction::Count, true, Some("?v"), "?n")
        .group_concat("?v", "|", "?joined")
        .triple("?s", "<http://e/p>", "?v")
        .group_by("?s")
        .having("?n >= 2")
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(lex(&rows[0], "s").unwrap(), "<http://e/a>");
    assert_eq!(rows[0].get("n"), Some(&Value::Int(2)));
    let Some(Value::Str { text, .. }) = rows[0].get("joined") else {
        panic!("GROUP_CONCAT must produce a string");
    };
    let mut parts: Vec<&str> = text.split('|').collect();
    parts.sort_unstable();
    assert_eq!(parts, vec!["x", "x", "y"]);
}

#[test]
fn count_star_over_everything() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/b>", "<http://e/p>", "\"2\""),
    ]);
    let query = QueryBuilder::select(&[])
        .aggregate(AggregateFunction::Count, false, None, "?n")
        .triple("?s", "<http://e/p>", "?v")
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("n"), Some(&Value::Int(2)));
}

#[test]
fn subquery_joins_with_outer_patterns() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/b>", "<http://e/p>", "\"2\""),
        ("<http://e/a>", "<http://e/q>", "\"x\""),
    ]);
    let query = QueryBuilder::select(&["?s", "?w"])
        .subquery(&["?s"], false, None, 0, |sub| {
            sub.triple("?s", "<http://e/p>", "?v")
        })
        .triple("?s", "<http://e/q>", "?w")
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(lex(&rows[0], "s").unwrap(), "<http://e/a>");
    assert_eq!(lex(&rows[0], "w").unwrap(), "\"x\"");
}

#[test]
fn subquery_limit_applies_before_the_join() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/a>", "<http://e/p>", "\"2\""),
        ("<http://e/a>", "<http://e/p>", "\"3\""),
    ]);
    let query = QueryBuilder::select(&["?v"])
        .subquery(&["?v"], false, Some(2), 0, |sub| {
            sub.triple("?s", "<http://e/p>", "?v")
        })
        .build();
    assert_eq!(solutions(&store, &query).len(), 2);
}

#[test]
fn ask_reports_match_presence() {
    let store = store_with(&[("<http://e/a>", "<http://e/p>", "\"1\"")]);
    let yes = QueryBuilder::ask().triple("?s", "<http://e/p>", "?v").build();
    let QueryOutcome::Boolean(found) = QueryExecutor::new().execute(&store, &yes).unwrap() else {
        panic!("ASK must produce a boolean");
    };
    assert!(found);
    let no = QueryBuilder::ask().triple("?s", "<http://e/q>", "?v").build();
    let QueryOutcome::Boolean(found) = QueryExecutor::new().execute(&store, &no).unwrap() else {
        panic!("ASK must produce a boolean");
    };
    assert!(!found);
}

#[test]
fn construct_instantiates_the_template() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/b>", "<http://e/p>", "\"2\""),
    ]);
    let query = QueryBuilder::construct(&[("?s", "<http://e/derived>", "?v")])
        .triple("?s", "<http://e/p>", "?v")
        .build();
    let QueryOutcome::Graph(triples) = QueryExecutor::new().execute(&store, &query).unwrap()
    else {
        panic!("CONSTRUCT must produce triples");
    };
    let mut triples: Vec<Triple> = triples.collect::<Result<_, _>>().unwrap();
    triples.sort();
    assert_eq!(
        triples,
        vec![
            Triple::new("<http://e/a>", "<http://e/derived>", "\"1\""),
            Triple::new("<http://e/b>", "<http://e/derived>", "\"2\""),
        ]
    );
}

#[test]
fn describe_returns_subject_quads() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/a>", "<http://e/q>", "\"2\""),
        ("<http://e/b>", "<http://e/p>", "\"3\""),
    ]);
    let query = QueryBuilder::describe(&["<http://e/a>"]).build();
    let QueryOutcome::Graph(triples) = QueryExecutor::new().execute(&store, &query).unwrap()
    else {
        panic!("DESCRIBE must produce triples");
    };
    let mut triples: Vec<Triple> = triples.collect::<Result<_, _>>().unwrap();
    triples.sort();
    assert_eq!(triples.len(), 2);
    assert!(triples.iter().all(|t| t.subject == "<http://e/a>"));
}

#[test]
fn prefixed_names_expand_through_the_prefix_table() {
    let store = store_with(&[("<http://e/a>", "<http://e/knows>", "<http://e/b>")]);
    let query = QueryBuilder::select(&["?x"])
        .prefix("ex", "http://e/")
        .triple("?x", "ex:knows", "?y")
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(lex(&rows[0], "x").unwrap(), "<http://e/a>");
}

#[test]
fn bnode_bind_is_stable_within_a_row_and_fresh_across_rows() {
    let store = store_with(&[
        ("<http://e/a>", "<http://e/p>", "\"1\""),
        ("<http://e/b>", "<http://e/p>", "\"2\""),
    ]);
    let query = QueryBuilder::select(&["?n1", "?n2"])
        .triple("?s", "<http://e/p>", "?v")
        .bind("BNODE(\"k\")", "?n1")
        .bind("BNODE(\"k\")", "?n2")
        .build();
    let rows = solutions(&store, &query);
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(lex(row, "n1"), lex(row, "n2"));
    }
    assert_ne!(lex(&rows[0], "n1"), lex(&rows[1], "n1"));
}
