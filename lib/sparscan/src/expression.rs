//! The `FILTER` / `BIND` expression language.
//!
//! Expressions reach the engine as spans into the query source text and are
//! evaluated by a recursive-descent walk over the characters, one call per
//! row. Type errors are contained: every failure evaluates to
//! [`Value::Unbound`], which makes a `FILTER` fail and leaves a `BIND`
//! target unbound.

use crate::binding::{BindingTable, Value};
use crate::query::{fnv1a32, Query, Span};
use crate::vocab::xsd;
use md5::{Digest, Md5};
use oxiri::Iri;
use oxsdatatypes::DateTime;
use rand::random;
use regex::{Regex, RegexBuilder};
use rustc_hash::FxHashMap;
use sha1::Sha1;
use sha2::{Sha256, Sha384, Sha512};
use std::cmp::Ordering;

const REGEX_SIZE_LIMIT: usize = 1_000_000;

const RDF_LANG_STRING: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#langString";

/// Mutable per-execution evaluation state shared by all expression calls.
pub(crate) struct EvalScratch {
    /// Compiled-pattern cache for `REGEX` / `REPLACE`, keyed by
    /// `(pattern, flags)`.
    regex_cache: FxHashMap<(String, String), Option<Regex>>,
    /// Incremented by the driver before each row's `BIND` evaluation;
    /// `BNODE(str)` mixes it into the generated label so the same string
    /// maps to the same blank node within a row and to fresh ones across
    /// rows.
    pub row_seed: u64,
    /// Monotone counter backing argument-less `BNODE()`.
    fresh_bnode: u64,
    /// `NOW()` is fixed for the whole execution.
    now: DateTime,
}

impl EvalScratch {
    pub fn new() -> Self {
        Self {
            regex_cache: FxHashMap::default(),
            row_seed: 0,
            fresh_bnode: 0,
            now: DateTime::now(),
        }
    }

    fn compiled(&mut self, pattern: &str, flags: &str) -> Option<Regex> {
        let key = (pattern.to_owned(), flags.to_owned());
        self.regex_cache
            .entry(key)
            .or_insert_with(|| compile_pattern(pattern, flags))
            .clone()
    }
}

/// Evaluates the expression at `span` against the current bindings.
pub(crate) fn evaluate(
    query: &Query,
    span: Span,
    bindings: &BindingTable,
    scratch: &mut EvalScratch,
) -> Value {
    let text = query.span_text(span);
    let mut parser = ExprParser {
        text,
        pos: 0,
        query,
        bindings,
        scratch,
    };
    let value = parser.parse_or();
    parser.skip_ws();
    if parser.pos < parser.text.len() {
        // Trailing garbage means the span is not a well-formed expression.
        return Value::Unbound;
    }
    value
}

/// The SPARQL effective boolean value; `None` is a type error.
pub(crate) fn effective_boolean(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Int(i) => Some(*i != 0),
        Value::Float(f) => Some(!f.is_nan() && *f != 0.0),
        Value::Str {
            text,
            language: None,
            datatype,
        } => match datatype.as_deref() {
            None => Some(!text.is_empty()),
            Some(dt) if dt == xsd::STRING => Some(!text.is_empty()),
            Some(dt) if dt == xsd::BOOLEAN => match text.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            Some(dt) if xsd::is_numeric(dt) => {
                let n = numeric(value)?;
                match n {
                    Numeric::Int(i) => Some(i != 0),
                    Numeric::Float(f) => Some(!f.is_nan() && f != 0.0),
                }
            }
            _ => None,
        },
        _ => None,
    }
}

/// `FILTER` semantics: errors and non-boolean results count as false.
pub(crate) fn filter_passes(
    query: &Query,
    span: Span,
    bindings: &BindingTable,
    scratch: &mut EvalScratch,
) -> bool {
    effective_boolean(&evaluate(query, span, bindings, scratch)) == Some(true)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Numeric {
    Int(i64),
    Float(f64),
}

/// The numeric interpretation of a value, parsing string operands on
/// demand.
pub(crate) fn numeric(value: &Value) -> Option<Numeric> {
    match value {
        Value::Int(i) => Some(Numeric::Int(*i)),
        Value::Float(f) => Some(Numeric::Float(*f)),
        Value::Str {
            text,
            language: None,
            ..
        } => parse_number(text),
        _ => None,
    }
}

fn parse_number(text: &str) -> Option<Numeric> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.contains(['.', 'e', 'E']) {
        if let Ok(i) = trimmed.parse::<i64>() {
            return Some(Numeric::Int(i));
        }
    }
    match trimmed {
        "INF" | "+INF" => return Some(Numeric::Float(f64::INFINITY)),
        "-INF" => return Some(Numeric::Float(f64::NEG_INFINITY)),
        "NaN" => return Some(Numeric::Float(f64::NAN)),
        _ => {}
    }
    trimmed.parse::<f64>().ok().map(Numeric::Float)
}

fn numeric_value(n: Numeric) -> Value {
    match n {
        Numeric::Int(i) => Value::Int(i),
        Numeric::Float(f) => {
            if f.is_nan() || f.is_infinite() {
                Value::Unbound
            } else {
                Value::Float(f)
            }
        }
    }
}

fn as_float(n: Numeric) -> f64 {
    match n {
        Numeric::Int(i) => i as f64,
        Numeric::Float(f) => f,
    }
}

/// Arithmetic with the promotion rules: `Int op Int` stays integral when
/// representable, every other numeric mix widens to `Float`; NaN,
/// infinities and division by zero yield `Unbound`.
pub(crate) fn arithmetic(op: char, left: &Value, right: &Value) -> Value {
    let (Some(a), Some(b)) = (numeric(left), numeric(right)) else {
        return Value::Unbound;
    };
    if let (Numeric::Int(x), Numeric::Int(y)) = (a, b) {
        let exact = match op {
            '+' => x.checked_add(y),
            '-' => x.checked_sub(y),
            '*' => x.checked_mul(y),
            '/' => {
                if y == 0 {
                    return Value::Unbound;
                }
                (x % y == 0).then(|| x / y)
            }
            _ => None,
        };
        if let Some(v) = exact {
            return Value::Int(v);
        }
    }
    let (x, y) = (as_float(a), as_float(b));
    numeric_value(Numeric::Float(match op {
        '+' => x + y,
        '-' => x - y,
        '*' => x * y,
        '/' => x / y,
        _ => return Value::Unbound,
    }))
}

fn datetime_of(value: &Value) -> Option<DateTime> {
    match value {
        Value::Str {
            text,
            language: None,
            datatype: Some(dt),
        } if dt == xsd::DATE_TIME
            || dt == "http://www.w3.org/2001/XMLSchema#dateTimeStamp" =>
        {
            text.parse().ok()
        }
        _ => None,
    }
}

/// Value equality under SPARQL operator semantics: numeric when both sides
/// are numeric, otherwise term-shaped. `None` means the comparison itself
/// is an error.
fn values_equal(left: &Value, right: &Value) -> Option<bool> {
    if left.is_unbound() || right.is_unbound() {
        return None;
    }
    if let (Some(a), Some(b)) = (numeric(left), numeric(right)) {
        if matches!(left, Value::Int(_) | Value::Float(_))
            || matches!(right, Value::Int(_) | Value::Float(_))
            || is_numeric_literal(left) && is_numeric_literal(right)
        {
            return Some(match (a, b) {
                (Numeric::Int(x), Numeric::Int(y)) => x == y,
                _ => as_float(a) == as_float(b),
            });
        }
    }
    if let (Some(a), Some(b)) = (datetime_of(left), datetime_of(right)) {
        return Some(a == b);
    }
    Some(left.same_term(right))
}

fn is_numeric_literal(value: &Value) -> bool {
    match value {
        Value::Int(_) | Value::Float(_) => true,
        Value::Str {
            datatype: Some(dt),
            language: None,
            ..
        } => xsd::is_numeric(dt),
        _ => false,
    }
}

/// Operator ordering (`<`, `<=`, ...). `None` when the operands are not
/// comparable, which makes the enclosing `FILTER` fail.
fn values_ordering(left: &Value, right: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (numeric(left), numeric(right)) {
        if is_numeric_literal(left) && is_numeric_literal(right)
            || matches!(left, Value::Int(_) | Value::Float(_))
            || matches!(right, Value::Int(_) | Value::Float(_))
        {
            return as_float(a).partial_cmp(&as_float(b));
        }
    }
    if let (Some(a), Some(b)) = (datetime_of(left), datetime_of(right)) {
        return a.partial_cmp(&b);
    }
    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (
            Value::Str {
                text: a,
                language: la,
                datatype: da,
            },
            Value::Str {
                text: b,
                language: lb,
                datatype: db,
            },
        ) if la == lb && plain_or_string(da) && plain_or_string(db) => Some(a.cmp(b)),
        _ => None,
    }
}

fn plain_or_string(datatype: &Option<String>) -> bool {
    match datatype {
        None => true,
        Some(dt) => dt == xsd::STRING,
    }
}

/// A total order over values for `ORDER BY`: unbound, then blank nodes,
/// then IRIs, then literals (numerics by value, the rest by lexical form).
pub(crate) fn compare_order(left: &Value, right: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Unbound => 0,
            Value::Str { text, language, datatype }
                if text.starts_with("_:") && language.is_none() && datatype.is_none() =>
            {
                1
            }
            Value::Iri(_) => 2,
            _ => 3,
        }
    }
    let (ra, rb) = (rank(left), rank(right));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match ra {
        0 => Ordering::Equal,
        2 => {
            if let (Value::Iri(a), Value::Iri(b)) = (left, right) {
                a.cmp(b)
            } else {
                Ordering::Equal
            }
        }
        _ => {
            if let Some(ordering) = values_ordering(left, right) {
                return ordering;
            }
            let a = left.lexical_form().unwrap_or_default();
            let b = right.lexical_form().unwrap_or_default();
            a.cmp(&b)
        }
    }
}

struct ExprParser<'a> {
    text: &'a str,
    pos: usize,
    query: &'a Query,
    bindings: &'a BindingTable,
    scratch: &'a mut EvalScratch,
}

impl ExprParser<'_> {
    fn skip_ws(&mut self) {
        while self
            .text[self.pos..]
            .starts_with(|c: char| c.is_ascii_whitespace())
        {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.text[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn eat_str(&mut self, s: &str) -> bool {
        if self.text[self.pos..].starts_with(s) {
            self.pos += s.len();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let rest = &self.text[self.pos..];
        if rest.len() >= keyword.len()
            && rest[..keyword.len()].eq_ignore_ascii_case(keyword)
            && !rest[keyword.len()..].starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Value {
        let mut left = self.parse_and();
        loop {
            self.skip_ws();
            if !self.eat_str("||") {
                return left;
            }
            let right = self.parse_and();
            left = match (effective_boolean(&left), effective_boolean(&right)) {
                (Some(true), _) | (_, Some(true)) => Value::Bool(true),
                (Some(false), Some(false)) => Value::Bool(false),
                _ => Value::Unbound,
            };
        }
    }

    fn parse_and(&mut self) -> Value {
        let mut left = self.parse_relational();
        loop {
            self.skip_ws();
            if !self.eat_str("&&") {
                return left;
            }
            let right = self.parse_relational();
            left = match (effective_boolean(&left), effective_boolean(&right)) {
                (Some(false), _) | (_, Some(false)) => Value::Bool(false),
                (Some(true), Some(true)) => Value::Bool(true),
                _ => Value::Unbound,
            };
        }
    }

    fn parse_relational(&mut self) -> Value {
        let left = self.parse_additive();
        self.skip_ws();
        if self.eat_keyword("NOT") {
            self.skip_ws();
            if self.eat_keyword("IN") {
                return match self.parse_in_list(&left) {
                    Some(found) => Value::Bool(!found),
                    None => Value::Unbound,
                };
            }
            return Value::Unbound;
        }
        if self.eat_keyword("IN") {
            return match self.parse_in_list(&left) {
                Some(found) => Value::Bool(found),
                None => Value::Unbound,
            };
        }
        let op = if self.eat_str("<=") {
            "<="
        } else if self.eat_str(">=") {
            ">="
        } else if self.eat_str("!=") {
            "!="
        } else if self.eat_str("=") {
            "="
        } else if self.eat_str("<") {
            "<"
        } else if self.eat_str(">") {
            ">"
        } else {
            return left;
        };
        let right = self.parse_additive();
        match op {
            "=" => values_equal(&left, &right).map_or(Value::Unbound, Value::Bool),
            "!=" => values_equal(&left, &right).map_or(Value::Unbound, |eq| Value::Bool(!eq)),
            _ => match values_ordering(&left, &right) {
                Some(ordering) => Value::Bool(match op {
                    "<" => ordering == Ordering::Less,
                    "<=" => ordering != Ordering::Greater,
                    ">" => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                }),
                None => Value::Unbound,
            },
        }
    }

    /// `IN (...)` membership as ORed equalities: `Some(true)` on a match,
    /// `None` when nothing matched but a comparison errored.
    fn parse_in_list(&mut self, needle: &Value) -> Option<bool> {
        self.skip_ws();
        if !self.eat('(') {
            return None;
        }
        let mut found = false;
        let mut errored = false;
        self.skip_ws();
        if !self.eat(')') {
            loop {
                let candidate = self.parse_or();
                match values_equal(needle, &candidate) {
                    Some(true) => found = true,
                    Some(false) => {}
                    None => errored = true,
                }
                self.skip_ws();
                if self.eat(',') {
                    continue;
                }
                if !self.eat(')') {
                    return None;
                }
                break;
            }
        }
        if found {
            Some(true)
        } else if errored {
            None
        } else {
            Some(false)
        }
    }

    fn parse_additive(&mut self) -> Value {
        let mut left = self.parse_multiplicative();
        loop {
            self.skip_ws();
            // Don't confuse a sign that belongs to a numeric literal with
            // the binary operator; additive position always means binary.
            let op = if self.eat('+') {
                '+'
            } else if self.text[self.pos..].starts_with('-')
                && !self.text[self.pos..].starts_with("--")
            {
                self.pos += 1;
                '-'
            } else {
                return left;
            };
            let right = self.parse_multiplicative();
            left = arithmetic(op, &left, &right);
        }
    }

    fn parse_multiplicative(&mut self) -> Value {
        let mut left = self.parse_unary();
        loop {
            self.skip_ws();
            let op = if self.eat('*') {
                '*'
            } else if self.eat('/') {
                '/'
            } else {
                return left;
            };
            let right = self.parse_unary();
            left = arithmetic(op, &left, &right);
        }
    }

    fn parse_unary(&mut self) -> Value {
        self.skip_ws();
        if self.text[self.pos..].starts_with('!') && !self.text[self.pos..].starts_with("!=") {
            self.pos += 1;
            let value = self.parse_unary();
            return match effective_boolean(&value) {
                Some(b) => Value::Bool(!b),
                None => Value::Unbound,
            };
        }
        if self.text[self.pos..].starts_with('-')
            && !self.text[self.pos + 1..].starts_with(|c: char| c.is_ascii_digit() || c == '.')
        {
            self.pos += 1;
            let value = self.parse_unary();
            return match numeric(&value) {
                Some(Numeric::Int(i)) => i.checked_neg().map_or(Value::Unbound, Value::Int),
                Some(Numeric::Float(f)) => numeric_value(Numeric::Float(-f)),
                None => Value::Unbound,
            };
        }
        if self.text[self.pos..].starts_with('+')
            && !self.text[self.pos + 1..].starts_with(|c: char| c.is_ascii_digit() || c == '.')
        {
            self.pos += 1;
            let value = self.parse_unary();
            return match numeric(&value) {
                Some(n) => numeric_value(n),
                None => Value::Unbound,
            };
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Value {
        self.skip_ws();
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let value = self.parse_or();
                self.skip_ws();
                if self.eat(')') {
                    value
                } else {
                    Value::Unbound
                }
            }
            Some('?' | '$') => {
                self.pos += 1;
                let name = self.parse_name();
                self.bindings.get(&name)
            }
            Some('<') => {
                let iri = self.parse_iri_ref();
                self.skip_ws();
                if self.peek() == Some('(') {
                    // Full-IRI cast call, e.g. <http://...#integer>(?x).
                    let args = self.parse_arguments();
                    return cast(&iri, args.first().unwrap_or(&Value::Unbound));
                }
                Value::Iri(iri)
            }
            Some('"') => self.parse_literal(),
            Some(c) if c.is_ascii_digit() || c == '.' => self.parse_number_literal(),
            Some('+' | '-') => self.parse_number_literal(),
            Some(c) if c.is_ascii_alphabetic() || c == '_' => self.parse_call_or_name(),
            _ => Value::Unbound,
        }
    }

    fn parse_name(&mut self) -> String {
        let start = self.pos;
        while self.text[self.pos..]
            .starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        self.text[start..self.pos].to_owned()
    }

    fn parse_iri_ref(&mut self) -> String {
        // Caller saw '<'.
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '>' {
                let iri = self.text[start..self.pos].to_owned();
                self.pos += 1;
                return iri;
            }
            self.pos += c.len_utf8();
        }
        self.text[start..self.pos].to_owned()
    }

    fn parse_literal(&mut self) -> Value {
        // Caller saw '"'.
        self.pos += 1;
        let mut text = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Value::Unbound;
            };
            self.pos += c.len_utf8();
            match c {
                '"' => break,
                '\\' => {
                    let Some(escaped) = self.peek() else {
                        return Value::Unbound;
                    };
                    self.pos += escaped.len_utf8();
                    text.push(match escaped {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        other => other,
                    });
                }
                _ => text.push(c),
            }
        }
        if self.eat('@') {
            let start = self.pos;
            while self.text[self.pos..]
                .starts_with(|c: char| c.is_ascii_alphanumeric() || c == '-')
            {
                self.pos += 1;
            }
            return Value::lang_string(text, &self.text[start..self.pos]);
        }
        if self.eat_str("^^") {
            let datatype = if self.peek() == Some('<') {
                self.parse_iri_ref()
            } else {
                let name = self.parse_prefixed_name();
                match self.expand(&name) {
                    Some(iri) => iri,
                    None => return Value::Unbound,
                }
            };
            if datatype == xsd::STRING {
                return Value::string(text);
            }
            return Value::typed(text, datatype);
        }
        Value::string(text)
    }

    fn parse_number_literal(&mut self) -> Value {
        let start = self.pos;
        if self.peek() == Some('+') || self.peek() == Some('-') {
            self.pos += 1;
        }
        let mut saw_dot = false;
        let mut saw_exp = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => self.pos += 1,
                '.' if !saw_dot && !saw_exp => {
                    saw_dot = true;
                    self.pos += 1;
                }
                'e' | 'E' if !saw_exp => {
                    saw_exp = true;
                    self.pos += 1;
                    if self.peek() == Some('+') || self.peek() == Some('-') {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        let token = &self.text[start..self.pos];
        match parse_number(token) {
            Some(Numeric::Int(i)) => Value::Int(i),
            Some(Numeric::Float(f)) => Value::Float(f),
            None => Value::Unbound,
        }
    }

    fn parse_prefixed_name(&mut self) -> String {
        let start = self.pos;
        while self.text[self.pos..]
            .starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == ':' || c == '-'
                || c == '.')
        {
            self.pos += 1;
        }
        self.text[start..self.pos].to_owned()
    }

    fn expand(&self, prefixed: &str) -> Option<String> {
        if let Some(iri) = self.query.expand_prefixed(prefixed) {
            return Some(iri);
        }
        // The xsd prefix is resolvable even without a prefix table entry.
        prefixed
            .strip_prefix("xsd:")
            .map(|local| format!("{}{local}", xsd::NAMESPACE))
    }

    fn parse_arguments(&mut self) -> Vec<Value> {
        let mut args = Vec::new();
        self.skip_ws();
        if !self.eat('(') {
            return args;
        }
        self.skip_ws();
        if self.eat(')') {
            return args;
        }
        loop {
            args.push(self.parse_or());
            self.skip_ws();
            if self.eat(',') {
                continue;
            }
            let _ = self.eat(')');
            return args;
        }
    }

    fn parse_call_or_name(&mut self) -> Value {
        let name = self.parse_prefixed_name();
        if name.eq_ignore_ascii_case("true") {
            return Value::Bool(true);
        }
        if name.eq_ignore_ascii_case("false") {
            return Value::Bool(false);
        }
        self.skip_ws();
        if self.peek() != Some('(') {
            // A bare prefixed name is an IRI constant.
            return match self.expand(&name) {
                Some(iri) => Value::Iri(iri),
                None => Value::Unbound,
            };
        }
        if name.contains(':') {
            let args = self.parse_arguments();
            return match self.expand(&name) {
                Some(iri) => cast(&iri, args.first().unwrap_or(&Value::Unbound)),
                None => Value::Unbound,
            };
        }
        if name.eq_ignore_ascii_case("BOUND") {
            return self.parse_bound_call();
        }
        let args = self.parse_arguments();
        self.call(&name.to_ascii_uppercase(), args)
    }

    fn parse_bound_call(&mut self) -> Value {
        self.skip_ws();
        if !self.eat('(') {
            return Value::Unbound;
        }
        self.skip_ws();
        if !(self.eat('?') || self.eat('$')) {
            return Value::Unbound;
        }
        let name = self.parse_name();
        self.skip_ws();
        if !self.eat(')') {
            return Value::Unbound;
        }
        Value::Bool(self.bindings.find(&name).is_some())
    }

    fn call(&mut self, name: &str, args: Vec<Value>) -> Value {
        match (name, args.len()) {
            ("IF", 3) => match effective_boolean(&args[0]) {
                Some(true) => args[1].clone(),
                Some(false) => args[2].clone(),
                None => Value::Unbound,
            },
            ("COALESCE", _) => args
                .into_iter()
                .find(|v| !v.is_unbound())
                .unwrap_or(Value::Unbound),
            ("IRI" | "URI", 1) => match &args[0] {
                Value::Iri(iri) => Value::Iri(iri.clone()),
                Value::Str {
                    text,
                    language: None,
                    datatype,
                } if plain_or_string(datatype) => match Iri::parse(text.clone()) {
                    Ok(iri) => Value::Iri(iri.into_inner()),
                    Err(_) => Value::Unbound,
                },
                _ => Value::Unbound,
            },
            ("STR", 1) => match &args[0] {
                Value::Iri(iri) => Value::string(iri.clone()),
                Value::Str { text, .. } => Value::string(text.clone()),
                Value::Int(i) => Value::string(i.to_string()),
                Value::Float(f) => Value::string(f.to_string()),
                Value::Bool(b) => Value::string(if *b { "true" } else { "false" }),
                Value::Unbound => Value::Unbound,
            },
            ("DATATYPE", 1) => match &args[0] {
                Value::Int(_) => Value::Iri(xsd::INTEGER.to_owned()),
                Value::Float(_) => Value::Iri(xsd::DOUBLE.to_owned()),
                Value::Bool(_) => Value::Iri(xsd::BOOLEAN.to_owned()),
                Value::Str {
                    text,
                    language,
                    datatype,
                } => {
                    if text.starts_with("_:") && language.is_none() && datatype.is_none() {
                        Value::Unbound
                    } else if language.is_some() {
                        Value::Iri(RDF_LANG_STRING.to_owned())
                    } else if let Some(dt) = datatype {
                        Value::Iri(dt.clone())
                    } else {
                        Value::Iri(xsd::STRING.to_owned())
                    }
                }
                _ => Value::Unbound,
            },
            ("LANG", 1) => match &args[0] {
                Value::Str { language, .. } => {
                    Value::string(language.clone().unwrap_or_default())
                }
                Value::Int(_) | Value::Float(_) | Value::Bool(_) => Value::string(""),
                _ => Value::Unbound,
            },
            ("LANGMATCHES", 2) => {
                let (Some(tag), Some(range)) =
                    (plain_string(&args[0]), plain_string(&args[1]))
                else {
                    return Value::Unbound;
                };
                Value::Bool(lang_matches(&tag, &range))
            }
            ("STRLEN", 1) => match to_string_and_language(&args[0]) {
                Some((text, _)) => Value::Int(text.chars().count() as i64),
                None => Value::Unbound,
            },
            ("UCASE", 1) => match to_string_and_language(&args[0]) {
                Some((text, language)) => build_plain(text.to_uppercase(), language),
                None => Value::Unbound,
            },
            ("LCASE", 1) => match to_string_and_language(&args[0]) {
                Some((text, language)) => build_plain(text.to_lowercase(), language),
                None => Value::Unbound,
            },
            ("ENCODE_FOR_URI", 1) => match to_string_and_language(&args[0]) {
                Some((text, _)) => Value::string(encode_for_uri(&text)),
                None => Value::Unbound,
            },
            ("STRSTARTS", 2) => match compatible_strings(&args[0], &args[1]) {
                Some((a, b, _)) => Value::Bool(a.starts_with(b.as_str())),
                None => Value::Unbound,
            },
            ("STRENDS", 2) => match compatible_strings(&args[0], &args[1]) {
                Some((a, b, _)) => Value::Bool(a.ends_with(b.as_str())),
                None => Value::Unbound,
            },
            ("CONTAINS", 2) => match compatible_strings(&args[0], &args[1]) {
                Some((a, b, _)) => Value::Bool(a.contains(b.as_str())),
                None => Value::Unbound,
            },
            ("STRBEFORE", 2) => match compatible_strings(&args[0], &args[1]) {
                Some((a, b, language)) => match a.find(b.as_str()) {
                    Some(position) => build_plain(a[..position].to_owned(), language),
                    None => Value::string(""),
                },
                None => Value::Unbound,
            },
            ("STRAFTER", 2) => match compatible_strings(&args[0], &args[1]) {
                Some((a, b, language)) => match a.find(b.as_str()) {
                    Some(position) => build_plain(a[position + b.len()..].to_owned(), language),
                    None => Value::string(""),
                },
                None => Value::Unbound,
            },
            ("SUBSTR", 2 | 3) => self.substr(&args),
            ("CONCAT", _) => {
                let mut out = String::new();
                let mut common: Option<Option<String>> = None;
                for arg in &args {
                    let Some((text, language)) = to_string_and_language(arg) else {
                        return Value::Unbound;
                    };
                    out.push_str(&text);
                    match &common {
                        None => common = Some(language),
                        Some(seen) if *seen == language => {}
                        // Mixed tags: the result drops the tag.
                        Some(_) => common = Some(None),
                    }
                }
                build_plain(out, common.flatten())
            }
            ("REPLACE", 3 | 4) => {
                let (Some((text, language)), Some(pattern), Some(replacement)) = (
                    to_string_and_language(&args[0]),
                    plain_string(&args[1]),
                    plain_string(&args[2]),
                ) else {
                    return Value::Unbound;
                };
                let flags = match args.get(3) {
                    Some(flags) => match plain_string(flags) {
                        Some(flags) => flags,
                        None => return Value::Unbound,
                    },
                    None => String::new(),
                };
                match self.scratch.compiled(&pattern, &flags) {
                    Some(regex) => build_plain(
                        regex.replace_all(&text, replacement.as_str()).into_owned(),
                        language,
                    ),
                    None => Value::Unbound,
                }
            }
            ("REGEX", 2 | 3) => {
                let (Some((text, _)), Some(pattern)) =
                    (to_string_and_language(&args[0]), plain_string(&args[1]))
                else {
                    return Value::Unbound;
                };
                let flags = match args.get(2) {
                    Some(flags) => match plain_string(flags) {
                        Some(flags) => flags,
                        None => return Value::Unbound,
                    },
                    None => String::new(),
                };
                match self.scratch.compiled(&pattern, &flags) {
                    Some(regex) => Value::Bool(regex.is_match(&text)),
                    None => Value::Unbound,
                }
            }
            ("STRDT", 2) => match (&args[0], &args[1]) {
                (
                    Value::Str {
                        text,
                        language: None,
                        datatype: None,
                    },
                    Value::Iri(datatype),
                ) => {
                    if datatype == xsd::STRING {
                        Value::string(text.clone())
                    } else {
                        Value::typed(text.clone(), datatype.clone())
                    }
                }
                _ => Value::Unbound,
            },
            ("STRLANG", 2) => match (plain_string(&args[0]), plain_string(&args[1])) {
                (Some(text), Some(language)) if !language.is_empty() => {
                    Value::lang_string(text, language.to_lowercase())
                }
                _ => Value::Unbound,
            },
            ("SAMETERM", 2) => {
                if args[0].is_unbound() || args[1].is_unbound() {
                    Value::Unbound
                } else {
                    Value::Bool(args[0].same_term(&args[1]))
                }
            }
            ("ISIRI" | "ISURI", 1) => match &args[0] {
                Value::Unbound => Value::Unbound,
                Value::Iri(_) => Value::Bool(true),
                _ => Value::Bool(false),
            },
            ("ISBLANK", 1) => match &args[0] {
                Value::Unbound => Value::Unbound,
                Value::Str {
                    text,
                    language: None,
                    datatype: None,
                } => Value::Bool(text.starts_with("_:")),
                _ => Value::Bool(false),
            },
            ("ISLITERAL", 1) => match &args[0] {
                Value::Unbound => Value::Unbound,
                Value::Int(_) | Value::Float(_) | Value::Bool(_) => Value::Bool(true),
                Value::Str {
                    text,
                    language: None,
                    datatype: None,
                } => Value::Bool(!text.starts_with("_:")),
                Value::Str { .. } => Value::Bool(true),
                Value::Iri(_) => Value::Bool(false),
            },
            ("ISNUMERIC", 1) => match &args[0] {
                Value::Unbound => Value::Unbound,
                Value::Int(_) | Value::Float(_) => Value::Bool(true),
                value @ Value::Str {
                    datatype: Some(dt),
                    language: None,
                    ..
                } => Value::Bool(xsd::is_numeric(dt) && numeric(value).is_some()),
                _ => Value::Bool(false),
            },
            ("ABS", 1) => match numeric(&args[0]) {
                Some(Numeric::Int(i)) => i
                    .checked_abs()
                    .map_or(numeric_value(Numeric::Float((i as f64).abs())), Value::Int),
                Some(Numeric::Float(f)) => numeric_value(Numeric::Float(f.abs())),
                None => Value::Unbound,
            },
            ("CEIL", 1) => self.rounding(&args[0], f64::ceil),
            ("FLOOR", 1) => self.rounding(&args[0], f64::floor),
            // f64::round is round-half-away-from-zero, exactly the SPARQL
            // behavior.
            ("ROUND", 1) => self.rounding(&args[0], f64::round),
            ("RAND", 0) => Value::Float(random::<f64>()),
            ("NOW", 0) => Value::typed(self.scratch.now.to_string(), xsd::DATE_TIME),
            ("YEAR", 1) => match datetime_of(&args[0]) {
                Some(dt) => Value::Int(i64::from(dt.year())),
                None => Value::Unbound,
            },
            ("MONTH", 1) => match datetime_of(&args[0]) {
                Some(dt) => Value::Int(i64::from(dt.month())),
                None => Value::Unbound,
            },
            ("DAY", 1) => match datetime_of(&args[0]) {
                Some(dt) => Value::Int(i64::from(dt.day())),
                None => Value::Unbound,
            },
            ("HOURS", 1) => match datetime_of(&args[0]) {
                Some(dt) => Value::Int(i64::from(dt.hour())),
                None => Value::Unbound,
            },
            ("MINUTES", 1) => match datetime_of(&args[0]) {
                Some(dt) => Value::Int(i64::from(dt.minute())),
                None => Value::Unbound,
            },
            ("SECONDS", 1) => match datetime_of(&args[0]) {
                Some(dt) => match dt.second().to_string().parse::<f64>() {
                    Ok(seconds) => Value::Float(seconds),
                    Err(_) => Value::Unbound,
                },
                None => Value::Unbound,
            },
            ("TZ", 1) => match datetime_of(&args[0]) {
                Some(dt) => Value::string(
                    dt.timezone_offset()
                        .map(|offset| offset.to_string())
                        .unwrap_or_default(),
                ),
                None => Value::Unbound,
            },
            ("TIMEZONE", 1) => match datetime_of(&args[0]).and_then(|dt| dt.timezone()) {
                Some(duration) => Value::typed(duration.to_string(), xsd::DAY_TIME_DURATION),
                None => Value::Unbound,
            },
            ("MD5", 1) => hash_arg::<Md5>(&args[0]),
            ("SHA1", 1) => hash_arg::<Sha1>(&args[0]),
            ("SHA256", 1) => hash_arg::<Sha256>(&args[0]),
            ("SHA384", 1) => hash_arg::<Sha384>(&args[0]),
            ("SHA512", 1) => hash_arg::<Sha512>(&args[0]),
            ("UUID", 0) => {
                let mut buffer = String::with_capacity(45);
                buffer.push_str("urn:uuid:");
                generate_uuid(&mut buffer);
                Value::Iri(buffer)
            }
            ("STRUUID", 0) => {
                let mut buffer = String::with_capacity(36);
                generate_uuid(&mut buffer);
                Value::string(buffer)
            }
            ("BNODE", 0) => {
                self.scratch.fresh_bnode += 1;
                Value::string(format!("_:rb{}", self.scratch.fresh_bnode))
            }
            ("BNODE", 1) => match plain_string(&args[0]) {
                // Stable within a row, fresh across rows: the driver bumps
                // row_seed before each row's BIND evaluation.
                Some(text) => Value::string(format!(
                    "_:g{}h{:08x}",
                    self.scratch.row_seed,
                    fnv1a32(&text)
                )),
                None => Value::Unbound,
            },
            _ => Value::Unbound,
        }
    }

    fn rounding(&self, value: &Value, f: fn(f64) -> f64) -> Value {
        match numeric(value) {
            Some(Numeric::Int(i)) => Value::Int(i),
            Some(Numeric::Float(x)) => numeric_value(Numeric::Float(f(x))),
            None => Value::Unbound,
        }
    }

    fn substr(&self, args: &[Value]) -> Value {
        let Some((text, language)) = to_string_and_language(&args[0]) else {
            return Value::Unbound;
        };
        let Some(Numeric::Int(start)) = numeric(&args[1]) else {
            return Value::Unbound;
        };
        let length = match args.get(2) {
            Some(arg) => match numeric(arg) {
                Some(Numeric::Int(length)) if length >= 0 => Some(length as usize),
                _ => return Value::Unbound,
            },
            None => None,
        };
        // 1-based start over code points, per the SPARQL definition.
        let skip = start.max(1) as usize - 1;
        let chars = text.chars().skip(skip);
        let result: String = match length {
            Some(length) => {
                let shortened = (start - 1).min(0).unsigned_abs() as usize;
                chars.take(length.saturating_sub(shortened)).collect()
            }
            None => chars.collect(),
        };
        build_plain(result, language)
    }
}

fn plain_string(value: &Value) -> Option<String> {
    match value {
        Value::Str {
            text,
            language: None,
            datatype,
        } if plain_or_string(datatype) => Some(text.clone()),
        _ => None,
    }
}

fn to_string_and_language(value: &Value) -> Option<(String, Option<String>)> {
    match value {
        Value::Str {
            text,
            language,
            datatype,
        } if datatype.is_none() || plain_or_string(datatype) => {
            Some((text.clone(), language.clone()))
        }
        _ => None,
    }
}

fn build_plain(text: String, language: Option<String>) -> Value {
    match language {
        Some(language) => Value::lang_string(text, language),
        None => Value::string(text),
    }
}

/// Argument compatibility for the two-string built-ins: arg2 must be plain
/// or carry the same tag as arg1; the result inherits arg1's tag.
fn compatible_strings(arg1: &Value, arg2: &Value) -> Option<(String, String, Option<String>)> {
    let (value1, language1) = to_string_and_language(arg1)?;
    let (value2, language2) = to_string_and_language(arg2)?;
    (language2.is_none() || language1 == language2).then_some((value1, value2, language1))
}

fn lang_matches(tag: &str, range: &str) -> bool {
    if range == "*" {
        return !tag.is_empty();
    }
    let tag = tag.to_ascii_lowercase();
    let range = range.to_ascii_lowercase();
    tag == range || (tag.starts_with(&range) && tag.as_bytes().get(range.len()) == Some(&b'-'))
}

fn encode_for_uri(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(char::from(byte));
            }
            _ => {
                out.push('%');
                out.push(hex_digit(byte / 16));
                out.push(hex_digit(byte % 16));
            }
        }
    }
    out
}

fn hex_digit(nibble: u8) -> char {
    char::from(if nibble < 10 {
        b'0' + nibble
    } else {
        b'A' + (nibble - 10)
    })
}

fn hash_arg<H: Digest>(value: &Value) -> Value {
    match plain_string(value) {
        Some(text) => Value::string(hex::encode(H::new().chain_update(text.as_bytes()).finalize())),
        None => Value::Unbound,
    }
}

fn generate_uuid(buffer: &mut String) {
    let mut uuid = random::<u128>().to_le_bytes();
    uuid[6] = (uuid[6] & 0x0F) | 0x40;
    uuid[8] = (uuid[8] & 0x3F) | 0x80;
    for (i, byte) in uuid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            buffer.push('-');
        }
        buffer.push(hex_digit(byte / 16).to_ascii_lowercase());
        buffer.push(hex_digit(byte % 16).to_ascii_lowercase());
    }
}

fn compile_pattern(pattern: &str, flags: &str) -> Option<Regex> {
    let mut pattern = std::borrow::Cow::Borrowed(pattern);
    if flags.contains('q') {
        pattern = regex::escape(&pattern).into();
    }
    let mut builder = RegexBuilder::new(&pattern);
    builder.size_limit(REGEX_SIZE_LIMIT);
    for flag in flags.chars() {
        match flag {
            's' => {
                builder.dot_matches_new_line(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            'i' => {
                builder.case_insensitive(true);
            }
            'x' => {
                builder.ignore_whitespace(true);
            }
            'q' => (),
            _ => return None,
        }
    }
    builder.build().ok()
}

/// XSD constructor-style casts.
fn cast(datatype: &str, value: &Value) -> Value {
    match datatype {
        _ if datatype == xsd::INTEGER => match value {
            Value::Int(i) => Value::Int(*i),
            Value::Float(f) if f.is_finite() => Value::Int(*f as i64),
            Value::Bool(b) => Value::Int(i64::from(*b)),
            Value::Str {
                text,
                language: None,
                ..
            } => {
                // Strings with a fractional or exponent shape are rejected.
                let trimmed = text.trim();
                if trimmed.contains(['.', 'e', 'E']) {
                    Value::Unbound
                } else {
                    trimmed.parse::<i64>().map_or(Value::Unbound, Value::Int)
                }
            }
            _ => Value::Unbound,
        },
        _ if datatype == xsd::DECIMAL => match value {
            Value::Int(i) => Value::Int(*i),
            Value::Float(f) if f.is_finite() => Value::Float(*f),
            Value::Bool(b) => Value::Int(i64::from(*b)),
            Value::Str {
                text,
                language: None,
                ..
            } => {
                let trimmed = text.trim();
                if trimmed.contains(['e', 'E']) {
                    Value::Unbound
                } else {
                    match parse_number(trimmed) {
                        Some(n) => numeric_value(n),
                        None => Value::Unbound,
                    }
                }
            }
            _ => Value::Unbound,
        },
        _ if datatype == xsd::DOUBLE || datatype == xsd::FLOAT => match value {
            Value::Int(i) => Value::Float(*i as f64),
            Value::Float(f) => Value::Float(*f),
            Value::Bool(b) => Value::Float(if *b { 1.0 } else { 0.0 }),
            Value::Str {
                text,
                language: None,
                ..
            } => match parse_number(text) {
                Some(n) => Value::Float(as_float(n)),
                None => Value::Unbound,
            },
            _ => Value::Unbound,
        },
        _ if datatype == xsd::BOOLEAN => match value {
            Value::Bool(b) => Value::Bool(*b),
            Value::Int(i) => Value::Bool(*i != 0),
            Value::Float(f) => Value::Bool(!f.is_nan() && *f != 0.0),
            Value::Str {
                text,
                language: None,
                ..
            } => match text.trim() {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                _ => Value::Unbound,
            },
            _ => Value::Unbound,
        },
        _ if datatype == xsd::STRING => match value {
            Value::Iri(iri) => Value::string(iri.clone()),
            Value::Str { text, .. } => Value::string(text.clone()),
            Value::Int(i) => Value::string(i.to_string()),
            Value::Float(f) => Value::string(f.to_string()),
            Value::Bool(b) => Value::string(if *b { "true" } else { "false" }),
            Value::Unbound => Value::Unbound,
        },
        _ if datatype == xsd::DATE_TIME => match value {
            Value::Str {
                text,
                language: None,
                ..
            } => match text.parse::<DateTime>() {
                Ok(dt) => Value::typed(dt.to_string(), xsd::DATE_TIME),
                Err(_) => Value::Unbound,
            },
            _ => Value::Unbound,
        },
        _ => Value::Unbound,
    }
}
