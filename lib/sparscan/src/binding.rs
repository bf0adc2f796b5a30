//! Binding tables: ordered variable-to-value maps with arena-backed string
//! storage and checkpoint/truncate backtracking.

use crate::error::EvaluationError;
use crate::limits::ExecutionLimits;
use crate::query::fnv1a32;
use crate::vocab::xsd;
use quadmem::{iri_content, literal_parts, plain_literal, typed_literal};

/// A typed value bound to a variable, as surfaced in solutions and used by
/// the expression evaluator.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// A literal (or blank-node label); `text` is the unescaped value.
    Str {
        text: String,
        language: Option<String>,
        datatype: Option<String>,
    },
    /// An IRI, without the wrapping angle brackets.
    Iri(String),
    #[default]
    Unbound,
}

impl Value {
    pub fn string(text: impl Into<String>) -> Self {
        Self::Str {
            text: text.into(),
            language: None,
            datatype: None,
        }
    }

    pub fn lang_string(text: impl Into<String>, language: impl Into<String>) -> Self {
        Self::Str {
            text: text.into(),
            language: Some(language.into()),
            datatype: None,
        }
    }

    pub fn typed(text: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self::Str {
            text: text.into(),
            language: None,
            datatype: Some(datatype.into()),
        }
    }

    #[inline]
    pub fn is_unbound(&self) -> bool {
        matches!(self, Self::Unbound)
    }

    /// Classifies a store lexical form into a value.
    pub fn from_lexical(lexical: &str) -> Self {
        if let Some(iri) = iri_content(lexical) {
            return Self::Iri(iri.to_owned());
        }
        if let Some((text, datatype, language)) = literal_parts(lexical) {
            return Self::Str {
                text,
                language: language.map(str::to_owned),
                datatype: datatype.map(str::to_owned),
            };
        }
        // Blank-node labels and anything else ride along as plain text.
        Self::string(lexical)
    }

    /// Renders the canonical store lexical form, `None` for `Unbound`.
    pub fn lexical_form(&self) -> Option<String> {
        Some(match self {
            Self::Int(value) => typed_literal(&value.to_string(), xsd::INTEGER),
            Self::Float(value) => typed_literal(&value.to_string(), xsd::DOUBLE),
            Self::Bool(value) => typed_literal(if *value { "true" } else { "false" }, xsd::BOOLEAN),
            Self::Str {
                text,
                language,
                datatype,
            } => {
                if text.starts_with("_:") && language.is_none() && datatype.is_none() {
                    text.clone()
                } else if let Some(datatype) = datatype {
                    typed_literal(text, datatype)
                } else {
                    plain_literal(text, language.as_deref())
                }
            }
            Self::Iri(iri) => format!("<{iri}>"),
            Self::Unbound => return None,
        })
    }

    /// RDF term equality (SPARQL `sameTerm`), used as the join predicate.
    pub fn same_term(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Unbound, Self::Unbound) => true,
            (Self::Unbound, _) | (_, Self::Unbound) => false,
            _ => match (self.lexical_form(), other.lexical_form()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

/// A range into a table's character arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrRef {
    offset: u32,
    len: u32,
}

/// The in-table value representation: scalars inline, strings in the arena.
#[derive(Debug, Clone, Copy)]
enum CompactValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(StrRef),
    Iri(StrRef),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    hash: u32,
    name: StrRef,
    value: CompactValue,
    /// Arena length right before this entry's strings were appended;
    /// `truncate` cuts the arena back to the first discarded entry's mark.
    arena_mark: u32,
}

/// An ordered, append-only variable binding table.
///
/// Entries are appended by scans and rolled back by truncating to a
/// checkpoint; an existing binding is never mutated. Lookup is by FNV-1a
/// hash of the variable name with a raw-name comparison on collision.
#[derive(Debug)]
pub struct BindingTable {
    entries: Vec<Entry>,
    arena: String,
    max_bindings: Option<usize>,
    max_arena_bytes: Option<usize>,
}

impl BindingTable {
    pub fn new(limits: &ExecutionLimits) -> Self {
        Self {
            entries: Vec::new(),
            arena: String::new(),
            max_bindings: limits.max_bindings,
            max_arena_bytes: limits.max_arena_bytes,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The current table size, to restore later with [`truncate`](Self::truncate).
    #[inline]
    pub fn checkpoint(&self) -> usize {
        self.entries.len()
    }

    fn intern(&mut self, text: &str) -> Result<StrRef, EvaluationError> {
        ExecutionLimits::check(
            self.arena.len() + text.len(),
            self.max_arena_bytes,
            "binding arena size",
        )?;
        let offset = u32::try_from(self.arena.len()).unwrap_or(u32::MAX);
        self.arena.push_str(text);
        Ok(StrRef {
            offset,
            len: u32::try_from(text.len()).unwrap_or(0),
        })
    }

    fn resolve(&self, sref: StrRef) -> &str {
        &self.arena[sref.offset as usize..(sref.offset + sref.len) as usize]
    }

    /// Binds `name` to `value`, appending a new entry.
    ///
    /// Returns `Ok(false)` when the variable is already bound to a different
    /// value (the join-consistency check); binding the same value again is a
    /// successful no-op. An `Unbound` value never creates an entry.
    pub fn bind(&mut self, name: &str, value: &Value) -> Result<bool, EvaluationError> {
        if value.is_unbound() {
            return Ok(true);
        }
        if let Some(index) = self.find(name) {
            return Ok(self.value(index).same_term(value));
        }
        ExecutionLimits::check(self.entries.len() + 1, self.max_bindings, "binding count")?;
        let arena_mark = u32::try_from(self.arena.len()).unwrap_or(u32::MAX);
        let name_ref = self.intern(name)?;
        let value = match value {
            Value::Int(v) => CompactValue::Int(*v),
            Value::Float(v) => CompactValue::Float(*v),
            Value::Bool(v) => CompactValue::Bool(*v),
            Value::Iri(iri) => CompactValue::Iri(self.intern(iri)?),
            Value::Str { .. } => {
                let lexical = value
                    .lexical_form()
                    .unwrap_or_default();
                CompactValue::Str(self.intern(&lexical)?)
            }
            Value::Unbound => unreachable!("handled above"),
        };
        self.entries.push(Entry {
            hash: fnv1a32(name),
            name: name_ref,
            value,
            arena_mark,
        });
        Ok(true)
    }

    /// Binds `name` to a store lexical form without decomposing it.
    pub fn bind_lexical(&mut self, name: &str, lexical: &str) -> Result<bool, EvaluationError> {
        if let Some(index) = self.find(name) {
            return Ok(self.lexical(index) == lexical);
        }
        ExecutionLimits::check(self.entries.len() + 1, self.max_bindings, "binding count")?;
        let arena_mark = u32::try_from(self.arena.len()).unwrap_or(u32::MAX);
        let name_ref = self.intern(name)?;
        let value = if lexical.starts_with('<') {
            CompactValue::Iri(self.intern(iri_content(lexical).unwrap_or(lexical))?)
        } else {
            CompactValue::Str(self.intern(lexical)?)
        };
        self.entries.push(Entry {
            hash: fnv1a32(name),
            name: name_ref,
            value,
            arena_mark,
        });
        Ok(true)
    }

    /// Index of the entry bound to `name`; a linear hash scan, `n` stays
    /// small.
    pub fn find(&self, name: &str) -> Option<usize> {
        let hash = fnv1a32(name);
        self.entries
            .iter()
            .position(|entry| entry.hash == hash && self.resolve(entry.name) == name)
    }

    /// The typed value at `index`.
    pub fn value(&self, index: usize) -> Value {
        match self.entries[index].value {
            CompactValue::Int(v) => Value::Int(v),
            CompactValue::Float(v) => Value::Float(v),
            CompactValue::Bool(v) => Value::Bool(v),
            CompactValue::Iri(sref) => Value::Iri(self.resolve(sref).to_owned()),
            CompactValue::Str(sref) => Value::from_lexical(self.resolve(sref)),
        }
    }

    /// The store lexical form at `index`.
    pub fn lexical(&self, index: usize) -> String {
        match self.entries[index].value {
            CompactValue::Str(sref) => self.resolve(sref).to_owned(),
            CompactValue::Iri(sref) => format!("<{}>", self.resolve(sref)),
            CompactValue::Int(v) => typed_literal(&v.to_string(), xsd::INTEGER),
            CompactValue::Float(v) => typed_literal(&v.to_string(), xsd::DOUBLE),
            CompactValue::Bool(v) => {
                typed_literal(if v { "true" } else { "false" }, xsd::BOOLEAN)
            }
        }
    }

    pub fn get(&self, name: &str) -> Value {
        self.find(name).map_or(Value::Unbound, |i| self.value(i))
    }

    pub fn get_lexical(&self, name: &str) -> Option<String> {
        self.find(name).map(|i| self.lexical(i))
    }

    pub fn name_at(&self, index: usize) -> &str {
        self.resolve(self.entries[index].name)
    }

    /// Discards entries at indices `>= mark` together with the arena bytes
    /// only they referenced.
    pub fn truncate(&mut self, mark: usize) {
        if mark >= self.entries.len() {
            return;
        }
        let arena_mark = self.entries[mark].arena_mark as usize;
        self.entries.truncate(mark);
        self.arena.truncate(arena_mark);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.arena.clear();
    }

    /// An owned snapshot of the whole table, safe to keep across scan and
    /// stack boundaries.
    pub fn materialize(&self) -> MaterializedRow {
        MaterializedRow {
            pairs: (0..self.len())
                .map(|i| (self.name_at(i).to_owned(), self.value(i)))
                .collect(),
        }
    }
}

/// A self-contained solution row: owned names and owned values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MaterializedRow {
    pub pairs: Vec<(String, Value)>,
}

impl MaterializedRow {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.pairs
            .iter()
            .find(|(candidate, _)| candidate == name)
            .map(|(_, value)| value)
    }

    /// Copies every pair into `table`; fails the consistency check the same
    /// way [`BindingTable::bind`] does.
    pub fn bind_into(&self, table: &mut BindingTable) -> Result<bool, EvaluationError> {
        for (name, value) in &self.pairs {
            if !table.bind(name, value)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
