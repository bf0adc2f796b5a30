use crate::quad::Quad;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::RwLock;

/// Error raised by the store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The internal readers-writer lock was poisoned by a panicking writer.
    #[error("the quad store lock was poisoned")]
    Poisoned,
}

type Spog = [u32; 4];

#[derive(Default)]
struct Interner {
    ids: FxHashMap<String, u32>,
    terms: Vec<String>,
}

impl Interner {
    fn intern(&mut self, term: &str) -> u32 {
        if let Some(id) = self.ids.get(term) {
            return *id;
        }
        let id = u32::try_from(self.terms.len()).unwrap_or(u32::MAX);
        self.terms.push(term.to_owned());
        self.ids.insert(term.to_owned(), id);
        id
    }

    fn get(&self, term: &str) -> Option<u32> {
        self.ids.get(term).copied()
    }

    fn resolve(&self, id: u32) -> &str {
        &self.terms[id as usize]
    }
}

#[derive(Default)]
struct StoreInner {
    interner: Interner,
    quads: FxHashSet<Spog>,
    by_subject: FxHashMap<u32, FxHashSet<Spog>>,
    by_predicate: FxHashMap<u32, FxHashSet<Spog>>,
    by_object: FxHashMap<u32, FxHashSet<Spog>>,
    by_graph: FxHashMap<u32, FxHashSet<Spog>>,
}

impl StoreInner {
    fn insert(&mut self, quad: &Quad) -> bool {
        let key = [
            self.interner.intern(&quad.subject),
            self.interner.intern(&quad.predicate),
            self.interner.intern(&quad.object),
            self.interner.intern(&quad.graph),
        ];
        if !self.quads.insert(key) {
            return false;
        }
        self.by_subject.entry(key[0]).or_default().insert(key);
        self.by_predicate.entry(key[1]).or_default().insert(key);
        self.by_object.entry(key[2]).or_default().insert(key);
        self.by_graph.entry(key[3]).or_default().insert(key);
        true
    }

    fn remove(&mut self, quad: &Quad) -> bool {
        let Some(key) = self.encode(quad) else {
            return false;
        };
        if !self.quads.remove(&key) {
            return false;
        }
        for (index, component) in [
            (&mut self.by_subject, key[0]),
            (&mut self.by_predicate, key[1]),
            (&mut self.by_object, key[2]),
            (&mut self.by_graph, key[3]),
        ] {
            if let Some(set) = index.get_mut(&component) {
                set.remove(&key);
                if set.is_empty() {
                    index.remove(&component);
                }
            }
        }
        true
    }

    fn encode(&self, quad: &Quad) -> Option<Spog> {
        Some([
            self.interner.get(&quad.subject)?,
            self.interner.get(&quad.predicate)?,
            self.interner.get(&quad.object)?,
            self.interner.get(&quad.graph)?,
        ])
    }

    fn contains(&self, quad: &Quad) -> bool {
        self.encode(quad).is_some_and(|key| self.quads.contains(&key))
    }

    fn decode(&self, key: Spog) -> Quad {
        Quad {
            subject: self.interner.resolve(key[0]).to_owned(),
            predicate: self.interner.resolve(key[1]).to_owned(),
            object: self.interner.resolve(key[2]).to_owned(),
            graph: self.interner.resolve(key[3]).to_owned(),
        }
    }
}

/// An in-memory quad store with per-component secondary indexes.
///
/// All access goes through an internal readers-writer lock: pattern lookups
/// materialize their matches under the read guard (so result iterators see a
/// consistent snapshot), mutation batches apply atomically under the write
/// guard.
#[derive(Default)]
pub struct MemoryQuadStore {
    inner: RwLock<StoreInner>,
}

impl MemoryQuadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All quads matching the pattern; an empty component is a wildcard.
    ///
    /// A non-empty `graph` restricts the match to that named graph (or to
    /// the default graph when `graph` cannot name one); an empty `graph`
    /// matches every graph including the default one.
    pub fn matching(
        &self,
        subject: &str,
        predicate: &str,
        object: &str,
        graph: &str,
    ) -> Result<Vec<Quad>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        let mut constraints: [Option<u32>; 4] = [None; 4];
        for (slot, component) in constraints.iter_mut().zip([subject, predicate, object, graph])
        {
            if !component.is_empty() {
                match inner.interner.get(component) {
                    Some(id) => *slot = Some(id),
                    // An unknown term cannot match anything.
                    None => return Ok(Vec::new()),
                }
            }
        }
        // Empty graph means "any graph" at this interface; the engine
        // narrows to the default graph on its side when it needs to.
        let candidates: Box<dyn Iterator<Item = &Spog>> = if let Some(id) = constraints[0] {
            Box::new(inner.by_subject.get(&id).into_iter().flatten())
        } else if let Some(id) = constraints[2] {
            Box::new(inner.by_object.get(&id).into_iter().flatten())
        } else if let Some(id) = constraints[1] {
            Box::new(inner.by_predicate.get(&id).into_iter().flatten())
        } else if let Some(id) = constraints[3] {
            Box::new(inner.by_graph.get(&id).into_iter().flatten())
        } else {
            Box::new(inner.quads.iter())
        };
        let mut matches = Vec::new();
        for key in candidates {
            if constraints
                .iter()
                .zip(key)
                .all(|(constraint, component)| constraint.is_none_or(|id| id == *component))
            {
                matches.push(inner.decode(*key));
            }
        }
        Ok(matches)
    }

    /// IRIs (lexical `<...>` forms) of all non-empty named graphs.
    pub fn named_graphs(&self) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        let mut graphs: Vec<String> = inner
            .by_graph
            .keys()
            .map(|id| inner.interner.resolve(*id).to_owned())
            .filter(|name| !name.is_empty())
            .collect();
        graphs.sort();
        Ok(graphs)
    }

    pub fn contains(&self, quad: &Quad) -> Result<bool, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.contains(quad))
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.quads.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Opens a mutation batch. Operations are buffered and reads keep seeing
    /// the pre-batch state until [`MemoryBatch::commit`] applies them all
    /// under a single write guard.
    pub fn batch(&self) -> Result<MemoryBatch<'_>, StoreError> {
        Ok(MemoryBatch {
            store: self,
            ops: Vec::new(),
        })
    }
}

enum BatchOp {
    Insert(Quad),
    Delete(Quad),
}

/// A buffered mutation batch; dropped batches are discarded.
pub struct MemoryBatch<'a> {
    store: &'a MemoryQuadStore,
    ops: Vec<BatchOp>,
}

impl MemoryBatch<'_> {
    pub fn insert(&mut self, quad: Quad) {
        self.ops.push(BatchOp::Insert(quad));
    }

    /// Queues a deletion; reports whether the quad is present in the state
    /// the batch would produce so far.
    pub fn delete(&mut self, quad: Quad) -> Result<bool, StoreError> {
        let mut present = self.store.contains(&quad)?;
        for op in &self.ops {
            match op {
                BatchOp::Insert(pending) if *pending == quad => present = true,
                BatchOp::Delete(pending) if *pending == quad => present = false,
                _ => {}
            }
        }
        self.ops.push(BatchOp::Delete(quad));
        Ok(present)
    }

    /// Applies all buffered operations atomically. Returns the number of
    /// quads actually inserted or removed.
    pub fn commit(self) -> Result<u64, StoreError> {
        let mut inner = self.store.inner.write().map_err(|_| StoreError::Poisoned)?;
        let mut affected = 0u64;
        for op in &self.ops {
            let changed = match op {
                BatchOp::Insert(quad) => inner.insert(quad),
                BatchOp::Delete(quad) => inner.remove(quad),
            };
            if changed {
                affected += 1;
            }
        }
        Ok(affected)
    }

    /// Discards all buffered operations.
    pub fn rollback(self) {
        drop(self);
    }
}
