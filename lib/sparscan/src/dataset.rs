//! The storage interface the engine consumes, and its in-memory
//! implementation.

use quadmem::{MemoryBatch, MemoryQuadStore, Quad, StoreError};

pub type QuadIter<'a> = Box<dyn Iterator<Item = Result<Quad, StoreError>> + 'a>;

/// A queryable, batch-mutable quad store.
///
/// Pattern components are canonical lexical term forms; an empty component
/// is a wildcard. A non-empty `graph` scopes the lookup to that named
/// graph, an empty `graph` matches every graph including the default one
/// (callers narrow to the default graph by filtering on the returned quads'
/// graph component).
pub trait QuadStore {
    /// Quads matching the component pattern.
    fn quads<'a>(&'a self, subject: &str, predicate: &str, object: &str, graph: &str)
        -> QuadIter<'a>;

    /// IRIs (lexical `<...>` forms) of the dataset's named graphs.
    fn named_graphs<'a>(&'a self) -> Box<dyn Iterator<Item = Result<String, StoreError>> + 'a>;

    /// Opens a batched mutation transaction.
    fn begin_batch<'a>(&'a self) -> Result<Box<dyn StoreBatch + 'a>, StoreError>;

    /// A cheap size hint for the planner; `0` when unknown.
    fn approx_len(&self) -> usize {
        0
    }
}

/// One buffered mutation transaction.
///
/// Reads through [`QuadStore::quads`] keep seeing the pre-batch state until
/// `commit`; a dropped (or rolled back) batch leaves no trace.
pub trait StoreBatch {
    fn insert(&mut self, quad: Quad) -> Result<(), StoreError>;

    /// Queues a deletion; reports whether the quad exists in the state the
    /// batch has produced so far.
    fn delete(&mut self, quad: Quad) -> Result<bool, StoreError>;

    /// Applies the batch atomically, returning the number of quads actually
    /// inserted or removed.
    fn commit(self: Box<Self>) -> Result<u64, StoreError>;

    /// Discards the batch.
    fn rollback(self: Box<Self>);
}

impl QuadStore for MemoryQuadStore {
    fn quads<'a>(
        &'a self,
        subject: &str,
        predicate: &str,
        object: &str,
        graph: &str,
    ) -> QuadIter<'a> {
        match self.matching(subject, predicate, object, graph) {
            Ok(quads) => Box::new(quads.into_iter().map(Ok)),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn named_graphs<'a>(&'a self) -> Box<dyn Iterator<Item = Result<String, StoreError>> + 'a> {
        match MemoryQuadStore::named_graphs(self) {
            Ok(graphs) => Box::new(graphs.into_iter().map(Ok)),
            Err(e) => Box::new(std::iter::once(Err(e))),
        }
    }

    fn begin_batch<'a>(&'a self) -> Result<Box<dyn StoreBatch + 'a>, StoreError> {
        Ok(Box::new(self.batch()?))
    }

    fn approx_len(&self) -> usize {
        self.len().unwrap_or(0)
    }
}

impl StoreBatch for MemoryBatch<'_> {
    fn insert(&mut self, quad: Quad) -> Result<(), StoreError> {
        MemoryBatch::insert(self, quad);
        Ok(())
    }

    fn delete(&mut self, quad: Quad) -> Result<bool, StoreError> {
        MemoryBatch::delete(self, quad)
    }

    fn commit(self: Box<Self>) -> Result<u64, StoreError> {
        MemoryBatch::commit(*self)
    }

    fn rollback(self: Box<Self>) {
        MemoryBatch::rollback(*self);
    }
}
