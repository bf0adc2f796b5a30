#![doc = include_str!("../README.md")]
#![doc(test(attr(deny(warnings))))]

mod quad;
mod store;

pub use crate::quad::{
    iri_content, is_blank, is_iri, is_literal, literal_parts, plain_literal, typed_literal, Quad,
    Triple,
};
pub use crate::store::{MemoryBatch, MemoryQuadStore, StoreError};
