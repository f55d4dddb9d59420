//! Stream Indexing and Lazy Access
//!
//! Per-file binary indexes ([`index`]), deferred-open stream handles
//! ([`lazy`]), and the structural type-descriptor registry ([`typereg`]).

pub mod index;
pub mod lazy;
pub mod typereg;

pub use index::{FileIndex, IndexError, SamplePosition, StreamSummary, INDEX_EXTENSION};
pub use lazy::{LazyStream, SampleIter, StreamError};
pub use typereg::{TypeDescriptor, TypeError, TypeRegistry};
