//! Loading Context
//!
//! Explicit configuration threaded into dataset and stream loading, instead
//! of process-global singletons. Owns the type-descriptor registry shared by
//! every stream loaded through it, so conflicting structural definitions are
//! caught at load time.

use crate::stream::typereg::TypeRegistry;

#[derive(Debug, Default)]
pub struct Context {
    /// Registry shared by all streams loaded through this context.
    pub registry: TypeRegistry,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }
}
