//! Structural Type Descriptors
//!
//! Streams are tagged with a structural type descriptor so consumers can
//! check payload-shape compatibility. The core never interprets descriptors
//! beyond equality/compatibility; payload decoding belongs to consumers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A stream's structural payload type: a name plus an opaque textual
/// definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub name: String,
    /// Opaque structural definition. May be empty when the producer shipped
    /// only a name.
    pub definition: String,
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: definition.into(),
        }
    }

    /// Two descriptors are compatible when their names match and neither
    /// carries a conflicting definition (an empty definition is a wildcard).
    pub fn compatible_with(&self, other: &TypeDescriptor) -> bool {
        self.name == other.name
            && (self.definition == other.definition
                || self.definition.is_empty()
                || other.definition.is_empty())
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Registry of type descriptors seen by a loading context.
///
/// Ensures that all streams sharing a type name agree on its definition.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, TypeDescriptor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, or merge it with an existing compatible one.
    ///
    /// Returns the registered descriptor (the one with a definition, if only
    /// one side has it). Fails when the same name is registered with two
    /// conflicting definitions.
    pub fn resolve(&mut self, descriptor: &TypeDescriptor) -> Result<TypeDescriptor, TypeError> {
        match self.types.get_mut(&descriptor.name) {
            None => {
                self.types
                    .insert(descriptor.name.clone(), descriptor.clone());
                Ok(descriptor.clone())
            }
            Some(existing) => {
                if !existing.compatible_with(descriptor) {
                    return Err(TypeError::Conflict {
                        name: descriptor.name.clone(),
                        registered: existing.definition.clone(),
                        offered: descriptor.definition.clone(),
                    });
                }
                if existing.definition.is_empty() && !descriptor.definition.is_empty() {
                    existing.definition = descriptor.definition.clone();
                }
                Ok(existing.clone())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&TypeDescriptor> {
        self.types.get(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Errors from type registration.
#[derive(Debug)]
pub enum TypeError {
    Conflict {
        name: String,
        registered: String,
        offered: String,
    },
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict {
                name,
                registered,
                offered,
            } => write!(
                f,
                "conflicting definitions for type {}: registered {:?}, offered {:?}",
                name, registered, offered
            ),
        }
    }
}

impl std::error::Error for TypeError {}
