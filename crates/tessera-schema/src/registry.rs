//! Per-database registry of attribute comparison handlers
//!
//! The schema cache registers one handler per attribute listed in
//! @ATTRIBUTES when it loads, and deregisters them before it drops the tables
//! they came from. Each `Database` owns its registry, so databases opened in
//! the same process never see each other's handlers.

use std::cmp::Ordering;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::attribute::{AttributeFlags, AttributeSyntax};

/// Attribute name whose handler applies to otherwise unlisted attributes
pub const WILDCARD_ATTRIBUTE: &str = "*";

/// A comparison handler resolved for one attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerDescriptor {
    pub syntax: AttributeSyntax,
    pub flags: AttributeFlags,
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, HandlerDescriptor>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `attribute`, returning the one it replaced.
    pub fn register(&self, attribute: &str, handler: HandlerDescriptor) -> Option<HandlerDescriptor> {
        self.handlers.write().insert(attribute.to_string(), handler)
    }

    pub fn deregister(&self, attribute: &str) -> Option<HandlerDescriptor> {
        self.handlers.write().remove(attribute)
    }

    pub fn get(&self, attribute: &str) -> Option<HandlerDescriptor> {
        self.handlers.read().get(attribute).copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Registered attribute names, sorted
    pub fn attributes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Syntax for `attribute`: its own handler, else the wildcard's, else octet string.
    pub fn syntax_for(&self, attribute: &str) -> AttributeSyntax {
        let handlers = self.handlers.read();
        handlers
            .get(attribute)
            .or_else(|| handlers.get(WILDCARD_ATTRIBUTE))
            .map_or(AttributeSyntax::OctetString, |h| h.syntax)
    }

    pub fn compare(&self, attribute: &str, a: &[u8], b: &[u8]) -> Ordering {
        self.syntax_for(attribute).compare(a, b)
    }
}
