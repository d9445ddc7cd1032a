//! Special-record loader: @ATTRIBUTES, @SUBCLASSES and @INDEXLIST into tables
//!
//! Records are read with `get_committed`, so a load never observes writes an
//! open transaction has not committed yet. Absent records yield empty tables.

use std::collections::BTreeSet;

use hashbrown::HashMap;
use tracing::debug;

use tessera_core::RecordStore;

use crate::attribute::{AttributeFlags, AttributeSyntax};
use crate::error::{SchemaError, SchemaResult};
use crate::message::{record_key, Message};

pub const ATTRIBUTES_DN: &str = "@ATTRIBUTES";
pub const SUBCLASSES_DN: &str = "@SUBCLASSES";
pub const INDEXLIST_DN: &str = "@INDEXLIST";

/// @INDEXLIST element naming indexed attributes
pub const IDXATTR: &str = "@IDXATTR";
/// @INDEXLIST element enabling the one-level index
pub const IDXONE: &str = "@IDXONE";

/// Flags and resolved syntax of one @ATTRIBUTES entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeEntry {
    pub flags: AttributeFlags,
    pub syntax: AttributeSyntax,
}

/// An index the indexing collaborator should maintain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexDescriptor {
    Attribute(String),
    OneLevel,
}

/// Tables derived from the special records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaTables {
    pub attributes: HashMap<String, AttributeEntry>,
    pub subclasses: HashMap<String, BTreeSet<String>>,
    pub indexes: Vec<IndexDescriptor>,
}

/// Counters bumped by the loader
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounters {
    /// Times the @ATTRIBUTES record was read
    pub attribute_record_reads: u64,
}

/// Read all three special records and build fresh tables.
pub fn load_tables(store: &RecordStore, counters: &mut LoadCounters) -> SchemaResult<SchemaTables> {
    counters.attribute_record_reads += 1;
    let attributes = match read_special(store, ATTRIBUTES_DN)? {
        Some(msg) => parse_attributes(&msg)?,
        None => HashMap::new(),
    };
    let subclasses = match read_special(store, SUBCLASSES_DN)? {
        Some(msg) => parse_subclasses(&msg)?,
        None => HashMap::new(),
    };
    let indexes = match read_special(store, INDEXLIST_DN)? {
        Some(msg) => parse_index_list(&msg)?,
        None => Vec::new(),
    };

    debug!(
        attributes = attributes.len(),
        subclasses = subclasses.len(),
        indexes = indexes.len(),
        "loaded special records"
    );
    Ok(SchemaTables {
        attributes,
        subclasses,
        indexes,
    })
}

/// Committed contents of the special record `dn`
pub fn read_special(store: &RecordStore, dn: &str) -> SchemaResult<Option<Message>> {
    match store.get_committed(&record_key(dn))? {
        Some(raw) => Message::unpack(&raw, dn).map(Some),
        None => Ok(None),
    }
}

/// Parse @ATTRIBUTES. Any unknown token or unsupported flag combination fails
/// the whole record.
pub fn parse_attributes(msg: &Message) -> SchemaResult<HashMap<String, AttributeEntry>> {
    let mut table = HashMap::with_capacity(msg.elements.len());
    for element in &msg.elements {
        let mut flags = AttributeFlags::empty();
        for value in &element.values {
            let token = std::str::from_utf8(value).unwrap_or("");
            flags |= AttributeFlags::from_token(token).ok_or_else(|| {
                SchemaError::malformed_schema(
                    ATTRIBUTES_DN,
                    format!("unknown flag {:?} on attribute {}", String::from_utf8_lossy(value), element.name),
                )
            })?;
        }
        let syntax = AttributeSyntax::from_flags(flags).ok_or_else(|| {
            SchemaError::malformed_schema(
                ATTRIBUTES_DN,
                format!("no comparison handler for {} on attribute {}", flags, element.name),
            )
        })?;
        table.insert(element.name.clone(), AttributeEntry { flags, syntax });
    }
    Ok(table)
}

/// Parse @SUBCLASSES: element name is the base class, values its direct subclasses.
pub fn parse_subclasses(msg: &Message) -> SchemaResult<HashMap<String, BTreeSet<String>>> {
    let mut table: HashMap<String, BTreeSet<String>> = HashMap::with_capacity(msg.elements.len());
    for element in &msg.elements {
        let entry = table.entry(element.name.clone()).or_default();
        for value in &element.values {
            let name = std::str::from_utf8(value).map_err(|_| {
                SchemaError::malformed_record(SUBCLASSES_DN, format!("non UTF-8 subclass of {}", element.name))
            })?;
            entry.insert(name.to_string());
        }
    }
    Ok(table)
}

/// Parse @INDEXLIST in record order.
pub fn parse_index_list(msg: &Message) -> SchemaResult<Vec<IndexDescriptor>> {
    let mut indexes = Vec::new();
    if let Some(element) = msg.element(IDXATTR) {
        for value in &element.values {
            let name = std::str::from_utf8(value)
                .map_err(|_| SchemaError::malformed_record(INDEXLIST_DN, "non UTF-8 indexed attribute"))?;
            indexes.push(IndexDescriptor::Attribute(name.to_string()));
        }
    }
    if msg.element(IDXONE).is_some() {
        indexes.push(IndexDescriptor::OneLevel);
    }
    Ok(indexes)
}
