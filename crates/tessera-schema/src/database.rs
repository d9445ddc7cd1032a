//! `Database`: a record store handle with its schema cache and handler registry.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use tessera_core::{with_transaction, Config, PutMode, RecordStore, Transaction};

use crate::attribute::{AttributeFlags, AttributeSyntax};
use crate::cache::{CacheState, CacheStats, SchemaCache};
use crate::error::{SchemaError, SchemaResult};
use crate::loader::{parse_attributes, IndexDescriptor, ATTRIBUTES_DN};
use crate::message::{is_special_dn, record_key, Message};
use crate::registry::HandlerRegistry;
use crate::sequence::{bootstrap, bump_sequence, read_base_info, BaseInfo, BASEINFO_DN};

/// One element of a decorated record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoratedElement {
    pub name: String,
    pub flags: AttributeFlags,
    pub syntax: AttributeSyntax,
    pub values: Vec<Vec<u8>>,
}

/// A record annotated with the schema in force when it was read.
/// Elements of `HIDDEN` attributes are left out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoratedRecord {
    pub dn: String,
    pub elements: Vec<DecoratedElement>,
}

impl DecoratedRecord {
    pub fn element(&self, name: &str) -> Option<&DecoratedElement> {
        self.elements.iter().find(|e| e.name == name)
    }
}

/// Writes to these records change the schema and bump the sequence number.
fn invalidates_schema(dn: &str) -> bool {
    is_special_dn(dn) && dn != BASEINFO_DN
}

/// Store handle context.
///
/// Owns the record store, the schema cache and the registry the cache
/// registers its handlers in. The cache lives exactly as long as the handle.
pub struct Database {
    store: RecordStore,
    registry: HandlerRegistry,
    cache: Mutex<SchemaCache>,
    closed: AtomicBool,
}

impl Database {
    /// Open or create a database file. The schema loads on first query.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> SchemaResult<Self> {
        Ok(Self::from_store(RecordStore::open(path, config)?))
    }

    pub fn from_store(store: RecordStore) -> Self {
        Self {
            store,
            registry: HandlerRegistry::new(),
            cache: Mutex::new(SchemaCache::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Tear down the schema cache. Later operations fail with `InvalidState`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cache.lock().unload(&self.registry);
        debug!(path = %self.store.path().display(), "database closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> SchemaResult<()> {
        if self.is_closed() {
            return Err(SchemaError::InvalidState("database is closed".into()));
        }
        Ok(())
    }

    // -- schema queries --

    pub fn attribute_flags(&self, name: &str) -> SchemaResult<AttributeFlags> {
        self.check_open()?;
        self.cache.lock().attribute_flags(&self.store, &self.registry, name)
    }

    pub fn attribute_syntax(&self, name: &str) -> SchemaResult<AttributeSyntax> {
        self.check_open()?;
        self.cache.lock().attribute_syntax(&self.store, &self.registry, name)
    }

    pub fn subclasses_of(&self, name: &str) -> SchemaResult<BTreeSet<String>> {
        self.check_open()?;
        self.cache.lock().subclasses_of(&self.store, &self.registry, name)
    }

    pub fn all_subclasses_of(&self, name: &str) -> SchemaResult<BTreeSet<String>> {
        self.check_open()?;
        self.cache.lock().all_subclasses_of(&self.store, &self.registry, name)
    }

    pub fn index_definitions(&self) -> SchemaResult<Vec<IndexDescriptor>> {
        self.check_open()?;
        self.cache.lock().index_definitions(&self.store, &self.registry)
    }

    pub fn force_reload(&self) -> SchemaResult<()> {
        self.check_open()?;
        self.cache.lock().force_reload(&self.store, &self.registry)
    }

    pub fn cache_state(&self) -> CacheState {
        self.cache.lock().state()
    }

    pub fn cached_sequence(&self) -> u64 {
        self.cache.lock().cached_sequence()
    }

    pub fn cached_generation(&self) -> u64 {
        self.cache.lock().cached_generation()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.lock().stats()
    }

    /// Run `f` against the current tables
    pub fn with_cache<T>(&self, f: impl FnOnce(&SchemaCache) -> T) -> T {
        f(&self.cache.lock())
    }

    /// Compare two values of `attribute` with the syntax the current schema
    /// gives it, fixed attribute policies included.
    pub fn compare(&self, attribute: &str, a: &[u8], b: &[u8]) -> SchemaResult<std::cmp::Ordering> {
        Ok(self.attribute_syntax(attribute)?.compare(a, b))
    }

    // -- records --

    /// Run `body` in one transaction on the underlying store.
    pub fn with_transaction<T, F>(&self, body: F) -> SchemaResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> SchemaResult<T>,
    {
        self.check_open()?;
        with_transaction(&self.store, body)
    }

    /// Write a record. Schema records other than @BASEINFO bump the sequence
    /// number in the same transaction; @ATTRIBUTES is validated first.
    pub fn put_record(&self, msg: &Message, mode: PutMode) -> SchemaResult<()> {
        self.check_open()?;
        if msg.dn == ATTRIBUTES_DN {
            parse_attributes(msg)?;
        }
        if invalidates_schema(&msg.dn) {
            self.ensure_base_info()?;
        }
        let key = record_key(&msg.dn);
        let packed = msg.pack();
        self.with_transaction(|tx| {
            tx.put(&key, &packed, mode)?;
            if invalidates_schema(&msg.dn) {
                bump_sequence(tx)?;
            }
            Ok(())
        })
    }

    pub fn delete_record(&self, dn: &str) -> SchemaResult<()> {
        self.check_open()?;
        if invalidates_schema(dn) {
            self.ensure_base_info()?;
        }
        let key = record_key(dn);
        self.with_transaction(|tx| {
            tx.delete(&key)?;
            if invalidates_schema(dn) {
                bump_sequence(tx)?;
            }
            Ok(())
        })
    }

    /// A schema write on a store nobody has queried yet still needs a
    /// sequence record to bump.
    fn ensure_base_info(&self) -> SchemaResult<()> {
        if read_base_info(&self.store)?.is_none() {
            bootstrap(&self.store)?;
        }
        Ok(())
    }

    /// The record as stored, without schema decoration
    pub fn get_record(&self, dn: &str) -> SchemaResult<Option<Message>> {
        self.check_open()?;
        match self.store.get(&record_key(dn))? {
            Some(raw) => Message::unpack(&raw, dn).map(Some),
            None => Ok(None),
        }
    }

    /// Look up `dn` and decorate it with the schema, after the staleness check.
    pub fn lookup(&self, dn: &str) -> SchemaResult<Option<DecoratedRecord>> {
        self.check_open()?;
        let mut cache = self.cache.lock();
        cache.ensure_fresh(&self.store, &self.registry)?;

        let msg = match self.store.get(&record_key(dn))? {
            Some(raw) => Message::unpack(&raw, dn)?,
            None => return Ok(None),
        };

        let mut elements = Vec::with_capacity(msg.elements.len());
        for element in msg.elements {
            let flags = cache.flags_for(&element.name)?;
            if flags.contains(AttributeFlags::HIDDEN) {
                continue;
            }
            elements.push(DecoratedElement {
                syntax: cache.syntax_for(&element.name)?,
                flags,
                name: element.name,
                values: element.values,
            });
        }
        Ok(Some(DecoratedRecord { dn: msg.dn, elements }))
    }

    /// @BASEINFO as committed
    pub fn base_info(&self) -> SchemaResult<BaseInfo> {
        self.check_open()?;
        read_base_info(&self.store)?.ok_or_else(|| SchemaError::NotFound {
            dn: BASEINFO_DN.to_string(),
        })
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.store.path())
            .field("records", &self.store.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
