//! Schema cache: tables derived from the special records, kept coherent with
//! the store's sequence number.
//!
//! Every query first runs the staleness check, in two tiers:
//!
//! 1. the record store's modification counter against `cached_generation`,
//!    after the store has replayed whatever other handles or processes
//!    appended (one `fstat` when the file has not grown)
//! 2. @BASEINFO's `SEQUENCE_NUMBER` against `cached_sequence` (equal means
//!    only data changed, the tables are still current)
//!
//! Only when tier 2 differs are the tables rebuilt. A rebuild parses
//! everything before touching the live tables: if it fails, the last good
//! tables and their registered handlers stay in place, the cache goes to
//! `Failed`, and queries error until a reload succeeds.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use tessera_core::RecordStore;

use crate::attribute::{AttributeFlags, AttributeSyntax};
use crate::error::{SchemaError, SchemaResult};
use crate::loader::{load_tables, IndexDescriptor, LoadCounters, SchemaTables};
use crate::registry::{HandlerDescriptor, HandlerRegistry, WILDCARD_ATTRIBUTE};
use crate::sequence::{bootstrap, read_base_info, BaseInfo};

/// Attribute holding a record's object classes
pub const OBJECTCLASS_ATTRIBUTE: &str = "objectClass";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Nothing loaded yet, or torn down
    Unloaded,
    Loaded,
    /// The last reload failed; queries fail until one succeeds
    Failed,
}

/// Counters for observing cache behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Successful table rebuilds
    pub reloads: u64,
    /// Failed table rebuilds
    pub failed_reloads: u64,
    /// Times @ATTRIBUTES was read
    pub attribute_record_reads: u64,
    /// `attribute_flags` answered from the one-entry memo
    pub memo_hits: u64,
    /// Staleness checks that had to read @BASEINFO
    pub baseinfo_reads: u64,
}

pub struct SchemaCache {
    state: CacheState,
    /// Record store modification counter at the last validation
    cached_generation: u64,
    /// SEQUENCE_NUMBER the tables were built from
    cached_sequence: u64,
    tables: Option<SchemaTables>,
    /// Attributes whose handlers this cache registered
    registered: Vec<String>,
    last_attribute_lookup: Option<(String, AttributeFlags)>,
    counters: LoadCounters,
    stats: CacheStats,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaCache {
    pub fn new() -> Self {
        Self {
            state: CacheState::Unloaded,
            cached_generation: 0,
            cached_sequence: 0,
            tables: None,
            registered: Vec::new(),
            last_attribute_lookup: None,
            counters: LoadCounters::default(),
            stats: CacheStats::default(),
        }
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn cached_sequence(&self) -> u64 {
        self.cached_sequence
    }

    pub fn cached_generation(&self) -> u64 {
        self.cached_generation
    }

    /// The tables currently in use (the last good ones after a failed reload)
    pub fn tables(&self) -> Option<&SchemaTables> {
        self.tables.as_ref()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            attribute_record_reads: self.counters.attribute_record_reads,
            ..self.stats
        }
    }

    /// Bring the tables up to date with `store`. Runs before every query.
    pub fn ensure_fresh(&mut self, store: &RecordStore, registry: &HandlerRegistry) -> SchemaResult<()> {
        store.refresh_if_changed()?;

        if self.state == CacheState::Loaded && self.cached_generation == store.current_sequence() {
            return Ok(());
        }

        let (base, generation) = self.read_base(store)?;
        if self.state == CacheState::Loaded && base.sequence == self.cached_sequence {
            debug!(
                generation,
                sequence = base.sequence,
                "store changed, schema sequence unchanged"
            );
            self.cached_generation = generation;
            return Ok(());
        }

        self.reload(store, registry, base.sequence, generation)
    }

    /// Rebuild the tables regardless of sequence numbers.
    pub fn force_reload(&mut self, store: &RecordStore, registry: &HandlerRegistry) -> SchemaResult<()> {
        store.refresh()?;
        let (base, generation) = self.read_base(store)?;
        self.reload(store, registry, base.sequence, generation)
    }

    /// @BASEINFO, creating it on a brand-new store, plus the store generation
    /// it was read at.
    fn read_base(&mut self, store: &RecordStore) -> SchemaResult<(BaseInfo, u64)> {
        self.stats.baseinfo_reads += 1;
        // Captured before reading so a concurrent write is caught by the next check.
        let generation = store.current_sequence();
        if let Some(base) = read_base_info(store)? {
            return Ok((base, generation));
        }

        bootstrap(store)?;
        let generation = store.current_sequence();
        let base = read_base_info(store)?.ok_or_else(|| SchemaError::NotFound {
            dn: crate::sequence::BASEINFO_DN.to_string(),
        })?;
        Ok((base, generation))
    }

    fn reload(
        &mut self,
        store: &RecordStore,
        registry: &HandlerRegistry,
        sequence: u64,
        generation: u64,
    ) -> SchemaResult<()> {
        let tables = match load_tables(store, &mut self.counters) {
            Ok(tables) => tables,
            Err(e) => {
                self.state = CacheState::Failed;
                self.stats.failed_reloads += 1;
                warn!(error = %e, sequence, "schema reload failed, keeping previous tables");
                return Err(e);
            }
        };

        // Old handlers go before the tables they were derived from.
        self.deregister_handlers(registry);
        self.tables = None;
        self.last_attribute_lookup = None;

        for (name, entry) in &tables.attributes {
            registry.register(
                name,
                HandlerDescriptor {
                    syntax: entry.syntax,
                    flags: entry.flags,
                },
            );
            self.registered.push(name.clone());
        }

        info!(
            from = self.cached_sequence,
            to = sequence,
            attributes = tables.attributes.len(),
            subclasses = tables.subclasses.len(),
            indexes = tables.indexes.len(),
            "schema cache reloaded"
        );
        self.tables = Some(tables);
        self.cached_sequence = sequence;
        self.cached_generation = generation;
        self.state = CacheState::Loaded;
        self.stats.reloads += 1;
        Ok(())
    }

    fn deregister_handlers(&mut self, registry: &HandlerRegistry) {
        for name in self.registered.drain(..) {
            registry.deregister(&name);
        }
    }

    /// Deregister handlers and drop the tables.
    pub fn unload(&mut self, registry: &HandlerRegistry) {
        self.deregister_handlers(registry);
        self.tables = None;
        self.last_attribute_lookup = None;
        self.state = CacheState::Unloaded;
    }

    fn loaded_tables(&self) -> SchemaResult<&SchemaTables> {
        match (self.state, &self.tables) {
            (CacheState::Loaded, Some(tables)) => Ok(tables),
            _ => Err(SchemaError::InvalidState("schema cache is not loaded".into())),
        }
    }

    pub fn attribute_flags(
        &mut self,
        store: &RecordStore,
        registry: &HandlerRegistry,
        name: &str,
    ) -> SchemaResult<AttributeFlags> {
        self.ensure_fresh(store, registry)?;
        self.flags_for(name)
    }

    /// Flags for `name` from the current tables; the caller has run the
    /// staleness check.
    pub(crate) fn flags_for(&mut self, name: &str) -> SchemaResult<AttributeFlags> {
        if let Some((memo, flags)) = &self.last_attribute_lookup {
            if memo == name {
                self.stats.memo_hits += 1;
                return Ok(*flags);
            }
        }

        let tables = self.loaded_tables()?;
        let mut flags = tables
            .attributes
            .get(name)
            .or_else(|| tables.attributes.get(WILDCARD_ATTRIBUTE))
            .map(|entry| entry.flags)
            .unwrap_or_default();
        if name == OBJECTCLASS_ATTRIBUTE {
            flags |= AttributeFlags::OBJECTCLASS | AttributeFlags::CASE_INSENSITIVE;
        }

        self.last_attribute_lookup = Some((name.to_string(), flags));
        Ok(flags)
    }

    /// Syntax `name` compares with; the caller has run the staleness check.
    pub(crate) fn syntax_for(&self, name: &str) -> SchemaResult<AttributeSyntax> {
        let tables = self.loaded_tables()?;
        let syntax = tables
            .attributes
            .get(name)
            .or_else(|| tables.attributes.get(WILDCARD_ATTRIBUTE))
            .map_or(AttributeSyntax::OctetString, |entry| entry.syntax);
        // objectClass is always matched case-insensitively.
        if name == OBJECTCLASS_ATTRIBUTE && syntax == AttributeSyntax::OctetString {
            return Ok(AttributeSyntax::DirectoryString);
        }
        Ok(syntax)
    }

    pub fn attribute_syntax(
        &mut self,
        store: &RecordStore,
        registry: &HandlerRegistry,
        name: &str,
    ) -> SchemaResult<AttributeSyntax> {
        self.ensure_fresh(store, registry)?;
        self.syntax_for(name)
    }

    /// Direct subclasses of `name`
    pub fn subclasses_of(
        &mut self,
        store: &RecordStore,
        registry: &HandlerRegistry,
        name: &str,
    ) -> SchemaResult<BTreeSet<String>> {
        self.ensure_fresh(store, registry)?;
        let tables = self.loaded_tables()?;
        Ok(tables.subclasses.get(name).cloned().unwrap_or_default())
    }

    /// Every class below `name`, at any depth. Cycles are tolerated.
    pub fn all_subclasses_of(
        &mut self,
        store: &RecordStore,
        registry: &HandlerRegistry,
        name: &str,
    ) -> SchemaResult<BTreeSet<String>> {
        self.ensure_fresh(store, registry)?;
        let tables = self.loaded_tables()?;

        let mut found = BTreeSet::new();
        let mut pending = vec![name.to_string()];
        while let Some(class) = pending.pop() {
            if let Some(children) = tables.subclasses.get(&class) {
                for child in children {
                    if child != name && found.insert(child.clone()) {
                        pending.push(child.clone());
                    }
                }
            }
        }
        Ok(found)
    }

    pub fn index_definitions(
        &mut self,
        store: &RecordStore,
        registry: &HandlerRegistry,
    ) -> SchemaResult<Vec<IndexDescriptor>> {
        self.ensure_fresh(store, registry)?;
        Ok(self.loaded_tables()?.indexes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ATTRIBUTES_DN;
    use crate::message::{record_key, Message};
    use tempfile::TempDir;
    use tessera_core::{Config, PutMode};

    fn test_store() -> (RecordStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path().join("cache.tdb"), Config::ephemeral()).unwrap();
        (store, dir)
    }

    fn write_attributes(store: &RecordStore, msg: &Message) {
        store.put(&record_key(ATTRIBUTES_DN), &msg.pack(), PutMode::Replace).unwrap();
    }

    #[test]
    fn test_first_query_bootstraps_and_loads() {
        let (store, _dir) = test_store();
        let registry = HandlerRegistry::new();
        let mut cache = SchemaCache::new();
        assert_eq!(cache.state(), CacheState::Unloaded);

        assert!(cache.attribute_flags(&store, &registry, "cn").unwrap().is_empty());
        assert_eq!(cache.state(), CacheState::Loaded);
        assert_eq!(cache.cached_sequence(), 1);
        assert_eq!(cache.cached_generation(), store.current_sequence());
        assert_eq!(store.stats().commits, 1);
    }

    #[test]
    fn test_data_write_does_not_reload() {
        let (store, _dir) = test_store();
        let registry = HandlerRegistry::new();
        let mut cache = SchemaCache::new();
        cache.ensure_fresh(&store, &registry).unwrap();

        store.put(b"DN=cn=user", b"data", PutMode::Replace).unwrap();
        cache.ensure_fresh(&store, &registry).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.reloads, 1);
        assert_eq!(stats.baseinfo_reads, 2);
        assert_eq!(cache.cached_generation(), store.current_sequence());

        // Nothing changed at all: tier one answers without reading @BASEINFO.
        cache.ensure_fresh(&store, &registry).unwrap();
        assert_eq!(cache.stats().baseinfo_reads, 2);
    }

    #[test]
    fn test_failed_reload_keeps_tables_and_handlers() {
        let (store, _dir) = test_store();
        let registry = HandlerRegistry::new();
        let mut cache = SchemaCache::new();

        write_attributes(&store, &Message::new(ATTRIBUTES_DN).with_value("cn", "CASE_INSENSITIVE"));
        cache.force_reload(&store, &registry).unwrap();
        let good = cache.tables().cloned();

        write_attributes(&store, &Message::new(ATTRIBUTES_DN).with_value("cn", "BOGUS"));
        let err = cache.force_reload(&store, &registry).unwrap_err();
        assert!(matches!(err, SchemaError::MalformedSchema { .. }));

        assert_eq!(cache.state(), CacheState::Failed);
        assert_eq!(cache.tables().cloned(), good);
        assert_eq!(registry.get("cn").unwrap().syntax, AttributeSyntax::DirectoryString);
        assert!(cache.attribute_flags(&store, &registry, "cn").is_err());

        // Fixing the record makes queries work again.
        write_attributes(&store, &Message::new(ATTRIBUTES_DN).with_value("cn", "INTEGER"));
        assert_eq!(
            cache.attribute_flags(&store, &registry, "cn").unwrap(),
            AttributeFlags::INTEGER
        );
        assert_eq!(cache.state(), CacheState::Loaded);
    }

    #[test]
    fn test_unload_deregisters() {
        let (store, _dir) = test_store();
        let registry = HandlerRegistry::new();
        let mut cache = SchemaCache::new();
        write_attributes(
            &store,
            &Message::new(ATTRIBUTES_DN)
                .with_value("cn", "CASE_INSENSITIVE")
                .with_value("*", "NONE"),
        );
        cache.force_reload(&store, &registry).unwrap();
        assert_eq!(registry.len(), 2);

        cache.unload(&registry);
        assert!(registry.is_empty());
        assert!(cache.tables().is_none());
        assert_eq!(cache.state(), CacheState::Unloaded);
    }

    #[test]
    fn test_wildcard_and_objectclass() {
        let (store, _dir) = test_store();
        let registry = HandlerRegistry::new();
        let mut cache = SchemaCache::new();
        write_attributes(
            &store,
            &Message::new(ATTRIBUTES_DN)
                .with_value("*", "CASE_INSENSITIVE")
                .with_value("objectClass", "HIDDEN"),
        );

        assert_eq!(
            cache.attribute_flags(&store, &registry, "anything").unwrap(),
            AttributeFlags::CASE_INSENSITIVE
        );
        // Attribute names are case-sensitive: this is an unlisted attribute.
        assert_eq!(
            cache.attribute_flags(&store, &registry, "objectclass").unwrap(),
            AttributeFlags::CASE_INSENSITIVE
        );
        assert_eq!(
            cache.attribute_flags(&store, &registry, "objectClass").unwrap(),
            AttributeFlags::HIDDEN | AttributeFlags::CASE_INSENSITIVE | AttributeFlags::OBJECTCLASS
        );
        assert_eq!(
            cache.attribute_syntax(&store, &registry, "objectClass").unwrap(),
            AttributeSyntax::DirectoryString
        );
    }

    #[test]
    fn test_all_subclasses_handles_cycles() {
        let (store, _dir) = test_store();
        let registry = HandlerRegistry::new();
        let mut cache = SchemaCache::new();
        let msg = Message::new(crate::loader::SUBCLASSES_DN)
            .with_value("top", "person")
            .with_value("person", "user")
            .with_value("user", "computer")
            .with_value("computer", "top");
        store.put(&record_key(&msg.dn), &msg.pack(), PutMode::Replace).unwrap();

        let direct = cache.subclasses_of(&store, &registry, "person").unwrap();
        assert_eq!(direct.into_iter().collect::<Vec<_>>(), vec!["user"]);

        let all = cache.all_subclasses_of(&store, &registry, "person").unwrap();
        assert_eq!(all.into_iter().collect::<Vec<_>>(), vec!["computer", "top", "user"]);
        assert!(cache.subclasses_of(&store, &registry, "nobody").unwrap().is_empty());
    }
}
