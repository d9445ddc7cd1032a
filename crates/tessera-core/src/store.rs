//! Record store: the handle callers hold.
//!
//! RecordStore combines the replayed in-memory working set with the shared
//! store file and its chain locks.
//!
//! **Read path**: RAM only, no locks on the file. Inside a transaction reads
//! see the transaction's own staged writes.
//! **Write path**: chain lock, refresh, mode check, then one batch appended
//! under the append lock and synced before RAM is touched.
//! **Transactions**: mutations are staged in memory while their chain locks
//! are held, then written as a single batch at commit.
//!
//! A transaction belongs to the thread that began it. Other threads sharing
//! the handle neither see its staged writes nor join it: their mutations take
//! the non-transactional path and wait on chain locks like any other writer.
//! No lock wait or file I/O happens while the handle's transaction slot is
//! locked, so readers on the handle never queue behind a writer.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{StoreError, StoreResult};
use crate::format::{serialize_batch, Operation};
use crate::locks::{acquire, LockGuard, LockKind};
use crate::log::{Replay, StoreFile, FILE_HEADER_SIZE};

/// How `put` treats an existing or missing key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Fail with `AlreadyExists` if the key is present
    Insert,
    /// Write unconditionally
    Replace,
    /// Fail with `NotFound` if the key is absent
    Modify,
}

/// Counters describing what a handle has done since it was opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub commits: u64,
    pub cancels: u64,
    pub refreshes: u64,
    pub replayed_batches: u64,
}

#[derive(Default)]
struct Counters {
    commits: AtomicU64,
    cancels: AtomicU64,
    refreshes: AtomicU64,
    replayed_batches: AtomicU64,
}

/// Committed state as seen by this handle
struct Working {
    data: HashMap<Vec<u8>, Vec<u8>>,
    /// File offset just past the last batch applied
    applied_offset: u64,
}

impl Working {
    /// Apply replayed batches; returns the sequence of the last one.
    fn apply(&mut self, replay: Replay) -> Option<u64> {
        let mut last = None;
        for batch in replay.batches {
            for entry in batch.ops {
                match entry.operation {
                    Operation::Put => {
                        self.data.insert(entry.key, entry.value);
                    }
                    Operation::Delete => {
                        self.data.remove(&entry.key);
                    }
                    Operation::Begin | Operation::Commit => {}
                }
            }
            last = Some(batch.sequence);
        }
        self.applied_offset = self.applied_offset.max(replay.end_offset);
        last
    }
}

/// An open transaction on one handle.
///
/// Field order matters: chain guards drop before the transaction lock.
struct ActiveTxn {
    owner: ThreadId,
    /// key -> Some(value) for puts, None for deletes
    staged: HashMap<Vec<u8>, Option<Vec<u8>>>,
    /// Successful mutating calls so far
    mutations: u64,
    chains: HashMap<usize, LockGuard>,
    _lock: LockGuard,
}

/// Single-file transactional key/value record store.
///
/// All public methods take `&self`. Handles on the same path in one process
/// share a file descriptor and lock table, so several handles can be used
/// from different threads like separate processes would be.
pub struct RecordStore {
    file: Arc<StoreFile>,
    working: RwLock<Working>,
    /// Committed modification counter; read without I/O
    sequence: AtomicU64,
    txn: Mutex<Option<ActiveTxn>>,
    counters: Counters,
    config: Config,
}

impl RecordStore {
    /// Open or create the store file at `path` and replay it into RAM.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> StoreResult<Self> {
        config.validate().map_err(StoreError::InvalidState)?;
        let path = path.as_ref();

        let file = StoreFile::open_shared(path, config.hash_size)?;
        let replay = file.replay_from(FILE_HEADER_SIZE)?;
        let batches = replay.batches.len() as u64;
        let corrupt = replay.corrupt_entries;

        let mut working = Working {
            data: HashMap::new(),
            applied_offset: FILE_HEADER_SIZE,
        };
        let sequence = working.apply(replay).unwrap_or(0);

        if batches > 0 || corrupt > 0 {
            info!(
                path = %path.display(),
                records = working.data.len(),
                batches,
                corrupt_entries = corrupt,
                sequence,
                "recovered record store"
            );
        }

        let counters = Counters::default();
        counters.replayed_batches.store(batches, Ordering::Relaxed);

        Ok(Self {
            file,
            working: RwLock::new(working),
            sequence: AtomicU64::new(sequence),
            txn: Mutex::new(None),
            counters,
            config,
        })
    }

    /// Get the value for `key`.
    ///
    /// Inside a transaction this sees the transaction's staged writes.
    pub fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.lookup(key))
    }

    /// Get the last committed value for `key`, ignoring any open transaction.
    pub fn get_committed(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.working.read().data.get(key).cloned())
    }

    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(Some(staged)) = self.with_own_txn(|txn| txn.staged.get(key).cloned()) {
            return staged;
        }
        self.working.read().data.get(key).cloned()
    }

    /// Run `f` on the open transaction if the calling thread owns it.
    fn with_own_txn<R>(&self, f: impl FnOnce(&mut ActiveTxn) -> R) -> Option<R> {
        let mut txn = self.txn.lock();
        match txn.as_mut() {
            Some(active) if active.owner == thread::current().id() => Some(f(active)),
            _ => None,
        }
    }

    /// Take the calling thread's transaction out of the handle.
    fn take_own_txn(&self, action: &str) -> StoreResult<ActiveTxn> {
        let mut txn = self.txn.lock();
        match txn.as_ref().map(|active| active.owner) {
            Some(owner) if owner == thread::current().id() => {
                txn.take().ok_or_else(|| StoreError::InvalidState(format!("no transaction to {}", action)))
            }
            Some(_) => Err(StoreError::InvalidState(format!(
                "cannot {} a transaction owned by another thread",
                action
            ))),
            None => Err(StoreError::InvalidState(format!("no transaction to {}", action))),
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.lookup(key).is_some()
    }

    /// Number of committed records
    pub fn len(&self) -> usize {
        self.working.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.working.read().data.is_empty()
    }

    /// Store `value` under `key` according to `mode`.
    pub fn put(&self, key: &[u8], value: &[u8], mode: PutMode) -> StoreResult<()> {
        self.check_sizes(key, value)?;
        self.mutate(key, Some(value), mode)
    }

    /// Delete `key`. Fails with `NotFound` if it is absent.
    pub fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.mutate(key, None, PutMode::Modify)
    }

    fn mutate(&self, key: &[u8], value: Option<&[u8]>, mode: PutMode) -> StoreResult<()> {
        let chain = self.file.locks().chain_of(key);
        match self.with_own_txn(|active| active.chains.contains_key(&chain)) {
            Some(held) => self.stage(key, value, mode, chain, held),
            None => {
                let _chain = acquire(&self.file, LockKind::Chain(chain), self.config.lock_timeout)?;
                self.refresh()?;
                let exists = self.working.read().data.contains_key(key);
                check_mode(key, exists, mode)?;
                self.commit_batch(vec![(key.to_vec(), value.map(<[u8]>::to_vec))], 1)
            }
        }
    }

    /// Stage a mutation in the calling thread's transaction.
    fn stage(&self, key: &[u8], value: Option<&[u8]>, mode: PutMode, chain: usize, held: bool) -> StoreResult<()> {
        let ended = || StoreError::InvalidState("transaction ended while staging".into());

        if !held {
            let guard = acquire(&self.file, LockKind::Chain(chain), self.config.lock_timeout)?;
            self.refresh()?;
            self.with_own_txn(move |active| {
                active.chains.insert(chain, guard);
            })
            .ok_or_else(ended)?;
        }

        self.with_own_txn(|active| -> StoreResult<()> {
            let exists = match active.staged.get(key) {
                Some(staged) => staged.is_some(),
                None => self.working.read().data.contains_key(key),
            };
            check_mode(key, exists, mode)?;
            active.staged.insert(key.to_vec(), value.map(<[u8]>::to_vec));
            active.mutations += 1;
            Ok(())
        })
        .unwrap_or_else(|| Err(ended()))
    }

    fn check_sizes(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        if key.len() > self.config.max_key_size {
            return Err(StoreError::OversizedEntry {
                entry_size: key.len() as u64,
                max_size: self.config.max_key_size as u64,
                component: "key".into(),
            });
        }
        if value.len() > self.config.max_value_size {
            return Err(StoreError::OversizedEntry {
                entry_size: value.len() as u64,
                max_size: self.config.max_value_size as u64,
                component: "value".into(),
            });
        }
        Ok(())
    }

    /// Write one batch and apply it. Caller holds the chain locks of every key.
    fn commit_batch(&self, ops: Vec<(Vec<u8>, Option<Vec<u8>>)>, mutations: u64) -> StoreResult<()> {
        let _append = acquire(&self.file, LockKind::Append, self.config.lock_timeout)?;
        self.refresh()?;
        // Nobody else can be appending: anything past the last commit is a torn write.
        let applied = self.working.read().applied_offset;
        self.file.truncate_to(applied)?;

        let next = self
            .sequence
            .load(Ordering::Acquire)
            .checked_add(mutations)
            .ok_or_else(|| StoreError::InvalidState("modification counter overflow".into()))?;
        let buffer = serialize_batch(&ops, next)?;
        let end = self.file.append_batch(&buffer, self.config.sync_on_commit)?;

        let mut working = self.working.write();
        for (key, value) in ops {
            match value {
                Some(value) => {
                    working.data.insert(key, value);
                }
                None => {
                    working.data.remove(&key);
                }
            }
        }
        working.applied_offset = working.applied_offset.max(end);
        self.sequence.fetch_max(next, Ordering::AcqRel);
        self.counters.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Lazy iteration over every record, in key order.
    ///
    /// The key set is snapshotted when iteration starts; values are fetched
    /// as the iterator advances, so records deleted meanwhile are skipped.
    /// Call again to restart.
    pub fn iterate(&self) -> RecordIter<'_> {
        let mut keys: Vec<Vec<u8>> = self.working.read().data.keys().cloned().collect();
        self.with_own_txn(|txn| {
            for (key, value) in &txn.staged {
                match value {
                    Some(_) => keys.push(key.clone()),
                    None => keys.retain(|k| k != key),
                }
            }
        });
        keys.sort_unstable();
        keys.dedup();
        RecordIter {
            store: self,
            keys: keys.into_iter(),
        }
    }

    /// Committed records whose key starts with `prefix`, sorted by key.
    pub fn prefix_scan(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let data = self.working.read();
        let mut results: Vec<(Vec<u8>, Vec<u8>)> = data
            .data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        results.sort_by(|(a, _), (b, _)| a.cmp(b));
        results
    }

    /// The committed modification counter. Never does I/O.
    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Refresh only if the file no longer ends where this handle's replay
    /// stopped. Costs one `fstat` when nothing changed. Returns whether a
    /// replay ran.
    pub fn refresh_if_changed(&self) -> StoreResult<bool> {
        let size = self.file.size()?;
        if size == self.working.read().applied_offset {
            return Ok(false);
        }
        self.refresh()?;
        Ok(true)
    }

    /// Apply batches other handles or processes appended since the last refresh.
    pub fn refresh(&self) -> StoreResult<()> {
        let mut working = self.working.write();
        let replay = self.file.replay_from(working.applied_offset)?;
        if replay.batches.is_empty() && replay.end_offset == working.applied_offset {
            return Ok(());
        }
        let batches = replay.batches.len() as u64;
        if let Some(sequence) = working.apply(replay) {
            self.sequence.fetch_max(sequence, Ordering::AcqRel);
        }
        self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
        self.counters.replayed_batches.fetch_add(batches, Ordering::Relaxed);
        debug!(batches, offset = working.applied_offset, "refreshed from store file");
        Ok(())
    }

    /// Durably sync the store file (useful without `sync_on_commit`).
    pub fn sync(&self) -> StoreResult<()> {
        self.file.sync()
    }

    /// Begin a transaction owned by the calling thread. Nested transactions
    /// are rejected; a transaction another thread holds on this handle is
    /// waited for like one held by another handle.
    pub fn transaction_begin(&self) -> StoreResult<()> {
        if self.in_transaction() {
            return Err(StoreError::InvalidState("transaction already active".into()));
        }

        let lock = acquire(&self.file, LockKind::Transaction, self.config.lock_timeout)?;
        self.refresh()?;

        let mut txn = self.txn.lock();
        if txn.is_some() {
            return Err(StoreError::InvalidState("transaction already active".into()));
        }
        *txn = Some(ActiveTxn {
            owner: thread::current().id(),
            staged: HashMap::new(),
            mutations: 0,
            chains: HashMap::new(),
            _lock: lock,
        });
        debug!(path = %self.file.path().display(), "transaction begin");
        Ok(())
    }

    /// Commit the open transaction as one batch.
    ///
    /// Any failure is reported as `CommitFailed` and nothing is applied.
    /// Locks are released whether or not the commit succeeds.
    pub fn transaction_commit(&self) -> StoreResult<()> {
        let active = self.take_own_txn("commit")?;

        if active.staged.is_empty() {
            self.counters.commits.fetch_add(1, Ordering::Relaxed);
            debug!("empty transaction committed");
            return Ok(());
        }

        let ActiveTxn {
            staged,
            mutations,
            chains,
            _lock: lock,
            ..
        } = active;

        let mut ops: Vec<(Vec<u8>, Option<Vec<u8>>)> = staged.into_iter().collect();
        ops.sort_by(|(a, _), (b, _)| a.cmp(b));
        let count = ops.len();

        let result = self
            .commit_batch(ops, mutations)
            .map_err(|e| StoreError::CommitFailed { reason: e.to_string() });
        drop(chains);
        drop(lock);

        result?;
        debug!(records = count, sequence = self.current_sequence(), "transaction commit");
        Ok(())
    }

    /// Discard the open transaction's staged writes and release its locks.
    pub fn transaction_cancel(&self) -> StoreResult<()> {
        let active = self.take_own_txn("cancel")?;
        self.counters.cancels.fetch_add(1, Ordering::Relaxed);
        debug!(discarded = active.staged.len(), "transaction cancel");
        Ok(())
    }

    /// Whether the calling thread has a transaction open on this handle
    pub fn in_transaction(&self) -> bool {
        self.with_own_txn(|_| ()).is_some()
    }

    /// Path of the store file
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            commits: self.counters.commits.load(Ordering::Relaxed),
            cancels: self.counters.cancels.load(Ordering::Relaxed),
            refreshes: self.counters.refreshes.load(Ordering::Relaxed),
            replayed_batches: self.counters.replayed_batches.load(Ordering::Relaxed),
        }
    }
}

impl Drop for RecordStore {
    fn drop(&mut self) {
        if let Some(active) = self.txn.get_mut().take() {
            debug!(discarded = active.staged.len(), "cancelling transaction left open at close");
        }
    }
}

fn check_mode(key: &[u8], exists: bool, mode: PutMode) -> StoreResult<()> {
    match (mode, exists) {
        (PutMode::Insert, true) => Err(StoreError::AlreadyExists { key: key.to_vec() }),
        (PutMode::Modify, false) => Err(StoreError::NotFound { key: key.to_vec() }),
        _ => Ok(()),
    }
}

/// Iterator returned by [`RecordStore::iterate`]
pub struct RecordIter<'a> {
    store: &'a RecordStore,
    keys: std::vec::IntoIter<Vec<u8>>,
}

impl Iterator for RecordIter<'_> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            if let Some(value) = self.store.lookup(&key) {
                return Some((key, value));
            }
        }
        None
    }
}
