//! The @BASEINFO sequence record and its bumper
//!
//! `SEQUENCE_NUMBER` counts schema-invalidating writes. It is bumped inside
//! the same transaction as the write, so the invalidation commits or rolls
//! back with it. `MOD_TIMESTAMP` is best-effort metadata next to it.

use chrono::Utc;
use tracing::{info, warn};

use tessera_core::{with_transaction, PutMode, RecordStore, Transaction};

use crate::error::{SchemaError, SchemaResult};
use crate::message::{record_key, Message};

pub const BASEINFO_DN: &str = "@BASEINFO";
pub const SEQUENCE_NUMBER: &str = "SEQUENCE_NUMBER";
pub const MOD_TIMESTAMP: &str = "MOD_TIMESTAMP";

/// Generalized time, UTC
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S.0Z";

/// Contents of @BASEINFO
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseInfo {
    pub sequence: u64,
    pub mod_timestamp: Option<String>,
}

impl BaseInfo {
    pub fn from_message(msg: &Message) -> SchemaResult<Self> {
        Ok(Self {
            sequence: parse_sequence(msg)?,
            mod_timestamp: msg.first_str(MOD_TIMESTAMP).map(str::to_string),
        })
    }
}

pub fn timestamp_now() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

fn parse_sequence(msg: &Message) -> SchemaResult<u64> {
    let raw = msg
        .first_str(SEQUENCE_NUMBER)
        .ok_or_else(|| SchemaError::malformed_record(BASEINFO_DN, "missing SEQUENCE_NUMBER"))?;
    raw.trim()
        .parse()
        .map_err(|_| SchemaError::malformed_record(BASEINFO_DN, format!("bad SEQUENCE_NUMBER {:?}", raw)))
}

/// Committed @BASEINFO, if the record exists
pub fn read_base_info(store: &RecordStore) -> SchemaResult<Option<BaseInfo>> {
    match store.get_committed(&record_key(BASEINFO_DN))? {
        Some(raw) => BaseInfo::from_message(&Message::unpack(&raw, BASEINFO_DN)?).map(Some),
        None => Ok(None),
    }
}

/// Create @BASEINFO with `SEQUENCE_NUMBER = 1` if absent, in one transaction.
///
/// Returns true if this call created it.
pub fn bootstrap(store: &RecordStore) -> SchemaResult<bool> {
    let key = record_key(BASEINFO_DN);
    let created = with_transaction(store, |tx| -> SchemaResult<bool> {
        // Another handle may have created it since we looked.
        if tx.get(&key)?.is_some() {
            return Ok(false);
        }
        let msg = Message::new(BASEINFO_DN)
            .with_value(SEQUENCE_NUMBER, "1")
            .with_value(MOD_TIMESTAMP, timestamp_now());
        tx.put(&key, &msg.pack(), PutMode::Insert)?;
        Ok(true)
    })?;
    if created {
        info!(path = %store.path().display(), "initialised @BASEINFO");
    }
    Ok(created)
}

/// Increment `SEQUENCE_NUMBER` inside `tx`. Returns the new value.
///
/// Fails with `SequenceOverflow` rather than wrapping. A failure to update
/// `MOD_TIMESTAMP` is logged and otherwise ignored.
pub fn bump_sequence(tx: &Transaction<'_>) -> SchemaResult<u64> {
    let key = record_key(BASEINFO_DN);
    let raw = tx.get(&key)?.ok_or_else(|| SchemaError::NotFound {
        dn: BASEINFO_DN.to_string(),
    })?;
    let mut msg = Message::unpack(&raw, BASEINFO_DN)?;

    let current = parse_sequence(&msg)?;
    let next = current
        .checked_add(1)
        .ok_or(SchemaError::SequenceOverflow { current })?;

    msg.set_value(SEQUENCE_NUMBER, next.to_string());
    tx.put(&key, &msg.pack(), PutMode::Replace)?;

    msg.set_value(MOD_TIMESTAMP, timestamp_now());
    if let Err(e) = tx.put(&key, &msg.pack(), PutMode::Modify) {
        warn!(error = %e, "failed to update MOD_TIMESTAMP");
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tessera_core::Config;

    fn test_store() -> (RecordStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(dir.path().join("seq.tdb"), Config::ephemeral()).unwrap();
        (store, dir)
    }

    #[test]
    fn test_bootstrap_once() {
        let (store, _dir) = test_store();
        assert!(read_base_info(&store).unwrap().is_none());

        assert!(bootstrap(&store).unwrap());
        assert!(!bootstrap(&store).unwrap());

        let info = read_base_info(&store).unwrap().unwrap();
        assert_eq!(info.sequence, 1);
        assert!(info.mod_timestamp.is_some());
        assert_eq!(store.current_sequence(), 1);
    }

    #[test]
    fn test_bump() {
        let (store, _dir) = test_store();
        bootstrap(&store).unwrap();

        let next = with_transaction(&store, |tx| bump_sequence(tx)).unwrap();
        assert_eq!(next, 2);
        assert_eq!(read_base_info(&store).unwrap().unwrap().sequence, 2);
    }

    #[test]
    fn test_bump_rolls_back_with_transaction() {
        let (store, _dir) = test_store();
        bootstrap(&store).unwrap();

        let result: SchemaResult<()> = with_transaction(&store, |tx| {
            bump_sequence(tx)?;
            Err(SchemaError::InvalidState("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(read_base_info(&store).unwrap().unwrap().sequence, 1);
    }

    #[test]
    fn test_bump_without_baseinfo() {
        let (store, _dir) = test_store();
        let result = with_transaction(&store, |tx| bump_sequence(tx));
        assert!(matches!(result, Err(SchemaError::NotFound { .. })));
    }

    #[test]
    fn test_timestamp_format() {
        let ts = timestamp_now();
        assert_eq!(ts.len(), "20261016093000.0Z".len());
        assert!(ts.ends_with(".0Z"));
        assert!(ts[..14].bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn test_malformed_sequence() {
        let msg = Message::new(BASEINFO_DN).with_value(SEQUENCE_NUMBER, "twelve");
        assert!(matches!(BaseInfo::from_message(&msg), Err(SchemaError::MalformedRecord { .. })));
        let msg = Message::new(BASEINFO_DN);
        assert!(matches!(BaseInfo::from_message(&msg), Err(SchemaError::MalformedRecord { .. })));
    }
}
