//! Store bootstrap: environment opening, table creation, schema versioning,
//! and one-shot corruption recovery.
//!
//! The backing engine is LMDB via heed: one environment, one named database
//! per logical table, `Bytes` keys with manual big-endian encoding and JSON
//! values. LMDB write transactions serialize all writers and give each
//! multi-statement operation crash atomicity.

use std::path::Path;

use courier_core::{RequestKind, RowId, StoreError};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RwTxn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, warn};

/// Bumped whenever the persisted layout changes incompatibly. A mismatch
/// drops and recreates every table: durability here is about pending-work
/// continuity, not archival record-keeping.
pub const SCHEMA_VERSION: i32 = 3;

const META_SCHEMA_KEY: &[u8] = b"schema_version";

pub(crate) const POSTAL: &str = "postal";
pub(crate) const RETRIEVAL: &str = "retrieval";
pub(crate) const INTEREST: &str = "interest";
pub(crate) const POSTAL_DISPOSAL: &str = "postal_disposal";
pub(crate) const RETRIEVAL_DISPOSAL: &str = "retrieval_disposal";
pub(crate) const INTEREST_DISPOSAL: &str = "interest_disposal";
pub(crate) const CHANNEL: &str = "channel";
pub(crate) const PRESENCE: &str = "presence";
pub(crate) const CAPABILITY: &str = "capability";
const META: &str = "meta";

/// Handles to every named database in the environment.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tables {
    pub postal: Database<Bytes, Bytes>,
    pub retrieval: Database<Bytes, Bytes>,
    pub interest: Database<Bytes, Bytes>,
    pub postal_disposal: Database<Bytes, Bytes>,
    pub retrieval_disposal: Database<Bytes, Bytes>,
    pub interest_disposal: Database<Bytes, Bytes>,
    pub channel: Database<Bytes, Bytes>,
    pub presence: Database<Bytes, Bytes>,
    pub capability: Database<Bytes, Bytes>,
    pub meta: Database<Bytes, Bytes>,
}

impl Tables {
    pub fn request_db(&self, kind: RequestKind) -> Database<Bytes, Bytes> {
        match kind {
            RequestKind::Postal => self.postal,
            RequestKind::Retrieval => self.retrieval,
            RequestKind::Interest => self.interest,
        }
    }

    pub fn disposal_db(&self, kind: RequestKind) -> Database<Bytes, Bytes> {
        match kind {
            RequestKind::Postal => self.postal_disposal,
            RequestKind::Retrieval => self.retrieval_disposal,
            RequestKind::Interest => self.interest_disposal,
        }
    }

    pub fn request_table_name(kind: RequestKind) -> &'static str {
        match kind {
            RequestKind::Postal => POSTAL,
            RequestKind::Retrieval => RETRIEVAL,
            RequestKind::Interest => INTEREST,
        }
    }

    pub fn disposal_table_name(kind: RequestKind) -> &'static str {
        match kind {
            RequestKind::Postal => POSTAL_DISPOSAL,
            RequestKind::Retrieval => RETRIEVAL_DISPOSAL,
            RequestKind::Interest => INTEREST_DISPOSAL,
        }
    }

    fn all(&self) -> [Database<Bytes, Bytes>; 10] {
        [
            self.postal,
            self.retrieval,
            self.interest,
            self.postal_disposal,
            self.retrieval_disposal,
            self.interest_disposal,
            self.channel,
            self.presence,
            self.capability,
            self.meta,
        ]
    }
}

/// Open the environment and bootstrap every table, recovering once from an
/// unreadable store file.
pub(crate) fn open_store(
    path: &Path,
    map_size_mb: usize,
) -> Result<(Env, Tables), StoreError> {
    std::fs::create_dir_all(path).map_err(|e| StoreError::Corruption {
        reason: format!("cannot create store directory: {}", e),
    })?;

    let env = match open_env(path, map_size_mb) {
        Ok(env) => env,
        Err(first) => {
            error!(
                path = %path.display(),
                error = %first,
                "store unreadable, archiving and recreating"
            );
            archive_corrupt(path);
            open_env(path, map_size_mb).map_err(|e| StoreError::Corruption {
                reason: format!("store unreadable after recovery: {}", e),
            })?
        }
    };

    let mut wtxn = env.write_txn().map_err(txn_err)?;
    let tables = create_tables(&env, &mut wtxn)?;
    ensure_schema(&tables, &mut wtxn)?;
    wtxn.commit().map_err(txn_err)?;

    Ok((env, tables))
}

fn open_env(path: &Path, map_size_mb: usize) -> Result<Env, heed::Error> {
    unsafe {
        EnvOpenOptions::new()
            .map_size(map_size_mb * 1024 * 1024)
            .max_dbs(10)
            .open(path)
    }
}

fn create_tables(env: &Env, wtxn: &mut RwTxn) -> Result<Tables, StoreError> {
    let mut create = |name: &str| -> Result<Database<Bytes, Bytes>, StoreError> {
        env.create_database(wtxn, Some(name))
            .map_err(|e| StoreError::Transaction {
                reason: format!("cannot create table {}: {}", name, e),
            })
    };

    Ok(Tables {
        postal: create(POSTAL)?,
        retrieval: create(RETRIEVAL)?,
        interest: create(INTEREST)?,
        postal_disposal: create(POSTAL_DISPOSAL)?,
        retrieval_disposal: create(RETRIEVAL_DISPOSAL)?,
        interest_disposal: create(INTEREST_DISPOSAL)?,
        channel: create(CHANNEL)?,
        presence: create(PRESENCE)?,
        capability: create(CAPABILITY)?,
        meta: create(META)?,
    })
}

/// Compare the stored schema version with ours; on mismatch wipe every table
/// and stamp the current version.
fn ensure_schema(tables: &Tables, wtxn: &mut RwTxn) -> Result<(), StoreError> {
    let stored = tables
        .meta
        .get(wtxn, META_SCHEMA_KEY)
        .map_err(txn_err)?
        .map(decode_i32)
        .transpose()?;

    match stored {
        Some(version) if version == SCHEMA_VERSION => Ok(()),
        Some(version) => {
            warn!(
                found = version,
                expected = SCHEMA_VERSION,
                "schema version mismatch, dropping all tables"
            );
            for db in tables.all() {
                db.clear(wtxn).map_err(txn_err)?;
            }
            stamp_schema(tables, wtxn)
        }
        None => stamp_schema(tables, wtxn),
    }
}

fn stamp_schema(tables: &Tables, wtxn: &mut RwTxn) -> Result<(), StoreError> {
    tables
        .meta
        .put(wtxn, META_SCHEMA_KEY, &SCHEMA_VERSION.to_be_bytes())
        .map_err(txn_err)
}

/// Archive the unreadable store file as `corrupted.mdb`, replacing any
/// previous backup; if even the rename fails, delete the file outright so
/// the retry starts from an empty store rather than a half-open one.
fn archive_corrupt(path: &Path) {
    let data = path.join("data.mdb");
    let backup = path.join("corrupted.mdb");
    let _ = std::fs::remove_file(&backup);
    if let Err(e) = std::fs::rename(&data, &backup) {
        warn!(error = %e, "archive rename failed, deleting store file");
        let _ = std::fs::remove_file(&data);
    }
    let _ = std::fs::remove_file(path.join("lock.mdb"));
}

// ============================================================================
// SEQUENCES AND ENCODING
// ============================================================================

/// Allocate the next row id for a table from its persisted sequence.
pub(crate) fn next_row_id(
    tables: &Tables,
    wtxn: &mut RwTxn,
    table: &str,
) -> Result<RowId, StoreError> {
    let key = seq_key(table);
    let last = match tables.meta.get(wtxn, &key).map_err(txn_err)? {
        Some(bytes) => decode_u64(bytes)?,
        None => 0,
    };
    let next = last + 1;
    tables
        .meta
        .put(wtxn, &key, &next.to_be_bytes())
        .map_err(txn_err)?;
    Ok(next)
}

fn seq_key(table: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + table.len());
    key.extend_from_slice(b"seq/");
    key.extend_from_slice(table.as_bytes());
    key
}

/// Big-endian row-id key; ascending iteration order is creation order.
pub(crate) fn id_key(id: RowId) -> [u8; 8] {
    id.to_be_bytes()
}

/// Disposal key: parent request id then row id, so one parent's rows are
/// contiguous under iteration.
pub(crate) fn disposal_key(request_id: RowId, row_id: RowId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&request_id.to_be_bytes());
    key[8..].copy_from_slice(&row_id.to_be_bytes());
    key
}

/// Key prefix selecting every disposal row of one parent request.
pub(crate) fn parent_prefix(request_id: RowId) -> [u8; 8] {
    request_id.to_be_bytes()
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Encoding {
        reason: e.to_string(),
    })
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Encoding {
        reason: e.to_string(),
    })
}

fn decode_i32(bytes: &[u8]) -> Result<i32, StoreError> {
    let arr: [u8; 4] = bytes.try_into().map_err(|_| StoreError::Encoding {
        reason: "schema version is not 4 bytes".to_string(),
    })?;
    Ok(i32::from_be_bytes(arr))
}

fn decode_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| StoreError::Encoding {
        reason: "sequence value is not 8 bytes".to_string(),
    })?;
    Ok(u64::from_be_bytes(arr))
}

pub(crate) fn txn_err(e: heed::Error) -> StoreError {
    StoreError::Transaction {
        reason: e.to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
