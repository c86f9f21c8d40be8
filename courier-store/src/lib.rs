//! COURIER Store - Durable Request/Disposal Persistence
//!
//! The distribution engine's durable heart: typed request tables, the
//! per-channel disposal ledger, the channel registry with its bulk-retry
//! transitions, the expiration sweep, and the presence/capability ledgers.
//!
//! Backed by LMDB (heed). Every multi-statement operation runs inside one
//! write transaction, which both serializes writers (the coarse lock the
//! design calls for) and makes each operation crash-atomic. The intended
//! shape is a single writer thread driving all mutations while any number
//! of reader threads poll the query surface.

mod channel;
mod disposal;
pub mod gc;
mod ledger;
pub mod request;
mod schema;

pub use gc::GcSweep;
pub use request::{ReadyRequest, RequestFields};
pub use schema::SCHEMA_VERSION;

// Re-export the vocabulary callers need alongside the store.
pub use courier_core::{
    aggregate_disposition, CapabilityRecord, ChannelChange, ChannelRecord, ChannelState,
    ContinuityType, CourierError, CourierResult, DeliveryGoal, DisposalRow, DisposalState,
    DisposalTotalState, DistributionPolicy, InterestRecord, NoticeFlags, PolicyMatcher,
    PostalRecord, PresenceRecord, RequestKind, RequestRecord, RetrievalRecord, RoutePlan,
    RouteRequirement, RowId, SerialMoment, StaticPolicyMatcher, StoreError, Timestamp,
};

use std::path::Path;

use heed::Env;

use crate::schema::Tables;

/// Tunables for the durable store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum size of the memory-mapped store file, in megabytes.
    pub map_size_mb: usize,
    /// Grace period after expiration before a postal request is garbage.
    pub postal_delay_secs: i64,
    /// Grace period for retrieval requests.
    pub retrieval_delay_secs: i64,
    /// Grace period for interest requests; local subscriptions are
    /// long-lived by nature.
    pub interest_delay_secs: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            map_size_mb: 64,
            postal_delay_secs: 8 * 3600,
            retrieval_delay_secs: 8 * 3600,
            interest_delay_secs: 365 * 24 * 3600,
        }
    }
}

impl StoreConfig {
    pub(crate) fn delay_secs(&self, kind: RequestKind) -> i64 {
        match kind {
            RequestKind::Postal => self.postal_delay_secs,
            RequestKind::Retrieval => self.retrieval_delay_secs,
            RequestKind::Interest => self.interest_delay_secs,
        }
    }
}

/// Row counts per table, for status display and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub postal: u64,
    pub retrieval: u64,
    pub interest: u64,
    pub disposals: u64,
    pub channels: u64,
    pub presence: u64,
    pub capability: u64,
}

/// The durable request/disposal store.
///
/// Cloning is cheap-ish but unnecessary: the type is `Send + Sync` and is
/// meant to be shared behind an `Arc`, with exactly one thread issuing
/// mutations. Mutating operations must not be called re-entrantly from a
/// callback; there are none by design.
pub struct DistributorStore {
    env: Env,
    tables: Tables,
    config: StoreConfig,
}

impl DistributorStore {
    /// Open (or create) the store at `path` with default tunables.
    pub fn open<P: AsRef<Path>>(path: P) -> CourierResult<Self> {
        Self::open_with(path, StoreConfig::default())
    }

    /// Open (or create) the store at `path`.
    ///
    /// An unreadable store file is archived as `corrupted.mdb` and replaced
    /// with an empty store; a schema-version mismatch wipes all tables.
    pub fn open_with<P: AsRef<Path>>(path: P, config: StoreConfig) -> CourierResult<Self> {
        let (env, tables) = schema::open_store(path.as_ref(), config.map_size_mb)?;
        Ok(Self {
            env,
            tables,
            config,
        })
    }

    pub(crate) fn env(&self) -> &Env {
        &self.env
    }

    pub(crate) fn tables(&self) -> &Tables {
        &self.tables
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Row counts for every table.
    pub fn stats(&self) -> CourierResult<StoreStats> {
        let rtxn = self.env.read_txn().map_err(schema::txn_err)?;
        let count = |db: heed::Database<heed::types::Bytes, heed::types::Bytes>| {
            db.len(&rtxn).map_err(schema::txn_err)
        };
        Ok(StoreStats {
            postal: count(self.tables.postal)?,
            retrieval: count(self.tables.retrieval)?,
            interest: count(self.tables.interest)?,
            disposals: count(self.tables.postal_disposal)?
                + count(self.tables.retrieval_disposal)?
                + count(self.tables.interest_disposal)?,
            channels: count(self.tables.channel)?,
            presence: count(self.tables.presence)?,
            capability: count(self.tables.capability)?,
        })
    }

    /// Wipe every table. Test and recovery aid; sequences and the schema
    /// stamp survive.
    pub fn clear(&self) -> CourierResult<()> {
        let mut wtxn = self.env.write_txn().map_err(schema::txn_err)?;
        for db in [
            self.tables.postal,
            self.tables.retrieval,
            self.tables.interest,
            self.tables.postal_disposal,
            self.tables.retrieval_disposal,
            self.tables.interest_disposal,
            self.tables.channel,
            self.tables.presence,
            self.tables.capability,
        ] {
            db.clear(&mut wtxn).map_err(schema::txn_err)?;
        }
        wtxn.commit().map_err(schema::txn_err)?;
        Ok(())
    }
}
