//! The expiration sweep.
//!
//! Garbage collection is best-effort: a storage failure in one sweep is
//! logged and reported as zero rather than propagated, so a broken sweep can
//! never block the request path.

use chrono::{Duration, Utc};
use courier_core::{CapabilityRecord, CourierResult, RequestKind, StoreError, Timestamp};
use tracing::{debug, warn};

use crate::disposal;
use crate::schema::{self, Tables};
use crate::DistributorStore;

/// Per-table outcome of one garbage-collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcSweep {
    pub postal: usize,
    pub retrieval: usize,
    pub interest: usize,
    pub capability: usize,
}

impl GcSweep {
    pub fn total(&self) -> usize {
        self.postal + self.retrieval + self.interest + self.capability
    }
}

impl DistributorStore {
    /// Delete every request whose expiration fell more than its kind's grace
    /// period ago, sweep the disposal rows that deletion orphaned, and expire
    /// stale capability announcements.
    pub fn delete_garbage(&self) -> GcSweep {
        self.delete_garbage_at(Utc::now())
    }

    /// Sweep against an explicit clock. Exists so the expiration boundary is
    /// testable to the second.
    pub fn delete_garbage_at(&self, now: Timestamp) -> GcSweep {
        let mut sweep = GcSweep::default();
        for kind in RequestKind::ALL {
            match self.sweep_requests(kind, now) {
                Ok(count) => match kind {
                    RequestKind::Postal => sweep.postal = count,
                    RequestKind::Retrieval => sweep.retrieval = count,
                    RequestKind::Interest => sweep.interest = count,
                },
                Err(e) => {
                    warn!(kind = %kind, error = %e, "garbage sweep failed");
                }
            }
        }
        match self.sweep_capabilities(now) {
            Ok(count) => sweep.capability = count,
            Err(e) => {
                warn!(error = %e, "capability sweep failed");
            }
        }
        debug!(
            postal = sweep.postal,
            retrieval = sweep.retrieval,
            interest = sweep.interest,
            capability = sweep.capability,
            "garbage collected"
        );
        sweep
    }

    fn sweep_requests(&self, kind: RequestKind, now: Timestamp) -> CourierResult<usize> {
        let deadline = now - Duration::seconds(self.config().delay_secs(kind));

        let mut wtxn = self.env().write_txn().map_err(schema::txn_err)?;
        let db = self.tables().request_db(kind);

        // Expiration lives in the flattened common fields; reading it
        // through Value keeps this sweep kind-agnostic.
        let mut doomed: Vec<Vec<u8>> = Vec::new();
        {
            let iter = db.iter(&wtxn).map_err(schema::txn_err)?;
            for entry in iter {
                let (key, value) = entry.map_err(schema::txn_err)?;
                let row: serde_json::Value = schema::decode(value)?;
                let expiration = row
                    .get("expiration")
                    .and_then(serde_json::Value::as_i64)
                    .ok_or_else(|| StoreError::Encoding {
                        reason: format!(
                            "{} row missing expiration",
                            Tables::request_table_name(kind)
                        ),
                    })?;
                if expiration < deadline.timestamp_millis() {
                    doomed.push(key.to_vec());
                }
            }
        }

        for key in &doomed {
            db.delete(&mut wtxn, key).map_err(schema::txn_err)?;
        }
        disposal::orphan_sweep(self.tables(), &mut wtxn, kind)?;

        wtxn.commit().map_err(schema::txn_err)?;
        Ok(doomed.len())
    }

    fn sweep_capabilities(&self, now: Timestamp) -> CourierResult<usize> {
        let mut wtxn = self.env().write_txn().map_err(schema::txn_err)?;
        let db = self.tables().capability;

        let mut doomed: Vec<Vec<u8>> = Vec::new();
        {
            let iter = db.iter(&wtxn).map_err(schema::txn_err)?;
            for entry in iter {
                let (key, value) = entry.map_err(schema::txn_err)?;
                let record: CapabilityRecord = schema::decode(value)?;
                if record.expiration < now {
                    doomed.push(key.to_vec());
                }
            }
        }

        for key in &doomed {
            db.delete(&mut wtxn, key).map_err(schema::txn_err)?;
        }
        wtxn.commit().map_err(schema::txn_err)?;
        Ok(doomed.len())
    }
}
