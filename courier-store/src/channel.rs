//! Channel registry and the state-change transitions.
//!
//! A channel event is a bulk side effect on the disposal ledger, not just a
//! registry update: Deactivate re-arms everything the link failed to carry,
//! Repair re-arms what the channel had rejected as malformed. The split
//! keeps a flapping link from ever re-sending a message the channel refused
//! at the message level.

use std::collections::HashSet;

use courier_core::{
    ChannelChange, ChannelRecord, ChannelState, CourierResult, DisposalRow, DisposalState,
    RequestKind, RowId, StoreError,
};
use heed::RoTxn;
use tracing::debug;

use crate::disposal;
use crate::schema::{self, Tables};
use crate::DistributorStore;

impl DistributorStore {
    /// Register a channel or set its administrative state.
    pub fn channel_upsert(&self, name: &str, state: ChannelState) -> CourierResult<()> {
        validate_channel(name)?;
        let mut wtxn = self.env().write_txn().map_err(schema::txn_err)?;
        let record = ChannelRecord {
            name: name.to_string(),
            state,
        };
        self.tables()
            .channel
            .put(&mut wtxn, name.as_bytes(), &schema::encode(&record)?)
            .map_err(schema::txn_err)?;
        wtxn.commit().map_err(schema::txn_err)?;
        Ok(())
    }

    pub fn channel_state(&self, name: &str) -> CourierResult<Option<ChannelState>> {
        let rtxn = self.env().read_txn().map_err(schema::txn_err)?;
        let record = self
            .tables()
            .channel
            .get(&rtxn, name.as_bytes())
            .map_err(schema::txn_err)?
            .map(schema::decode::<ChannelRecord>)
            .transpose()?;
        Ok(record.map(|r| r.state))
    }

    pub fn channels(&self) -> CourierResult<Vec<ChannelRecord>> {
        let rtxn = self.env().read_txn().map_err(schema::txn_err)?;
        let mut out = Vec::new();
        let iter = self.tables().channel.iter(&rtxn).map_err(schema::txn_err)?;
        for entry in iter {
            let (_, value) = entry.map_err(schema::txn_err)?;
            out.push(schema::decode::<ChannelRecord>(value)?);
        }
        Ok(out)
    }

    /// Apply a channel state-change event and its bulk rewrite of the
    /// disposal ledger. Returns the number of disposal rows re-armed.
    pub fn on_channel_change(&self, name: &str, change: ChannelChange) -> CourierResult<usize> {
        validate_channel(name)?;
        let mut wtxn = self.env().write_txn().map_err(schema::txn_err)?;

        if let Some(next) = change.next_channel_state() {
            let record = ChannelRecord {
                name: name.to_string(),
                state: next,
            };
            self.tables()
                .channel
                .put(&mut wtxn, name.as_bytes(), &schema::encode(&record)?)
                .map_err(schema::txn_err)?;
        }

        let mut touched = 0usize;
        let mut affected: HashSet<(RequestKind, RowId)> = HashSet::new();

        for kind in RequestKind::ALL {
            let db = self.tables().disposal_db(kind);
            let mut resets: Vec<(Vec<u8>, DisposalRow)> = Vec::new();
            {
                let iter = db.iter(&wtxn).map_err(schema::txn_err)?;
                for entry in iter {
                    let (key, value) = entry.map_err(schema::txn_err)?;
                    let row: DisposalRow = schema::decode(value)?;
                    if row.channel == name && change.disposal_reset_applies(row.state) {
                        resets.push((key.to_vec(), row));
                    }
                }
            }
            for (key, mut row) in resets {
                row.state = DisposalState::Pending;
                affected.insert((kind, row.request_id));
                db.put(&mut wtxn, &key, &schema::encode(&row)?)
                    .map_err(schema::txn_err)?;
                touched += 1;
            }
        }

        for (kind, request_id) in affected {
            disposal::recompute_disposition(self.tables(), &mut wtxn, kind, request_id)?;
        }

        wtxn.commit().map_err(schema::txn_err)?;
        debug!(channel = name, ?change, rows = touched, "channel transition applied");
        Ok(touched)
    }
}

/// Names of every channel currently Active.
pub(crate) fn active_channels(
    tables: &Tables,
    rtxn: &RoTxn,
) -> Result<HashSet<String>, StoreError> {
    let mut active = HashSet::new();
    let iter = tables.channel.iter(rtxn).map_err(schema::txn_err)?;
    for entry in iter {
        let (_, value) = entry.map_err(schema::txn_err)?;
        let record: ChannelRecord = schema::decode(value)?;
        if record.state == ChannelState::Active {
            active.insert(record.name);
        }
    }
    Ok(active)
}

fn validate_channel(name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::Argument {
            what: "channel",
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
