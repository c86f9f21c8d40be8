//! The per-(request, channel) delivery ledger.
//!
//! One row per request × channel. The pair is unique; the write path
//! enforces it on every upsert and treats an observed violation as an
//! integrity error to repair loudly, never a row to silently pick from.

use std::collections::HashSet;

use courier_core::{
    aggregate_disposition, DeliveryGoal, DisposalRow, DisposalState, DisposalTotalState,
    RequestKind, RoutePlan, RouteRequirement, RowId, StoreError,
};
use heed::{RoTxn, RwTxn};
use tracing::error;

use crate::schema::{self, Tables};

/// Update the row for `(request_id, channel)`, inserting it if absent.
pub(crate) fn upsert_one(
    tables: &Tables,
    wtxn: &mut RwTxn,
    kind: RequestKind,
    request_id: RowId,
    channel: &str,
    state: DisposalState,
) -> Result<RowId, StoreError> {
    let db = tables.disposal_db(kind);
    let prefix = schema::parent_prefix(request_id);

    let mut matches: Vec<(Vec<u8>, DisposalRow)> = Vec::new();
    {
        let iter = db.iter(wtxn).map_err(schema::txn_err)?;
        for entry in iter {
            let (key, value) = entry.map_err(schema::txn_err)?;
            if !key.starts_with(&prefix) {
                continue;
            }
            let row: DisposalRow = schema::decode(value)?;
            if row.channel == channel {
                matches.push((key.to_vec(), row));
            }
        }
    }

    if matches.len() > 1 {
        // Structurally impossible given the keyed uniqueness, but the pair
        // constraint is advisory at this layer: repair instead of crashing
        // the writer loop.
        error!(
            table = Tables::disposal_table_name(kind),
            request_id,
            channel,
            rows = matches.len(),
            "disposal uniqueness violated, keeping first row"
        );
        for (key, _) in matches.drain(1..) {
            db.delete(wtxn, &key).map_err(schema::txn_err)?;
        }
    }

    match matches.pop() {
        Some((key, mut row)) => {
            row.state = state;
            db.put(wtxn, &key, &schema::encode(&row)?)
                .map_err(schema::txn_err)?;
            Ok(row.id)
        }
        None => {
            let id = schema::next_row_id(tables, wtxn, Tables::disposal_table_name(kind))?;
            let row = DisposalRow {
                id,
                request_id,
                channel: channel.to_string(),
                kind,
                state,
            };
            db.put(wtxn, &schema::disposal_key(request_id, id), &schema::encode(&row)?)
                .map_err(schema::txn_err)?;
            Ok(id)
        }
    }
}

/// Seed or update every entry of a route plan for one request.
pub(crate) fn upsert_many(
    tables: &Tables,
    wtxn: &mut RwTxn,
    kind: RequestKind,
    request_id: RowId,
    route: &RoutePlan,
) -> Result<Vec<RowId>, StoreError> {
    let mut ids = Vec::with_capacity(route.len());
    for (channel, state) in route.iter() {
        ids.push(upsert_one(tables, wtxn, kind, request_id, channel, state)?);
    }
    Ok(ids)
}

/// All disposal rows of one request, in row-id order.
pub(crate) fn query_by_parent(
    tables: &Tables,
    rtxn: &RoTxn,
    kind: RequestKind,
    request_id: RowId,
) -> Result<Vec<DisposalRow>, StoreError> {
    let db = tables.disposal_db(kind);
    let prefix = schema::parent_prefix(request_id);

    let mut rows = Vec::new();
    let iter = db.iter(rtxn).map_err(schema::txn_err)?;
    for entry in iter {
        let (key, value) = entry.map_err(schema::txn_err)?;
        if key.starts_with(&prefix) {
            rows.push(schema::decode::<DisposalRow>(value)?);
        }
    }
    rows.sort_by_key(|r| r.id);
    Ok(rows)
}

/// Delete every disposal row of `kind` whose parent request no longer
/// exists. The emulated half of cascade delete; request deletion and the
/// garbage collector both finish with this sweep.
pub(crate) fn orphan_sweep(
    tables: &Tables,
    wtxn: &mut RwTxn,
    kind: RequestKind,
) -> Result<usize, StoreError> {
    let request_db = tables.request_db(kind);
    let mut live: HashSet<RowId> = HashSet::new();
    {
        let iter = request_db.iter(wtxn).map_err(schema::txn_err)?;
        for entry in iter {
            let (key, _) = entry.map_err(schema::txn_err)?;
            if let Ok(arr) = <[u8; 8]>::try_from(key) {
                live.insert(RowId::from_be_bytes(arr));
            }
        }
    }

    let db = tables.disposal_db(kind);
    let mut orphaned: Vec<Vec<u8>> = Vec::new();
    {
        let iter = db.iter(wtxn).map_err(schema::txn_err)?;
        for entry in iter {
            let (key, value) = entry.map_err(schema::txn_err)?;
            let row: DisposalRow = schema::decode(value)?;
            if !live.contains(&row.request_id) {
                orphaned.push(key.to_vec());
            }
        }
    }

    for key in &orphaned {
        db.delete(wtxn, key).map_err(schema::txn_err)?;
    }
    Ok(orphaned.len())
}

/// Recompute and cache the parent request's disposition from its disposal
/// rows. An externally imposed Expired/Failed cache is left alone.
pub(crate) fn recompute_disposition(
    tables: &Tables,
    wtxn: &mut RwTxn,
    kind: RequestKind,
    request_id: RowId,
) -> Result<Option<DisposalTotalState>, StoreError> {
    let request_db = tables.request_db(kind);
    let key = schema::id_key(request_id);

    let mut value: serde_json::Value = match request_db.get(wtxn, &key).map_err(schema::txn_err)? {
        Some(bytes) => schema::decode(bytes)?,
        // Parent already gone; nothing to cache.
        None => return Ok(None),
    };

    let current = total_state_field(&value, "disposition")?;
    if current.is_imposed() {
        return Ok(Some(current));
    }

    let goal = DeliveryGoal::from_code(int_field(&value, "goal")?).map_err(code_err)?;
    let requirement =
        RouteRequirement::from_code(int_field(&value, "requirement")?).map_err(code_err)?;

    let states: Vec<DisposalState> = query_by_parent(tables, wtxn, kind, request_id)?
        .into_iter()
        .map(|r| r.state)
        .collect();
    let total = aggregate_disposition(&states, goal, requirement);

    if total != current {
        value["disposition"] = serde_json::Value::from(total.as_code());
        request_db
            .put(wtxn, &key, &schema::encode(&value)?)
            .map_err(schema::txn_err)?;
    }
    Ok(Some(total))
}

fn total_state_field(
    value: &serde_json::Value,
    field: &str,
) -> Result<DisposalTotalState, StoreError> {
    DisposalTotalState::from_code(int_field(value, field)?).map_err(code_err)
}

fn int_field(value: &serde_json::Value, field: &str) -> Result<i32, StoreError> {
    value
        .get(field)
        .and_then(serde_json::Value::as_i64)
        .map(|v| v as i32)
        .ok_or_else(|| StoreError::Encoding {
            reason: format!("request row missing integer field {}", field),
        })
}

fn code_err(e: courier_core::EnumCodeError) -> StoreError {
    StoreError::Encoding {
        reason: e.to_string(),
    }
}
