//! The request tables: upsert, partial update, keyed queries, the readiness
//! view, and natural-key deletion with its cascade sweep.
//!
//! Postal, Retrieval, and Interest share one implementation through
//! [`Requestable`]; the public surface exposes one method set per table.

use std::collections::HashSet;

use chrono::Utc;
use courier_core::{
    CourierResult, DisposalState, DisposalTotalState, InterestRecord, NoticeFlags, PostalRecord,
    Requestable, RequestKind, RequestRecord, RetrievalRecord, RoutePlan, RowId, StoreError,
    Timestamp,
};
use heed::RoTxn;
use uuid::Uuid;

use crate::channel::active_channels;
use crate::disposal;
use crate::schema::{self, Tables};
use crate::DistributorStore;

/// Partial update for a stored request; `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct RequestFields {
    pub auid: Option<String>,
    pub provider: Option<String>,
    pub priority: Option<i32>,
    pub expiration: Option<Timestamp>,
    pub notice: Option<NoticeFlags>,
}

impl RequestFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_expiration(mut self, expiration: Timestamp) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_notice(mut self, notice: NoticeFlags) -> Self {
        self.notice = Some(notice);
        self
    }

    fn apply(&self, request: &mut RequestRecord) {
        if let Some(ref auid) = self.auid {
            request.auid = Some(auid.clone());
        }
        if let Some(ref provider) = self.provider {
            request.provider = provider.clone();
        }
        if let Some(priority) = self.priority {
            request.priority = priority;
        }
        if let Some(expiration) = self.expiration {
            request.expiration = expiration;
        }
        if let Some(notice) = self.notice {
            request.notice = notice;
        }
    }
}

/// One entry of the merged readiness view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyRequest {
    pub kind: RequestKind,
    pub id: RowId,
    pub uuid: Uuid,
    pub topic: String,
    pub subtopic: String,
    pub priority: i32,
}

impl DistributorStore {
    // === Postal ===

    pub fn postal_upsert(&self, record: PostalRecord, route: &RoutePlan) -> CourierResult<RowId> {
        self.upsert_request(record, route)
    }

    pub fn postal_update_by_id(
        &self,
        id: RowId,
        fields: RequestFields,
        state: Option<DisposalTotalState>,
    ) -> CourierResult<usize> {
        self.update_request_by_id::<PostalRecord>(id, fields, state)
    }

    pub fn postal_by_uuid(&self, uuid: Uuid) -> CourierResult<Option<PostalRecord>> {
        self.request_by_uuid(uuid)
    }

    pub fn postal_query_by_topic(
        &self,
        topic: &str,
        subtopic: &str,
    ) -> CourierResult<Vec<PostalRecord>> {
        self.requests_by_topic(topic, subtopic)
    }

    pub fn postal_ready(&self) -> CourierResult<Vec<PostalRecord>> {
        self.ready_requests()
    }

    pub fn postal_delete_by_topic(
        &self,
        topic: &str,
        subtopic: &str,
        provider: Option<&str>,
    ) -> CourierResult<usize> {
        self.delete_requests_by_topic::<PostalRecord>(topic, subtopic, provider)
    }

    // === Retrieval ===

    pub fn retrieval_upsert(
        &self,
        record: RetrievalRecord,
        route: &RoutePlan,
    ) -> CourierResult<RowId> {
        self.upsert_request(record, route)
    }

    pub fn retrieval_update_by_id(
        &self,
        id: RowId,
        fields: RequestFields,
        state: Option<DisposalTotalState>,
    ) -> CourierResult<usize> {
        self.update_request_by_id::<RetrievalRecord>(id, fields, state)
    }

    pub fn retrieval_by_uuid(&self, uuid: Uuid) -> CourierResult<Option<RetrievalRecord>> {
        self.request_by_uuid(uuid)
    }

    pub fn retrieval_query_by_topic(
        &self,
        topic: &str,
        subtopic: &str,
    ) -> CourierResult<Vec<RetrievalRecord>> {
        self.requests_by_topic(topic, subtopic)
    }

    pub fn retrieval_ready(&self) -> CourierResult<Vec<RetrievalRecord>> {
        self.ready_requests()
    }

    pub fn retrieval_delete_by_topic(
        &self,
        topic: &str,
        subtopic: &str,
        provider: Option<&str>,
    ) -> CourierResult<usize> {
        self.delete_requests_by_topic::<RetrievalRecord>(topic, subtopic, provider)
    }

    // === Interest ===

    pub fn interest_upsert(
        &self,
        record: InterestRecord,
        route: &RoutePlan,
    ) -> CourierResult<RowId> {
        self.upsert_request(record, route)
    }

    pub fn interest_update_by_id(
        &self,
        id: RowId,
        fields: RequestFields,
        state: Option<DisposalTotalState>,
    ) -> CourierResult<usize> {
        self.update_request_by_id::<InterestRecord>(id, fields, state)
    }

    pub fn interest_by_uuid(&self, uuid: Uuid) -> CourierResult<Option<InterestRecord>> {
        self.request_by_uuid(uuid)
    }

    pub fn interest_query_by_topic(
        &self,
        topic: &str,
        subtopic: &str,
    ) -> CourierResult<Vec<InterestRecord>> {
        self.requests_by_topic(topic, subtopic)
    }

    pub fn interest_ready(&self) -> CourierResult<Vec<InterestRecord>> {
        self.ready_requests()
    }

    pub fn interest_delete_by_topic(
        &self,
        topic: &str,
        subtopic: &str,
        provider: Option<&str>,
    ) -> CourierResult<usize> {
        self.delete_requests_by_topic::<InterestRecord>(topic, subtopic, provider)
    }

    // === Disposal surface ===

    /// Record one channel outcome for a request and refresh its cached
    /// disposition.
    pub fn disposal_upsert(
        &self,
        kind: RequestKind,
        request_id: RowId,
        channel: &str,
        state: DisposalState,
    ) -> CourierResult<RowId> {
        validate_name("channel", channel)?;
        let mut wtxn = self.env().write_txn().map_err(schema::txn_err)?;
        let id = disposal::upsert_one(self.tables(), &mut wtxn, kind, request_id, channel, state)?;
        disposal::recompute_disposition(self.tables(), &mut wtxn, kind, request_id)?;
        wtxn.commit().map_err(schema::txn_err)?;
        Ok(id)
    }

    /// All disposal rows of one request, in row-id order.
    pub fn disposals_by_request(
        &self,
        kind: RequestKind,
        request_id: RowId,
    ) -> CourierResult<Vec<courier_core::DisposalRow>> {
        let rtxn = self.env().read_txn().map_err(schema::txn_err)?;
        Ok(disposal::query_by_parent(self.tables(), &rtxn, kind, request_id)?)
    }

    // === Merged readiness view ===

    /// Every request with at least one Pending disposal row on an Active
    /// channel, across all three tables, ordered by priority descending and
    /// row id ascending within a band.
    pub fn query_ready(&self) -> CourierResult<Vec<ReadyRequest>> {
        let mut out: Vec<ReadyRequest> = Vec::new();
        for record in self.postal_ready()? {
            out.push(summarize(RequestKind::Postal, record.request()));
        }
        for record in self.retrieval_ready()? {
            out.push(summarize(RequestKind::Retrieval, record.request()));
        }
        for record in self.interest_ready()? {
            out.push(summarize(RequestKind::Interest, record.request()));
        }
        out.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.id.cmp(&b.id))
                .then(a.kind.as_code().cmp(&b.kind.as_code()))
        });
        Ok(out)
    }

    // === Shared implementation ===

    fn upsert_request<R: Requestable>(
        &self,
        mut record: R,
        route: &RoutePlan,
    ) -> CourierResult<RowId> {
        validate_name("topic", &record.request().topic)?;
        validate_name("provider", &record.request().provider)?;

        let mut wtxn = self.env().write_txn().map_err(schema::txn_err)?;
        let db = self.tables().request_db(R::KIND);

        let uuid = record.request().uuid;
        let stored: Option<R> = {
            let by_uuid = scan_one(db, &wtxn, |r: &R| r.request().uuid == uuid)?;
            match by_uuid {
                Some(found) => Some(found),
                None => {
                    let key = (
                        record.request().topic.clone(),
                        record.request().subtopic.clone(),
                        record.request().provider.clone(),
                    );
                    scan_one(db, &wtxn, |r: &R| {
                        let req = r.request();
                        req.topic == key.0 && req.subtopic == key.1 && req.provider == key.2
                    })?
                }
            }
        };

        let id = match stored {
            Some(found) => {
                record.request_mut().inherit(found.request());
                found.request().id
            }
            None => {
                let id = schema::next_row_id(
                    self.tables(),
                    &mut wtxn,
                    Tables::request_table_name(R::KIND),
                )?;
                record.request_mut().id = id;
                id
            }
        };

        db.put(&mut wtxn, &schema::id_key(id), &schema::encode(&record)?)
            .map_err(schema::txn_err)?;

        disposal::upsert_many(self.tables(), &mut wtxn, R::KIND, id, route)?;
        disposal::recompute_disposition(self.tables(), &mut wtxn, R::KIND, id)?;

        wtxn.commit().map_err(schema::txn_err)?;
        Ok(id)
    }

    fn update_request_by_id<R: Requestable>(
        &self,
        id: RowId,
        fields: RequestFields,
        state: Option<DisposalTotalState>,
    ) -> CourierResult<usize> {
        let mut wtxn = self.env().write_txn().map_err(schema::txn_err)?;
        let db = self.tables().request_db(R::KIND);
        let key = schema::id_key(id);

        let mut record: R = match db.get(&wtxn, &key).map_err(schema::txn_err)? {
            Some(bytes) => schema::decode(bytes)?,
            None => return Ok(0),
        };

        let request = record.request_mut();
        fields.apply(request);
        if let Some(state) = state {
            request.disposition = request.disposition.fold(state);
        }
        request.modified = Utc::now();
        request.count += 1;

        db.put(&mut wtxn, &key, &schema::encode(&record)?)
            .map_err(schema::txn_err)?;
        wtxn.commit().map_err(schema::txn_err)?;
        Ok(1)
    }

    fn request_by_uuid<R: Requestable>(&self, uuid: Uuid) -> CourierResult<Option<R>> {
        let rtxn = self.env().read_txn().map_err(schema::txn_err)?;
        let db = self.tables().request_db(R::KIND);
        Ok(scan_one(db, &rtxn, |r: &R| r.request().uuid == uuid)?)
    }

    fn requests_by_topic<R: Requestable>(
        &self,
        topic: &str,
        subtopic: &str,
    ) -> CourierResult<Vec<R>> {
        validate_name("topic", topic)?;
        let rtxn = self.env().read_txn().map_err(schema::txn_err)?;
        let db = self.tables().request_db(R::KIND);
        let mut records = scan_all(db, &rtxn, |r: &R| {
            let req = r.request();
            req.topic == topic && req.subtopic == subtopic
        })?;
        records.sort_by_key(|r| r.request().id);
        Ok(records)
    }

    fn ready_requests<R: Requestable>(&self) -> CourierResult<Vec<R>> {
        let rtxn = self.env().read_txn().map_err(schema::txn_err)?;
        let active = active_channels(self.tables(), &rtxn)?;

        let disposal_db = self.tables().disposal_db(R::KIND);
        let mut ready_ids: HashSet<RowId> = HashSet::new();
        let iter = disposal_db.iter(&rtxn).map_err(schema::txn_err)?;
        for entry in iter {
            let (_, value) = entry.map_err(schema::txn_err)?;
            let row: courier_core::DisposalRow = schema::decode(value)?;
            if row.state.is_actionable() && active.contains(&row.channel) {
                ready_ids.insert(row.request_id);
            }
        }

        let db = self.tables().request_db(R::KIND);
        let mut records = scan_all(db, &rtxn, |r: &R| ready_ids.contains(&r.request().id))?;
        records.sort_by(|a, b| {
            b.request()
                .priority
                .cmp(&a.request().priority)
                .then(a.request().id.cmp(&b.request().id))
        });
        Ok(records)
    }

    fn delete_requests_by_topic<R: Requestable>(
        &self,
        topic: &str,
        subtopic: &str,
        provider: Option<&str>,
    ) -> CourierResult<usize> {
        validate_name("topic", topic)?;

        let mut wtxn = self.env().write_txn().map_err(schema::txn_err)?;
        let db = self.tables().request_db(R::KIND);

        let doomed = scan_all(db, &wtxn, |r: &R| {
            let req = r.request();
            req.topic == topic
                && req.subtopic == subtopic
                && provider.map_or(true, |p| req.provider == p)
        })?;

        for record in &doomed {
            db.delete(&mut wtxn, &schema::id_key(record.request().id))
                .map_err(schema::txn_err)?;
        }
        // Cascade is emulated: drop the rows, then sweep what they orphaned.
        disposal::orphan_sweep(self.tables(), &mut wtxn, R::KIND)?;

        wtxn.commit().map_err(schema::txn_err)?;
        Ok(doomed.len())
    }
}

fn summarize(kind: RequestKind, request: &RequestRecord) -> ReadyRequest {
    ReadyRequest {
        kind,
        id: request.id,
        uuid: request.uuid,
        topic: request.topic.clone(),
        subtopic: request.subtopic.clone(),
        priority: request.priority,
    }
}

fn validate_name(what: &'static str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::Argument {
            what,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

fn scan_one<R, F>(
    db: heed::Database<heed::types::Bytes, heed::types::Bytes>,
    rtxn: &RoTxn,
    pred: F,
) -> Result<Option<R>, StoreError>
where
    R: Requestable,
    F: Fn(&R) -> bool,
{
    let iter = db.iter(rtxn).map_err(schema::txn_err)?;
    for entry in iter {
        let (_, value) = entry.map_err(schema::txn_err)?;
        let record: R = schema::decode(value)?;
        if pred(&record) {
            return Ok(Some(record));
        }
    }
    Ok(None)
}

fn scan_all<R, F>(
    db: heed::Database<heed::types::Bytes, heed::types::Bytes>,
    rtxn: &RoTxn,
    pred: F,
) -> Result<Vec<R>, StoreError>
where
    R: Requestable,
    F: Fn(&R) -> bool,
{
    let mut out = Vec::new();
    let iter = db.iter(rtxn).map_err(schema::txn_err)?;
    for entry in iter {
        let (_, value) = entry.map_err(schema::txn_err)?;
        let record: R = schema::decode(value)?;
        if pred(&record) {
            out.push(record);
        }
    }
    Ok(out)
}
