//! Record structures for the COURIER request tables.
//!
//! Timestamps are persisted as millisecond integers and the state enums as
//! their frozen codes, so stored rows stay readable across builds.

use crate::{
    ContinuityType, DeliveryGoal, DisposalState, DisposalTotalState, ChannelState, RequestKind,
    RouteRequirement, RowId, SerialMoment, Timestamp,
};
use bitflags::bitflags;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

bitflags! {
    /// Delivery-milestone thresholds the caller wants notified about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NoticeFlags: u32 {
        /// Bytes left this node
        const SENT      = 0b00001;
        /// Taken by the terminal destination
        const DELIVERED = 0b00010;
        /// Receipt confirmed by the destination application
        const RECEIVED  = 0b00100;
        /// Entered a gateway
        const GATE_IN   = 0b01000;
        /// Left a gateway
        const GATE_OUT  = 0b10000;
    }
}

impl Default for NoticeFlags {
    fn default() -> Self {
        Self::empty()
    }
}

// Manual serde implementation (bitflags 2.x + serde): persist the raw bits
// so the mask reads the same from any build.
impl Serialize for NoticeFlags {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NoticeFlags {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Self::from_bits(bits).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid NoticeFlags bits: {:#07x}", bits))
        })
    }
}

/// Fields common to every request table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Store-assigned row id, stable for the tuple's lifetime.
    pub id: RowId,
    /// Caller-assigned external identifier.
    pub uuid: Uuid,
    /// Application-specific correlation id.
    pub auid: Option<String>,
    pub topic: String,
    pub subtopic: String,
    /// Opaque locator for the payload source or sink.
    pub provider: String,
    /// Cached aggregate of this request's disposal rows.
    pub disposition: DisposalTotalState,
    /// Higher is more urgent; policy base priority plus the caller delta.
    pub priority: i32,
    pub moment: SerialMoment,
    /// Which terminal state counts as the goal for this request's channels.
    pub goal: DeliveryGoal,
    /// How goal attainment folds across the route set.
    pub requirement: RouteRequirement,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expiration: Timestamp,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created: Timestamp,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub modified: Timestamp,
    /// Modification counter, advanced on every upsert of the same tuple.
    pub count: i32,
    pub notice: NoticeFlags,
}

impl RequestRecord {
    /// Create a fresh common record. The row id is assigned by the store.
    pub fn new(uuid: Uuid, topic: &str, subtopic: &str, provider: &str, expiration: Timestamp) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            uuid,
            auid: None,
            topic: topic.to_string(),
            subtopic: subtopic.to_string(),
            provider: provider.to_string(),
            disposition: DisposalTotalState::New,
            priority: 0,
            moment: SerialMoment::Apriori,
            goal: DeliveryGoal::Queued,
            requirement: RouteRequirement::All,
            expiration,
            created: now,
            modified: now,
            count: 0,
            notice: NoticeFlags::empty(),
        }
    }

    pub fn with_auid(mut self, auid: &str) -> Self {
        self.auid = Some(auid.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_moment(mut self, moment: SerialMoment) -> Self {
        self.moment = moment;
        self
    }

    pub fn with_goal(mut self, goal: DeliveryGoal, requirement: RouteRequirement) -> Self {
        self.goal = goal;
        self.requirement = requirement;
        self
    }

    pub fn with_notice(mut self, notice: NoticeFlags) -> Self {
        self.notice = notice;
        self
    }

    /// Natural key used for lookup when no uuid match exists.
    pub fn natural_key(&self) -> (&str, &str, &str) {
        (&self.topic, &self.subtopic, &self.provider)
    }

    /// Take over a stored row's identity and bookkeeping when this record
    /// re-upserts the same tuple: the row id and creation stamp survive, the
    /// modification counter advances, and the incoming fields win.
    pub fn inherit(&mut self, stored: &RequestRecord) {
        self.id = stored.id;
        self.created = stored.created;
        self.count = stored.count + 1;
        self.modified = Utc::now();
    }
}

/// A publish request: push a captured payload outward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostalRecord {
    #[serde(flatten)]
    pub request: RequestRecord,
    pub payload: Vec<u8>,
}

impl PostalRecord {
    pub fn new(request: RequestRecord, payload: Vec<u8>) -> Self {
        Self { request, payload }
    }
}

/// A pull request: fetch data matching a selection from a remote source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalRecord {
    #[serde(flatten)]
    pub request: RequestRecord,
    pub projection: Option<String>,
    pub selection: Option<String>,
    pub args: Option<String>,
    pub ordering: Option<String>,
    pub limit: Option<i32>,
    pub continuity: ContinuityType,
    pub continuity_value: i32,
}

impl RetrievalRecord {
    pub fn new(request: RequestRecord) -> Self {
        Self {
            request,
            projection: None,
            selection: None,
            args: None,
            ordering: None,
            limit: None,
            continuity: ContinuityType::Once,
            continuity_value: 0,
        }
    }

    pub fn with_selection(mut self, selection: &str) -> Self {
        self.selection = Some(selection.to_string());
        self
    }

    pub fn with_projection(mut self, projection: &str) -> Self {
        self.projection = Some(projection.to_string());
        self
    }

    pub fn with_limit(mut self, limit: i32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_continuity(mut self, continuity: ContinuityType, value: i32) -> Self {
        self.continuity = continuity;
        self.continuity_value = value;
        self
    }
}

/// A local subscription request for future matching data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterestRecord {
    #[serde(flatten)]
    pub request: RequestRecord,
    pub filter: Option<String>,
}

impl InterestRecord {
    pub fn new(request: RequestRecord) -> Self {
        Self { request, filter: None }
    }

    pub fn with_filter(mut self, filter: &str) -> Self {
        self.filter = Some(filter.to_string());
        self
    }
}

/// Typed access to the common request fields, used by the store to share one
/// implementation across the three request tables.
pub trait Requestable: Clone + Serialize + DeserializeOwned {
    const KIND: RequestKind;

    fn request(&self) -> &RequestRecord;
    fn request_mut(&mut self) -> &mut RequestRecord;
}

impl Requestable for PostalRecord {
    const KIND: RequestKind = RequestKind::Postal;

    fn request(&self) -> &RequestRecord {
        &self.request
    }

    fn request_mut(&mut self) -> &mut RequestRecord {
        &mut self.request
    }
}

impl Requestable for RetrievalRecord {
    const KIND: RequestKind = RequestKind::Retrieval;

    fn request(&self) -> &RequestRecord {
        &self.request
    }

    fn request_mut(&mut self) -> &mut RequestRecord {
        &mut self.request
    }
}

impl Requestable for InterestRecord {
    const KIND: RequestKind = RequestKind::Interest;

    fn request(&self) -> &RequestRecord {
        &self.request
    }

    fn request_mut(&mut self) -> &mut RequestRecord {
        &mut self.request
    }
}

/// One delivery-attempt ledger row: a request crossed with a channel.
///
/// `(request_id, channel)` is unique within a kind's disposal table. The
/// store enforces this on every write and treats an observed violation as an
/// integrity error, not a row to silently pick from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisposalRow {
    pub id: RowId,
    pub request_id: RowId,
    pub channel: String,
    /// Copy of the owning table kind, kept for fast filtering.
    pub kind: RequestKind,
    pub state: DisposalState,
}

/// A known communication channel and its administrative state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub name: String,
    pub state: ChannelState,
}

/// Last-seen bookkeeping for an observed peer device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub device: String,
    pub operator: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub first: Timestamp,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub latest: Timestamp,
    /// Observation counter.
    pub count: i32,
    pub enable: bool,
    pub channel: Option<String>,
    pub address: Option<String>,
}

/// A remote subscription announcement. Mirrors the request identity fields
/// but is never disposal-tracked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub uuid: Uuid,
    pub auid: Option<String>,
    pub topic: String,
    pub subtopic: String,
    pub provider: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub expiration: Timestamp,
    /// Device the announcement originated from.
    pub origin: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub first: Timestamp,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub latest: Timestamp,
    pub count: i32,
}

impl CapabilityRecord {
    pub fn new(
        uuid: Uuid,
        topic: &str,
        subtopic: &str,
        provider: &str,
        origin: &str,
        expiration: Timestamp,
    ) -> Self {
        let now = Utc::now();
        Self {
            uuid,
            auid: None,
            topic: topic.to_string(),
            subtopic: subtopic.to_string(),
            provider: provider.to_string(),
            expiration,
            origin: origin.to_string(),
            first: now,
            latest: now,
            count: 0,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
