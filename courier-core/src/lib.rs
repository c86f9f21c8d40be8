//! COURIER Core - Request, Disposal, and Channel Types
//!
//! Pure data structures for the distribution engine: typed request records,
//! the per-channel disposal vocabulary, route plans, and the error taxonomy.
//! The durable store lives in courier-store; this crate has no I/O.

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod enums;
pub mod error;
pub mod records;
pub mod route;

pub use enums::{
    ChannelChange, ChannelState, ContinuityType, DisposalState, DisposalTotalState, EnumCodeError,
    RequestKind, SerialMoment,
};
pub use error::{CourierError, CourierResult, PolicyError, StoreError};
pub use records::{
    CapabilityRecord, ChannelRecord, DisposalRow, InterestRecord, NoticeFlags, PostalRecord,
    PresenceRecord, Requestable, RequestRecord, RetrievalRecord,
};
pub use route::{
    aggregate_disposition, DeliveryGoal, DistributionPolicy, PolicyMatcher, RoutePlan,
    RouteRequirement, StaticPolicyMatcher,
};

/// Store-assigned row identifier, stable for a tuple's lifetime.
pub type RowId = u64;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a caller-side external request identifier (UUIDv7, so external
/// ids are naturally sortable by creation time).
pub fn new_request_uuid() -> Uuid {
    Uuid::now_v7()
}
