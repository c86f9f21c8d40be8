//! Enum types for COURIER requests and channels.
//!
//! The integer codes on the persisted enums are a wire format: store files
//! written by older builds must stay readable, so codes are frozen and new
//! variants may only be appended with fresh codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// PER-CHANNEL DELIVERY STATE
// ============================================================================

/// Delivery state of a single request on a single channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "i32", try_from = "i32")]
pub enum DisposalState {
    /// Row exists but nothing has been decided for this channel yet
    #[default]
    New = 0,
    /// Channel refused the request at hand-off
    Rejected = 1,
    /// Waiting for the channel to become usable
    Pending = 2,
    /// Accepted into the channel's outbound queue
    Queued = 3,
    /// Bytes left this node on the channel
    Sent = 4,
    /// Far gateway acknowledged custody
    Told = 5,
    /// Delivered to the terminal destination
    Delivered = 6,
    /// Channel temporarily saturated, retry later
    Busy = 7,
    /// Receipt confirmed by the destination application
    Received = 8,
    /// Channel rejected the message itself as malformed; only a repair
    /// event makes this channel worth retrying
    Bad = 9,
}

impl DisposalState {
    /// Persisted integer code.
    pub fn as_code(&self) -> i32 {
        *self as i32
    }

    /// Parse from a persisted integer code.
    pub fn from_code(code: i32) -> Result<Self, EnumCodeError> {
        match code {
            0 => Ok(DisposalState::New),
            1 => Ok(DisposalState::Rejected),
            2 => Ok(DisposalState::Pending),
            3 => Ok(DisposalState::Queued),
            4 => Ok(DisposalState::Sent),
            5 => Ok(DisposalState::Told),
            6 => Ok(DisposalState::Delivered),
            7 => Ok(DisposalState::Busy),
            8 => Ok(DisposalState::Received),
            9 => Ok(DisposalState::Bad),
            _ => Err(EnumCodeError::new("DisposalState", code)),
        }
    }

    /// Whether this state answers the goal question, and how.
    ///
    /// With `goal_condition` true the question is "has this channel reached
    /// the goal"; with false it is "is this channel exhausted short of the
    /// goal". `New` rows have not been tried and take no position either way.
    pub fn goal_reached(&self, goal_condition: bool) -> Option<bool> {
        match self {
            DisposalState::Queued
            | DisposalState::Sent
            | DisposalState::Told
            | DisposalState::Delivered
            | DisposalState::Received => Some(goal_condition),
            DisposalState::Pending
            | DisposalState::Rejected
            | DisposalState::Busy
            | DisposalState::Bad => Some(!goal_condition),
            DisposalState::New => None,
        }
    }

    /// An attempt has been handed to the channel and not yet concluded.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            DisposalState::Queued | DisposalState::Sent | DisposalState::Told
        )
    }

    /// The only state the scheduler may act on.
    pub fn is_actionable(&self) -> bool {
        matches!(self, DisposalState::Pending)
    }

    /// Message-level rejection; survives channel flapping.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, DisposalState::Bad)
    }
}

// ============================================================================
// REQUEST-LEVEL AGGREGATE STATE
// ============================================================================

/// Request-level aggregate derived from all of its disposal rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "i32", try_from = "i32")]
pub enum DisposalTotalState {
    /// No channel has been attempted
    #[default]
    New = 0,
    /// At least one channel attempt is in flight
    Distribute = 1,
    /// Imposed by the garbage collector
    Expired = 2,
    /// Every required channel reached its goal state
    Complete = 3,
    /// The route set is exhausted without reaching the goal
    Incomplete = 4,
    /// Imposed by a hard delivery failure
    Failed = 5,
}

impl DisposalTotalState {
    pub fn as_code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Result<Self, EnumCodeError> {
        match code {
            0 => Ok(DisposalTotalState::New),
            1 => Ok(DisposalTotalState::Distribute),
            2 => Ok(DisposalTotalState::Expired),
            3 => Ok(DisposalTotalState::Complete),
            4 => Ok(DisposalTotalState::Incomplete),
            5 => Ok(DisposalTotalState::Failed),
            _ => Err(EnumCodeError::new("DisposalTotalState", code)),
        }
    }

    /// Externally imposed; derivation from disposal rows must not overwrite it.
    pub fn is_imposed(&self) -> bool {
        matches!(self, DisposalTotalState::Expired | DisposalTotalState::Failed)
    }

    fn precedence(&self) -> u8 {
        match self {
            DisposalTotalState::New => 0,
            DisposalTotalState::Distribute => 1,
            DisposalTotalState::Incomplete => 2,
            DisposalTotalState::Complete => 3,
            DisposalTotalState::Expired => 4,
            DisposalTotalState::Failed => 5,
        }
    }

    /// Fold an imposed state into the cached aggregate. The stronger
    /// classification wins; imposing a weaker state never regresses the cache.
    pub fn fold(self, incoming: DisposalTotalState) -> DisposalTotalState {
        if incoming.precedence() >= self.precedence() {
            incoming
        } else {
            self
        }
    }
}

// ============================================================================
// CHANNEL STATE MACHINE
// ============================================================================

/// Administrative state of a communication channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "i32", try_from = "i32")]
pub enum ChannelState {
    #[default]
    Active = 0,
    Inactive = 1,
}

impl ChannelState {
    pub fn as_code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Result<Self, EnumCodeError> {
        match code {
            0 => Ok(ChannelState::Active),
            1 => Ok(ChannelState::Inactive),
            _ => Err(EnumCodeError::new("ChannelState", code)),
        }
    }
}

/// Channel transition event. Not persisted; delivered by the service wrapper
/// when a link comes up, goes down, or is declared fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelChange {
    Activate,
    Deactivate,
    Repair,
}

impl ChannelChange {
    /// Channel state after the event, if the event changes it.
    pub fn next_channel_state(&self) -> Option<ChannelState> {
        match self {
            ChannelChange::Activate => Some(ChannelState::Active),
            ChannelChange::Deactivate => Some(ChannelState::Inactive),
            ChannelChange::Repair => None,
        }
    }

    /// Whether this event resets a disposal row in `state` back to Pending.
    ///
    /// Deactivate retries everything the link failed to carry; a Bad row is
    /// a message-level rejection and survives until a Repair event declares
    /// the channel worth retrying for it.
    pub fn disposal_reset_applies(&self, state: DisposalState) -> bool {
        match self {
            // Placeholder: activation currently leaves disposal rows alone.
            // TODO: decide whether activation should replay Pending rows to
            // cut time-to-first-retry after a channel comes up cleanly.
            ChannelChange::Activate => false,
            ChannelChange::Deactivate => !state.is_terminal_failure(),
            ChannelChange::Repair => state.is_terminal_failure(),
        }
    }
}

// ============================================================================
// REQUEST TYPING
// ============================================================================

/// Which request table a record or disposal row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum RequestKind {
    Postal = 0,
    Retrieval = 1,
    Interest = 2,
}

impl RequestKind {
    pub fn as_code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Result<Self, EnumCodeError> {
        match code {
            0 => Ok(RequestKind::Postal),
            1 => Ok(RequestKind::Retrieval),
            2 => Ok(RequestKind::Interest),
            _ => Err(EnumCodeError::new("RequestKind", code)),
        }
    }

    pub const ALL: [RequestKind; 3] = [
        RequestKind::Postal,
        RequestKind::Retrieval,
        RequestKind::Interest,
    ];
}

/// When the payload bytes of a request are captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "i32", try_from = "i32")]
pub enum SerialMoment {
    /// Bytes were supplied with the request
    #[default]
    Apriori = 0,
    /// Captured at enqueue time
    Eager = 1,
    /// Captured at first send attempt
    Lazy = 2,
}

impl SerialMoment {
    pub fn as_code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Result<Self, EnumCodeError> {
        match code {
            0 => Ok(SerialMoment::Apriori),
            1 => Ok(SerialMoment::Eager),
            2 => Ok(SerialMoment::Lazy),
            _ => Err(EnumCodeError::new("SerialMoment", code)),
        }
    }
}

/// How long a retrieval subscription stays live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "i32", try_from = "i32")]
pub enum ContinuityType {
    /// Single response
    #[default]
    Once = 0,
    /// Responses for a time window
    Temporal = 1,
    /// A fixed number of responses
    Quantity = 2,
}

impl ContinuityType {
    pub fn as_code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Result<Self, EnumCodeError> {
        match code {
            0 => Ok(ContinuityType::Once),
            1 => Ok(ContinuityType::Temporal),
            2 => Ok(ContinuityType::Quantity),
            _ => Err(EnumCodeError::new("ContinuityType", code)),
        }
    }
}

// ============================================================================
// CODE / STRING CONVERSIONS
// ============================================================================

/// Error when decoding an unknown persisted enum code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumCodeError {
    pub enum_name: &'static str,
    pub code: i32,
}

impl EnumCodeError {
    fn new(enum_name: &'static str, code: i32) -> Self {
        Self { enum_name, code }
    }
}

impl fmt::Display for EnumCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown {} code: {}", self.enum_name, self.code)
    }
}

impl std::error::Error for EnumCodeError {}

macro_rules! code_serde {
    ($ty:ty) => {
        impl From<$ty> for i32 {
            fn from(v: $ty) -> i32 {
                v.as_code()
            }
        }

        impl TryFrom<i32> for $ty {
            type Error = EnumCodeError;

            fn try_from(code: i32) -> Result<Self, Self::Error> {
                Self::from_code(code)
            }
        }
    };
}

code_serde!(DisposalState);
code_serde!(DisposalTotalState);
code_serde!(ChannelState);
code_serde!(RequestKind);
code_serde!(SerialMoment);
code_serde!(ContinuityType);

fn normalize_token(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl fmt::Display for DisposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            DisposalState::New => "New",
            DisposalState::Rejected => "Rejected",
            DisposalState::Pending => "Pending",
            DisposalState::Queued => "Queued",
            DisposalState::Sent => "Sent",
            DisposalState::Told => "Told",
            DisposalState::Delivered => "Delivered",
            DisposalState::Busy => "Busy",
            DisposalState::Received => "Received",
            DisposalState::Bad => "Bad",
        };
        write!(f, "{}", value)
    }
}

impl FromStr for DisposalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "new" => Ok(DisposalState::New),
            "rejected" => Ok(DisposalState::Rejected),
            "pending" => Ok(DisposalState::Pending),
            "queued" => Ok(DisposalState::Queued),
            "sent" => Ok(DisposalState::Sent),
            "told" => Ok(DisposalState::Told),
            "delivered" => Ok(DisposalState::Delivered),
            "busy" => Ok(DisposalState::Busy),
            "received" => Ok(DisposalState::Received),
            "bad" => Ok(DisposalState::Bad),
            _ => Err(format!("Invalid DisposalState: {}", s)),
        }
    }
}

impl fmt::Display for DisposalTotalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            DisposalTotalState::New => "New",
            DisposalTotalState::Distribute => "Distribute",
            DisposalTotalState::Expired => "Expired",
            DisposalTotalState::Complete => "Complete",
            DisposalTotalState::Incomplete => "Incomplete",
            DisposalTotalState::Failed => "Failed",
        };
        write!(f, "{}", value)
    }
}

impl FromStr for DisposalTotalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "new" => Ok(DisposalTotalState::New),
            "distribute" => Ok(DisposalTotalState::Distribute),
            "expired" => Ok(DisposalTotalState::Expired),
            "complete" | "completed" => Ok(DisposalTotalState::Complete),
            "incomplete" => Ok(DisposalTotalState::Incomplete),
            "failed" | "failure" => Ok(DisposalTotalState::Failed),
            _ => Err(format!("Invalid DisposalTotalState: {}", s)),
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            ChannelState::Active => "Active",
            ChannelState::Inactive => "Inactive",
        };
        write!(f, "{}", value)
    }
}

impl FromStr for ChannelState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "active" => Ok(ChannelState::Active),
            "inactive" => Ok(ChannelState::Inactive),
            _ => Err(format!("Invalid ChannelState: {}", s)),
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            RequestKind::Postal => "Postal",
            RequestKind::Retrieval => "Retrieval",
            RequestKind::Interest => "Interest",
        };
        write!(f, "{}", value)
    }
}

impl FromStr for RequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "postal" => Ok(RequestKind::Postal),
            "retrieval" => Ok(RequestKind::Retrieval),
            "interest" => Ok(RequestKind::Interest),
            _ => Err(format!("Invalid RequestKind: {}", s)),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Every valid code round-trips; every other i32 is rejected.
        #[test]
        fn prop_disposal_state_code_round_trip(code in -100i32..100) {
            match DisposalState::from_code(code) {
                Ok(state) => prop_assert_eq!(state.as_code(), code),
                Err(_) => prop_assert!(!(0..=9).contains(&code)),
            }
        }

        #[test]
        fn prop_total_state_code_round_trip(code in -100i32..100) {
            match DisposalTotalState::from_code(code) {
                Ok(state) => prop_assert_eq!(state.as_code(), code),
                Err(_) => prop_assert!(!(0..=5).contains(&code)),
            }
        }

        /// fold is monotone: the result never ranks below either input.
        #[test]
        fn prop_fold_never_regresses(a in 0i32..6, b in 0i32..6) {
            let a = DisposalTotalState::from_code(a).unwrap();
            let b = DisposalTotalState::from_code(b).unwrap();
            let folded = a.fold(b);
            prop_assert!(folded == a || folded == b);
            prop_assert_eq!(a.fold(b), b.fold(a));
        }
    }
}
