//! Route plans, delivery goals, and the disposition aggregation rule.

use crate::{CourierResult, DisposalState, DisposalTotalState, EnumCodeError, PolicyError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// GOAL PARAMETERS
// ============================================================================

/// The terminal state a channel must reach for a request to count as
/// distributed on it. Policy-dependent; an explicit parameter of aggregation
/// rather than a hard-coded choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "i32", try_from = "i32")]
pub enum DeliveryGoal {
    /// Hand-off to the channel queue is enough
    #[default]
    Queued = 0,
    /// Bytes must have left this node
    Sent = 1,
    /// The destination must have taken delivery
    Delivered = 2,
}

impl DeliveryGoal {
    pub fn as_code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Result<Self, EnumCodeError> {
        match code {
            0 => Ok(DeliveryGoal::Queued),
            1 => Ok(DeliveryGoal::Sent),
            2 => Ok(DeliveryGoal::Delivered),
            _ => Err(EnumCodeError {
                enum_name: "DeliveryGoal",
                code,
            }),
        }
    }

    /// Whether `state` satisfies this goal. Mirrors
    /// [`DisposalState::goal_reached`] with the success class narrowed to
    /// states at or beyond the goal threshold; `New` takes no position.
    pub fn reached_by(&self, state: DisposalState) -> Option<bool> {
        let success = match self {
            DeliveryGoal::Queued => matches!(
                state,
                DisposalState::Queued
                    | DisposalState::Sent
                    | DisposalState::Told
                    | DisposalState::Delivered
                    | DisposalState::Received
            ),
            DeliveryGoal::Sent => matches!(
                state,
                DisposalState::Sent
                    | DisposalState::Told
                    | DisposalState::Delivered
                    | DisposalState::Received
            ),
            DeliveryGoal::Delivered => {
                matches!(state, DisposalState::Delivered | DisposalState::Received)
            }
        };
        match state {
            DisposalState::New => None,
            _ => Some(success),
        }
    }
}

impl From<DeliveryGoal> for i32 {
    fn from(v: DeliveryGoal) -> i32 {
        v.as_code()
    }
}

impl TryFrom<i32> for DeliveryGoal {
    type Error = EnumCodeError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Self::from_code(code)
    }
}

/// How goal attainment folds across the route set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "i32", try_from = "i32")]
pub enum RouteRequirement {
    /// Every channel in the route set must reach the goal
    #[default]
    All = 0,
    /// The channels are redundant; any one reaching the goal completes
    Any = 1,
}

impl RouteRequirement {
    pub fn as_code(&self) -> i32 {
        *self as i32
    }

    pub fn from_code(code: i32) -> Result<Self, EnumCodeError> {
        match code {
            0 => Ok(RouteRequirement::All),
            1 => Ok(RouteRequirement::Any),
            _ => Err(EnumCodeError {
                enum_name: "RouteRequirement",
                code,
            }),
        }
    }
}

impl From<RouteRequirement> for i32 {
    fn from(v: RouteRequirement) -> i32 {
        v.as_code()
    }
}

impl TryFrom<i32> for RouteRequirement {
    type Error = EnumCodeError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Self::from_code(code)
    }
}

// ============================================================================
// ROUTE PLAN
// ============================================================================

/// The channel → initial-state map seeded for a request from policy.
///
/// Insertion order is preserved so disposal rows are created
/// deterministically.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RoutePlan {
    entries: Vec<(String, DisposalState)>,
}

impl RoutePlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// A plan that seeds every named channel as Pending, the normal case for
    /// a freshly created request.
    pub fn pending<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut plan = Self::new();
        for channel in channels {
            plan.set(channel.as_ref(), DisposalState::Pending);
        }
        plan
    }

    /// Insert or replace a channel's seed state.
    pub fn set(&mut self, channel: &str, state: DisposalState) -> &mut Self {
        match self.entries.iter_mut().find(|(name, _)| name == channel) {
            Some(entry) => entry.1 = state,
            None => self.entries.push((channel.to_string(), state)),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DisposalState)> {
        self.entries.iter().map(|(name, state)| (name.as_str(), *state))
    }
}

// ============================================================================
// AGGREGATION
// ============================================================================

/// Derive a request's disposition from its per-channel states.
///
/// Expired and Failed are never produced here; they are imposed externally
/// and the caller must not overwrite them with a derived value.
pub fn aggregate_disposition(
    states: &[DisposalState],
    goal: DeliveryGoal,
    requirement: RouteRequirement,
) -> DisposalTotalState {
    if states.is_empty() {
        return DisposalTotalState::New;
    }

    // Nothing attempted yet.
    if states
        .iter()
        .all(|s| matches!(s, DisposalState::New | DisposalState::Pending))
    {
        return DisposalTotalState::New;
    }

    let reached = |s: &DisposalState| goal.reached_by(*s).unwrap_or(false);
    let complete = match requirement {
        RouteRequirement::All => states.iter().all(reached),
        RouteRequirement::Any => states.iter().any(reached),
    };
    if complete {
        return DisposalTotalState::Complete;
    }

    // Exhausted: every channel sits short of the goal with nothing in flight.
    let exhausted = states.iter().all(|s| s.goal_reached(false).unwrap_or(false));
    if exhausted {
        return DisposalTotalState::Incomplete;
    }

    DisposalTotalState::Distribute
}

// ============================================================================
// POLICY
// ============================================================================

/// A resolved distribution rule for one topic: which channels carry it, at
/// what base priority, and in which encoding per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionPolicy {
    pub route_channels: Vec<String>,
    pub base_priority: i32,
    pub encoding_per_channel: HashMap<String, String>,
    pub goal: DeliveryGoal,
    pub requirement: RouteRequirement,
}

impl DistributionPolicy {
    pub fn new(route_channels: Vec<String>, base_priority: i32) -> Self {
        Self {
            route_channels,
            base_priority,
            encoding_per_channel: HashMap::new(),
            goal: DeliveryGoal::default(),
            requirement: RouteRequirement::default(),
        }
    }

    pub fn with_goal(mut self, goal: DeliveryGoal, requirement: RouteRequirement) -> Self {
        self.goal = goal;
        self.requirement = requirement;
        self
    }

    pub fn with_encoding(mut self, channel: &str, encoding: &str) -> Self {
        self.encoding_per_channel
            .insert(channel.to_string(), encoding.to_string());
        self
    }

    /// The route plan this policy seeds for a new request.
    pub fn route_plan(&self) -> RoutePlan {
        RoutePlan::pending(&self.route_channels)
    }
}

/// Source of resolved distribution rules. The engine only consumes the
/// resolved object; computing it belongs to the policy collaborator.
pub trait PolicyMatcher: Send + Sync {
    fn resolve(&self, topic: &str) -> CourierResult<DistributionPolicy>;
}

/// Table-driven matcher with longest-prefix topic matching and an optional
/// default. Enough for tests and for embedders without a live policy source.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyMatcher {
    rules: Vec<(String, DistributionPolicy)>,
    fallback: Option<DistributionPolicy>,
}

impl StaticPolicyMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, topic_prefix: &str, policy: DistributionPolicy) -> Self {
        self.rules.push((topic_prefix.to_string(), policy));
        self
    }

    pub fn with_fallback(mut self, policy: DistributionPolicy) -> Self {
        self.fallback = Some(policy);
        self
    }
}

impl PolicyMatcher for StaticPolicyMatcher {
    fn resolve(&self, topic: &str) -> CourierResult<DistributionPolicy> {
        self.rules
            .iter()
            .filter(|(prefix, _)| topic.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, policy)| policy.clone())
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| {
                PolicyError::NoMatch {
                    topic: topic.to_string(),
                }
                .into()
            })
    }
}

impl fmt::Display for DeliveryGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            DeliveryGoal::Queued => "Queued",
            DeliveryGoal::Sent => "Sent",
            DeliveryGoal::Delivered => "Delivered",
        };
        write!(f, "{}", value)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use DisposalState::*;

    #[test]
    fn test_route_plan_pending_preserves_order() {
        let plan = RoutePlan::pending(["gateway", "multicast", "serial"]);
        let channels: Vec<&str> = plan.iter().map(|(c, _)| c).collect();
        assert_eq!(channels, vec!["gateway", "multicast", "serial"]);
        assert!(plan.iter().all(|(_, s)| s == Pending));
    }

    #[test]
    fn test_route_plan_set_replaces_in_place() {
        let mut plan = RoutePlan::pending(["gateway", "multicast"]);
        plan.set("gateway", Queued);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.iter().next(), Some(("gateway", Queued)));
    }

    #[test]
    fn test_aggregate_empty_and_untried_are_new() {
        let goal = DeliveryGoal::Queued;
        assert_eq!(
            aggregate_disposition(&[], goal, RouteRequirement::All),
            DisposalTotalState::New
        );
        assert_eq!(
            aggregate_disposition(&[Pending, Pending], goal, RouteRequirement::All),
            DisposalTotalState::New
        );
        assert_eq!(
            aggregate_disposition(&[New, Pending], goal, RouteRequirement::All),
            DisposalTotalState::New
        );
    }

    #[test]
    fn test_aggregate_partial_progress_is_distribute() {
        let goal = DeliveryGoal::Queued;
        // One channel reached, the other still pending: in flight overall.
        assert_eq!(
            aggregate_disposition(&[Sent, Pending], goal, RouteRequirement::All),
            DisposalTotalState::Distribute
        );
        assert_eq!(
            aggregate_disposition(&[Queued, Rejected], goal, RouteRequirement::All),
            DisposalTotalState::Distribute
        );
    }

    #[test]
    fn test_aggregate_complete_depends_on_requirement() {
        let goal = DeliveryGoal::Queued;
        assert_eq!(
            aggregate_disposition(&[Queued, Pending], goal, RouteRequirement::Any),
            DisposalTotalState::Complete
        );
        assert_eq!(
            aggregate_disposition(&[Queued, Pending], goal, RouteRequirement::All),
            DisposalTotalState::Distribute
        );
        assert_eq!(
            aggregate_disposition(&[Queued, Sent], goal, RouteRequirement::All),
            DisposalTotalState::Complete
        );
    }

    #[test]
    fn test_aggregate_complete_respects_goal_threshold() {
        // Queued is not enough when the goal demands delivery.
        assert_eq!(
            aggregate_disposition(&[Queued], DeliveryGoal::Delivered, RouteRequirement::All),
            DisposalTotalState::Distribute
        );
        assert_eq!(
            aggregate_disposition(&[Delivered], DeliveryGoal::Delivered, RouteRequirement::All),
            DisposalTotalState::Complete
        );
        assert_eq!(
            aggregate_disposition(&[Received], DeliveryGoal::Sent, RouteRequirement::All),
            DisposalTotalState::Complete
        );
    }

    #[test]
    fn test_aggregate_exhausted_route_is_incomplete() {
        let goal = DeliveryGoal::Queued;
        assert_eq!(
            aggregate_disposition(&[Rejected, Bad], goal, RouteRequirement::All),
            DisposalTotalState::Incomplete
        );
        assert_eq!(
            aggregate_disposition(&[Busy, Pending], goal, RouteRequirement::All),
            DisposalTotalState::Incomplete
        );
    }

    #[test]
    fn test_static_matcher_longest_prefix_wins() {
        let matcher = StaticPolicyMatcher::new()
            .with_rule(
                "status.",
                DistributionPolicy::new(vec!["multicast".into()], 10),
            )
            .with_rule(
                "status.position",
                DistributionPolicy::new(vec!["gateway".into(), "serial".into()], 20),
            );

        let policy = matcher.resolve("status.position.blue").unwrap();
        assert_eq!(policy.base_priority, 20);
        assert_eq!(policy.route_channels, vec!["gateway", "serial"]);

        let policy = matcher.resolve("status.fuel").unwrap();
        assert_eq!(policy.base_priority, 10);

        assert!(matcher.resolve("chat.room1").is_err());
    }

    #[test]
    fn test_static_matcher_fallback() {
        let matcher = StaticPolicyMatcher::new()
            .with_fallback(DistributionPolicy::new(vec!["gateway".into()], 0));
        let policy = matcher.resolve("anything").unwrap();
        assert_eq!(policy.route_channels, vec!["gateway"]);
    }
}
