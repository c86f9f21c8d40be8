//! End-to-end scenarios over a real on-disk store.

use chrono::{Duration, Utc};
use courier_store::{
    ChannelChange, ChannelState, DisposalState, DisposalTotalState, DistributorStore,
    InterestRecord, PostalRecord, RequestFields, RequestKind, RequestRecord, RoutePlan,
};
use tempfile::TempDir;
use uuid::Uuid;

fn open_store() -> (DistributorStore, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let store = DistributorStore::open(dir.path()).expect("open store");
    (store, dir)
}

fn make_postal(topic: &str, subtopic: &str, provider: &str, priority: i32) -> PostalRecord {
    let request = RequestRecord::new(
        Uuid::now_v7(),
        topic,
        subtopic,
        provider,
        Utc::now() + Duration::hours(1),
    )
    .with_priority(priority);
    PostalRecord::new(request, b"payload".to_vec())
}

fn activate(store: &DistributorStore, channels: &[&str]) {
    for channel in channels {
        store
            .channel_upsert(channel, ChannelState::Active)
            .expect("channel upsert");
    }
}

// ============================================================================
// Uniqueness and idempotence
// ============================================================================

#[test]
fn test_disposal_pair_stays_unique_under_repeated_upserts() {
    let (store, _dir) = open_store();
    activate(&store, &["gateway"]);

    let id = store
        .postal_upsert(make_postal("chat", "room1", "p://a", 0), &RoutePlan::pending(["gateway"]))
        .expect("upsert");

    for state in [
        DisposalState::Queued,
        DisposalState::Sent,
        DisposalState::Busy,
        DisposalState::Pending,
        DisposalState::Delivered,
    ] {
        store
            .disposal_upsert(RequestKind::Postal, id, "gateway", state)
            .expect("disposal upsert");
    }

    let rows = store
        .disposals_by_request(RequestKind::Postal, id)
        .expect("query");
    assert_eq!(rows.len(), 1, "one row per (request, channel) pair");
    assert_eq!(rows[0].state, DisposalState::Delivered);
}

#[test]
fn test_upsert_same_uuid_is_idempotent() {
    let (store, _dir) = open_store();

    let first = make_postal("chat", "room1", "p://a", 1);
    let uuid = first.request.uuid;
    let id = store
        .postal_upsert(first, &RoutePlan::pending(["gateway"]))
        .expect("first upsert");

    let mut second = make_postal("chat", "room1", "p://a", 7);
    second.request.uuid = uuid;
    second.payload = b"newer payload".to_vec();
    let id2 = store
        .postal_upsert(second, &RoutePlan::pending(["gateway"]))
        .expect("second upsert");

    assert_eq!(id, id2, "same uuid lands on the same row");

    let stored = store.postal_by_uuid(uuid).expect("query").expect("found");
    assert_eq!(stored.request.id, id);
    assert_eq!(stored.request.priority, 7, "latest fields win");
    assert_eq!(stored.payload, b"newer payload");
    assert_eq!(stored.request.count, 1, "modification counter advanced");

    let stats = store.stats().expect("stats");
    assert_eq!(stats.postal, 1, "exactly one request row");
}

#[test]
fn test_upsert_matches_natural_key_when_uuid_is_new() {
    let (store, _dir) = open_store();

    let id = store
        .postal_upsert(make_postal("chat", "room1", "p://a", 1), &RoutePlan::new())
        .expect("first upsert");

    // Fresh uuid, same (topic, subtopic, provider) tuple.
    let id2 = store
        .postal_upsert(make_postal("chat", "room1", "p://a", 2), &RoutePlan::new())
        .expect("second upsert");
    assert_eq!(id, id2, "natural key match updates in place");

    // A different provider is a different tuple.
    let id3 = store
        .postal_upsert(make_postal("chat", "room1", "p://b", 2), &RoutePlan::new())
        .expect("third upsert");
    assert_ne!(id, id3);
}

// ============================================================================
// Cascade
// ============================================================================

#[test]
fn test_delete_cascades_to_owned_disposals_only() {
    let (store, _dir) = open_store();

    let doomed = store
        .postal_upsert(
            make_postal("chat", "room1", "p://a", 0),
            &RoutePlan::pending(["gateway", "multicast"]),
        )
        .expect("upsert doomed");
    let kept = store
        .postal_upsert(
            make_postal("chat", "room2", "p://a", 0),
            &RoutePlan::pending(["gateway"]),
        )
        .expect("upsert kept");

    let deleted = store
        .postal_delete_by_topic("chat", "room1", None)
        .expect("delete");
    assert_eq!(deleted, 1);

    assert!(store
        .disposals_by_request(RequestKind::Postal, doomed)
        .expect("query")
        .is_empty());
    assert_eq!(
        store
            .disposals_by_request(RequestKind::Postal, kept)
            .expect("query")
            .len(),
        1,
        "unrelated disposal rows survive"
    );
}

// ============================================================================
// Readiness
// ============================================================================

#[test]
fn test_ready_orders_by_priority_then_id() {
    let (store, _dir) = open_store();
    activate(&store, &["gateway"]);
    let route = RoutePlan::pending(["gateway"]);

    let a = store
        .postal_upsert(make_postal("t", "a", "p://a", 10), &route)
        .expect("upsert a");
    let b = store
        .postal_upsert(make_postal("t", "b", "p://b", 20), &route)
        .expect("upsert b");
    let c = store
        .postal_upsert(make_postal("t", "c", "p://c", 10), &route)
        .expect("upsert c");
    assert!(a < b && b < c, "ids in creation order");

    let ready = store.query_ready().expect("ready");
    let ids: Vec<_> = ready.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![b, a, c], "priority desc, oldest first within a band");
}

#[test]
fn test_ready_excludes_requests_stranded_on_inactive_channels() {
    let (store, _dir) = open_store();
    activate(&store, &["gateway"]);
    store
        .channel_upsert("serial", ChannelState::Inactive)
        .expect("channel upsert");

    let reachable = store
        .postal_upsert(
            make_postal("t", "up", "p://a", 0),
            &RoutePlan::pending(["gateway", "serial"]),
        )
        .expect("upsert");
    let stranded = store
        .postal_upsert(
            make_postal("t", "down", "p://b", 0),
            &RoutePlan::pending(["serial"]),
        )
        .expect("upsert");

    let ready = store.query_ready().expect("ready");
    let ids: Vec<_> = ready.iter().map(|r| r.id).collect();
    assert!(ids.contains(&reachable));
    assert!(!ids.contains(&stranded), "inactive-only request is not ready");

    // A request whose pending rows were all consumed is not ready either.
    store
        .disposal_upsert(RequestKind::Postal, reachable, "gateway", DisposalState::Queued)
        .expect("disposal upsert");
    let ready = store.query_ready().expect("ready");
    assert!(ready.is_empty());
}

// ============================================================================
// Channel transitions
// ============================================================================

#[test]
fn test_deactivate_rearms_link_failures_but_not_bad() {
    let (store, _dir) = open_store();
    activate(&store, &["gateway", "multicast"]);

    let sent = store
        .postal_upsert(
            make_postal("t", "a", "p://a", 0),
            &RoutePlan::pending(["gateway"]),
        )
        .expect("upsert");
    let bad = store
        .postal_upsert(
            make_postal("t", "b", "p://b", 0),
            &RoutePlan::pending(["gateway"]),
        )
        .expect("upsert");
    store
        .disposal_upsert(RequestKind::Postal, sent, "gateway", DisposalState::Sent)
        .expect("disposal");
    store
        .disposal_upsert(RequestKind::Postal, bad, "gateway", DisposalState::Bad)
        .expect("disposal");

    store
        .on_channel_change("gateway", ChannelChange::Deactivate)
        .expect("deactivate");

    assert_eq!(
        store.disposals_by_request(RequestKind::Postal, sent).unwrap()[0].state,
        DisposalState::Pending,
        "link-level failure retried after deactivate"
    );
    assert_eq!(
        store.disposals_by_request(RequestKind::Postal, bad).unwrap()[0].state,
        DisposalState::Bad,
        "message-level rejection survives deactivate"
    );
    assert_eq!(
        store.channel_state("gateway").unwrap(),
        Some(ChannelState::Inactive)
    );

    store
        .on_channel_change("gateway", ChannelChange::Repair)
        .expect("repair");
    assert_eq!(
        store.disposals_by_request(RequestKind::Postal, bad).unwrap()[0].state,
        DisposalState::Pending,
        "repair re-arms the rejected message"
    );
    assert_eq!(
        store.channel_state("gateway").unwrap(),
        Some(ChannelState::Inactive),
        "repair leaves channel state alone"
    );

    store
        .on_channel_change("gateway", ChannelChange::Activate)
        .expect("activate");
    assert_eq!(
        store.channel_state("gateway").unwrap(),
        Some(ChannelState::Active)
    );
}

// ============================================================================
// Garbage collection
// ============================================================================

#[test]
fn test_gc_honors_the_per_kind_grace_period() {
    let (store, _dir) = open_store();
    let now = Utc::now();

    let mut expired = make_postal("t", "old", "p://a", 0);
    expired.request.expiration = now - Duration::hours(8) - Duration::seconds(1);
    let mut fresh = make_postal("t", "new", "p://b", 0);
    fresh.request.expiration = now - Duration::hours(7);

    let expired_id = store
        .postal_upsert(expired, &RoutePlan::pending(["gateway"]))
        .expect("upsert");
    store
        .postal_upsert(fresh, &RoutePlan::pending(["gateway"]))
        .expect("upsert");

    // An interest this stale is nowhere near its one-year grace period.
    let mut interest = InterestRecord::new(RequestRecord::new(
        Uuid::now_v7(),
        "t",
        "old",
        "p://c",
        now - Duration::hours(9),
    ));
    interest.filter = Some("kind = track".to_string());
    store
        .interest_upsert(interest, &RoutePlan::new())
        .expect("upsert interest");

    let sweep = store.delete_garbage_at(now);
    assert_eq!(sweep.postal, 1, "only the request past its grace period goes");
    assert_eq!(sweep.interest, 0, "interest grace period is a year");
    assert_eq!(sweep.total(), 1);

    assert!(store
        .disposals_by_request(RequestKind::Postal, expired_id)
        .expect("query")
        .is_empty(), "disposal rows go with their request");

    let stats = store.stats().expect("stats");
    assert_eq!(stats.postal, 1);
    assert_eq!(stats.interest, 1);
}

// ============================================================================
// The end-to-end scenario
// ============================================================================

#[test]
fn test_end_to_end_distribution_round() {
    let (store, _dir) = open_store();
    activate(&store, &["gateway", "multicast"]);

    let record = make_postal("status.position", "blue", "p://tracks/7", 5);
    let uuid = record.request.uuid;
    let id = store
        .postal_upsert(record, &RoutePlan::pending(["gateway", "multicast"]))
        .expect("upsert");

    // Freshly seeded: ready, aggregate still New.
    let ready = store.query_ready().expect("ready");
    assert!(ready.iter().any(|r| r.id == id && r.priority == 5));
    assert_eq!(
        store.postal_by_uuid(uuid).unwrap().unwrap().request.disposition,
        DisposalTotalState::New
    );

    // Gateway reports the bytes left this node.
    store
        .disposal_upsert(RequestKind::Postal, id, "gateway", DisposalState::Sent)
        .expect("disposal");
    let rows = store
        .disposals_by_request(RequestKind::Postal, id)
        .expect("query");
    let state_of = |channel: &str| {
        rows.iter()
            .find(|r| r.channel == channel)
            .map(|r| r.state)
            .expect("row exists")
    };
    assert_eq!(state_of("gateway"), DisposalState::Sent);
    assert_eq!(state_of("multicast"), DisposalState::Pending);

    // Multicast drops; its pending row is unchanged by the reset.
    store
        .on_channel_change("multicast", ChannelChange::Deactivate)
        .expect("deactivate");
    let rows = store
        .disposals_by_request(RequestKind::Postal, id)
        .expect("query");
    assert_eq!(
        rows.iter().find(|r| r.channel == "multicast").unwrap().state,
        DisposalState::Pending
    );

    // One channel reached the goal, the other has not: still distributing.
    assert_eq!(
        store.postal_by_uuid(uuid).unwrap().unwrap().request.disposition,
        DisposalTotalState::Distribute
    );
}

// ============================================================================
// Durability, arguments, imposed states
// ============================================================================

#[test]
fn test_rows_survive_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let uuid;
    {
        let store = DistributorStore::open(dir.path()).expect("open");
        let record = make_postal("t", "s", "p://a", 3);
        uuid = record.request.uuid;
        store
            .postal_upsert(record, &RoutePlan::pending(["gateway"]))
            .expect("upsert");
    }

    let store = DistributorStore::open(dir.path()).expect("reopen");
    let stored = store.postal_by_uuid(uuid).expect("query").expect("found");
    assert_eq!(stored.request.priority, 3);
    assert_eq!(
        store
            .disposals_by_request(RequestKind::Postal, stored.request.id)
            .expect("query")
            .len(),
        1
    );
}

#[test]
fn test_malformed_arguments_are_rejected_without_mutation() {
    let (store, _dir) = open_store();

    let record = make_postal(" ", "s", "p://a", 0);
    assert!(store.postal_upsert(record, &RoutePlan::new()).is_err());
    assert!(store.postal_delete_by_topic("", "s", None).is_err());
    assert!(store.channel_upsert("", ChannelState::Active).is_err());

    let stats = store.stats().expect("stats");
    assert_eq!(stats.postal, 0);
    assert_eq!(stats.channels, 0);
}

mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Property: however channel outcomes arrive, each (request, channel)
        /// pair keeps exactly one ledger row holding the last state.
        #[test]
        fn prop_disposal_rows_stay_unique(
            states in proptest::collection::vec((0usize..2, 0i32..10), 1..24)
        ) {
            let (store, _dir) = open_store();
            let id = store
                .postal_upsert(
                    make_postal("t", "s", "p://a", 0),
                    &RoutePlan::pending(["gateway", "serial"]),
                )
                .expect("upsert");

            let channels = ["gateway", "serial"];
            let mut last = [DisposalState::Pending, DisposalState::Pending];
            for (channel_index, code) in states {
                let state = DisposalState::from_code(code).unwrap();
                store
                    .disposal_upsert(RequestKind::Postal, id, channels[channel_index], state)
                    .expect("disposal upsert");
                last[channel_index] = state;
            }

            let rows = store
                .disposals_by_request(RequestKind::Postal, id)
                .expect("query");
            prop_assert_eq!(rows.len(), 2);
            for (channel, expected) in channels.iter().zip(last) {
                let row = rows.iter().find(|r| &r.channel == channel).expect("row");
                prop_assert_eq!(row.state, expected);
            }
        }
    }
}

#[test]
fn test_update_by_id_folds_an_imposed_state() {
    let (store, _dir) = open_store();
    let id = store
        .postal_upsert(
            make_postal("t", "s", "p://a", 0),
            &RoutePlan::pending(["gateway"]),
        )
        .expect("upsert");

    let updated = store
        .postal_update_by_id(
            id,
            RequestFields::new().with_priority(9),
            Some(DisposalTotalState::Failed),
        )
        .expect("update");
    assert_eq!(updated, 1);

    let records = store.postal_query_by_topic("t", "s").expect("query");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].request.priority, 9);
    assert_eq!(records[0].request.disposition, DisposalTotalState::Failed);

    // A later channel outcome must not clear the imposed failure.
    store
        .disposal_upsert(RequestKind::Postal, id, "gateway", DisposalState::Delivered)
        .expect("disposal");
    let records = store.postal_query_by_topic("t", "s").expect("query");
    assert_eq!(records[0].request.disposition, DisposalTotalState::Failed);

    // Updating a missing row touches nothing.
    assert_eq!(
        store
            .postal_update_by_id(9999, RequestFields::new(), None)
            .expect("update"),
        0
    );
}
