//! Presence and capability ledgers.
//!
//! Both follow the request tables' upsert discipline, keyed by device and by
//! uuid respectively, but carry no disposal tracking.

use chrono::Utc;
use courier_core::{CapabilityRecord, CourierResult, PresenceRecord, StoreError};
use uuid::Uuid;

use crate::schema;
use crate::DistributorStore;

impl DistributorStore {
    /// Record an observation of a peer device. The first observation stamps
    /// `first`; every one advances `latest` and the counter.
    pub fn presence_upsert(
        &self,
        device: &str,
        operator: Option<&str>,
        channel: Option<&str>,
        address: Option<&str>,
    ) -> CourierResult<()> {
        if device.trim().is_empty() {
            return Err(StoreError::Argument {
                what: "device",
                reason: "must not be empty".to_string(),
            }
            .into());
        }

        let mut wtxn = self.env().write_txn().map_err(schema::txn_err)?;
        let db = self.tables().presence;
        let now = Utc::now();

        let record = match db.get(&wtxn, device.as_bytes()).map_err(schema::txn_err)? {
            Some(bytes) => {
                let mut stored: PresenceRecord = schema::decode(bytes)?;
                stored.latest = now;
                stored.count += 1;
                if operator.is_some() {
                    stored.operator = operator.map(str::to_string);
                }
                if channel.is_some() {
                    stored.channel = channel.map(str::to_string);
                }
                if address.is_some() {
                    stored.address = address.map(str::to_string);
                }
                stored
            }
            None => PresenceRecord {
                device: device.to_string(),
                operator: operator.map(str::to_string),
                first: now,
                latest: now,
                count: 1,
                enable: true,
                channel: channel.map(str::to_string),
                address: address.map(str::to_string),
            },
        };

        db.put(&mut wtxn, device.as_bytes(), &schema::encode(&record)?)
            .map_err(schema::txn_err)?;
        wtxn.commit().map_err(schema::txn_err)?;
        Ok(())
    }

    pub fn presence_by_device(&self, device: &str) -> CourierResult<Option<PresenceRecord>> {
        let rtxn = self.env().read_txn().map_err(schema::txn_err)?;
        Ok(self
            .tables()
            .presence
            .get(&rtxn, device.as_bytes())
            .map_err(schema::txn_err)?
            .map(schema::decode::<PresenceRecord>)
            .transpose()?)
    }

    pub fn presences(&self) -> CourierResult<Vec<PresenceRecord>> {
        let rtxn = self.env().read_txn().map_err(schema::txn_err)?;
        let mut out = Vec::new();
        let iter = self.tables().presence.iter(&rtxn).map_err(schema::txn_err)?;
        for entry in iter {
            let (_, value) = entry.map_err(schema::txn_err)?;
            out.push(schema::decode::<PresenceRecord>(value)?);
        }
        Ok(out)
    }

    /// Record a remote subscription announcement, keyed by its uuid.
    pub fn capability_upsert(&self, record: CapabilityRecord) -> CourierResult<()> {
        if record.topic.trim().is_empty() {
            return Err(StoreError::Argument {
                what: "topic",
                reason: "must not be empty".to_string(),
            }
            .into());
        }

        let mut wtxn = self.env().write_txn().map_err(schema::txn_err)?;
        let db = self.tables().capability;
        let key = record.uuid.as_bytes().to_vec();
        let now = Utc::now();

        let stored = match db.get(&wtxn, &key).map_err(schema::txn_err)? {
            Some(bytes) => {
                let previous: CapabilityRecord = schema::decode(bytes)?;
                let mut next = record;
                next.first = previous.first;
                next.count = previous.count + 1;
                next.latest = now;
                next
            }
            None => {
                let mut next = record;
                next.first = now;
                next.latest = now;
                next.count = 1;
                next
            }
        };

        db.put(&mut wtxn, &key, &schema::encode(&stored)?)
            .map_err(schema::txn_err)?;
        wtxn.commit().map_err(schema::txn_err)?;
        Ok(())
    }

    pub fn capability_by_uuid(&self, uuid: Uuid) -> CourierResult<Option<CapabilityRecord>> {
        let rtxn = self.env().read_txn().map_err(schema::txn_err)?;
        Ok(self
            .tables()
            .capability
            .get(&rtxn, uuid.as_bytes())
            .map_err(schema::txn_err)?
            .map(schema::decode::<CapabilityRecord>)
            .transpose()?)
    }

    pub fn capability_query_by_topic(
        &self,
        topic: &str,
        subtopic: &str,
    ) -> CourierResult<Vec<CapabilityRecord>> {
        let rtxn = self.env().read_txn().map_err(schema::txn_err)?;
        let mut out = Vec::new();
        let iter = self
            .tables()
            .capability
            .iter(&rtxn)
            .map_err(schema::txn_err)?;
        for entry in iter {
            let (_, value) = entry.map_err(schema::txn_err)?;
            let record: CapabilityRecord = schema::decode(value)?;
            if record.topic == topic && record.subtopic == subtopic {
                out.push(record);
            }
        }
        Ok(out)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn open_store() -> (DistributorStore, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let store = DistributorStore::open(dir.path()).expect("open store");
        (store, dir)
    }

    #[test]
    fn test_presence_upsert_advances_latest_and_count() {
        let (store, _dir) = open_store();

        store
            .presence_upsert("device-7", Some("cpl.doe"), Some("multicast"), None)
            .expect("first observation");
        let first = store
            .presence_by_device("device-7")
            .expect("query")
            .expect("found");
        assert_eq!(first.count, 1);
        assert_eq!(first.first, first.latest);
        assert!(first.enable);

        store
            .presence_upsert("device-7", None, None, Some("10.0.0.7"))
            .expect("second observation");
        let second = store
            .presence_by_device("device-7")
            .expect("query")
            .expect("found");
        assert_eq!(second.count, 2);
        assert_eq!(second.first, first.first, "first-seen stamp survives");
        assert!(second.latest >= first.latest);
        assert_eq!(
            second.operator.as_deref(),
            Some("cpl.doe"),
            "absent fields leave stored values alone"
        );
        assert_eq!(second.address.as_deref(), Some("10.0.0.7"));
    }

    #[test]
    fn test_presence_requires_a_device() {
        let (store, _dir) = open_store();
        assert!(store.presence_upsert("  ", None, None, None).is_err());
        assert!(store.presences().expect("query").is_empty());
    }

    #[test]
    fn test_capability_upsert_is_keyed_by_uuid() {
        let (store, _dir) = open_store();
        let expiration = Utc::now() + Duration::hours(2);
        let record = CapabilityRecord::new(
            uuid::Uuid::now_v7(),
            "status.position",
            "blue",
            "p://tracks",
            "device-9",
            expiration,
        );
        let key = record.uuid;

        store.capability_upsert(record.clone()).expect("first");
        store.capability_upsert(record).expect("second");

        let stored = store
            .capability_by_uuid(key)
            .expect("query")
            .expect("found");
        assert_eq!(stored.count, 2);

        let matches = store
            .capability_query_by_topic("status.position", "blue")
            .expect("query");
        assert_eq!(matches.len(), 1);
        assert!(store
            .capability_query_by_topic("status.position", "red")
            .expect("query")
            .is_empty());
    }
}
