//! Per-device status records
//!
//! Records are keyed by `"{type}/{id}"` and hold whatever fields the device last
//! reported. Updates merge into the existing record. A record that has not been
//! refreshed within the staleness window is dropped by the periodic sweep; a missing
//! record means "unknown", not "offline".

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use super::registry::{DispatchError, Handler};
use crate::mqtt::topics;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceStatus {
    pub fields: Map<String, Value>,
    /// Monotonic time of the last update, used for expiry
    pub updated_at: Instant,
    /// Wall-clock time of the last update, for display
    pub received_at: DateTime<Local>,
}

impl DeviceStatus {
    pub fn online(&self) -> Option<bool> {
        self.fields.get("online").and_then(Value::as_bool)
    }

    pub fn current_temperature(&self) -> Option<f64> {
        self.fields.get("temperaturaAtual").and_then(Value::as_f64)
    }

    pub fn error(&self) -> Option<&str> {
        self.fields.get("error").and_then(Value::as_str)
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.updated_at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Updated { key: String, status: DeviceStatus },
    Expired { key: String },
}

/// Shared status map; clones see the same records
#[derive(Debug, Clone)]
pub struct DeviceStatusStore {
    records: Arc<RwLock<HashMap<String, DeviceStatus>>>,
    updates: broadcast::Sender<StatusUpdate>,
}

impl Default for DeviceStatusStore {
    fn default() -> Self {
        Self::new(256)
    }
}

impl DeviceStatusStore {
    pub fn new(update_capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(update_capacity.max(1));
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            updates,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, DeviceStatus>> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, DeviceStatus>> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Feed of record changes, e.g. for pushing to dashboards
    pub fn updates(&self) -> broadcast::Receiver<StatusUpdate> {
        self.updates.subscribe()
    }

    pub fn merge(&self, key: &str, fields: Map<String, Value>) -> DeviceStatus {
        self.merge_at(key, fields, Instant::now())
    }

    /// Overlays `fields` onto the record; fields not present keep their value
    pub fn merge_at(&self, key: &str, fields: Map<String, Value>, now: Instant) -> DeviceStatus {
        let status = {
            let mut records = self.write();
            let record = records
                .entry(key.to_string())
                .or_insert_with(|| DeviceStatus {
                    fields: Map::new(),
                    updated_at: now,
                    received_at: Local::now(),
                });
            record.fields.extend(fields);
            record.updated_at = now;
            record.received_at = Local::now();
            record.clone()
        };

        debug!(key, "Device status updated");
        let _ = self.updates.send(StatusUpdate::Updated {
            key: key.to_string(),
            status: status.clone(),
        });
        status
    }

    pub fn sweep(&self, window: Duration) -> Vec<String> {
        self.sweep_at(window, Instant::now())
    }

    /// Removes records last updated more than `window` before `now`
    pub fn sweep_at(&self, window: Duration, now: Instant) -> Vec<String> {
        let expired: Vec<String> = {
            let mut records = self.write();
            let expired: Vec<String> = records
                .iter()
                .filter(|(_, status)| status.age(now) > window)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &expired {
                records.remove(key);
            }
            expired
        };

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired stale device status records");
        }
        for key in &expired {
            let _ = self.updates.send(StatusUpdate::Expired { key: key.clone() });
        }
        expired
    }

    pub fn get(&self, key: &str) -> Option<DeviceStatus> {
        self.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, DeviceStatus> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Handler that merges JSON object payloads into `store` under the topic's device key
pub fn status_handler(store: DeviceStatusStore) -> Handler {
    Arc::new(move |payload: &str, topic: &str| {
        let key = topics::device_key(topic).ok_or_else(|| DispatchError::Topic(topic.into()))?;
        let value: Value =
            serde_json::from_str(payload).map_err(|source| DispatchError::Payload {
                topic: topic.to_string(),
                source,
            })?;
        let Value::Object(fields) = value else {
            return Err(DispatchError::NotAnObject(topic.to_string()));
        };
        store.merge(&key, fields);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn updates_merge_without_dropping_fields() {
        let store = DeviceStatusStore::default();
        store.merge("split/7", object(json!({ "temperaturaAtual": 24 })));
        let status = store.merge("split/7", object(json!({ "online": true })));

        assert_eq!(status.current_temperature(), Some(24.0));
        assert_eq!(status.online(), Some(true));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn newer_values_overwrite_older_ones() {
        let store = DeviceStatusStore::default();
        store.merge("split/7", object(json!({ "online": true, "error": "IR" })));
        store.merge("split/7", object(json!({ "online": false })));

        let status = store.get("split/7").unwrap();
        assert_eq!(status.online(), Some(false));
        assert_eq!(status.error(), Some("IR"));
    }

    #[test]
    fn sweep_removes_only_records_past_the_window() {
        let store = DeviceStatusStore::default();
        let start = Instant::now();
        store.merge_at("split/old", object(json!({ "online": true })), start);
        store.merge_at(
            "split/recent",
            object(json!({ "online": true })),
            start + Duration::from_secs(11),
        );

        let now = start + Duration::from_secs(301);
        let expired = store.sweep_at(Duration::from_secs(300), now);

        assert_eq!(expired, vec!["split/old".to_string()]);
        assert!(store.get("split/old").is_none());
        assert!(store.get("split/recent").is_some());
    }

    #[test]
    fn record_exactly_at_the_window_survives() {
        let store = DeviceStatusStore::default();
        let start = Instant::now();
        store.merge_at("split/7", Map::new(), start);
        assert!(store
            .sweep_at(Duration::from_secs(300), start + Duration::from_secs(300))
            .is_empty());
    }

    #[test]
    fn changes_are_announced() {
        let store = DeviceStatusStore::default();
        let mut updates = store.updates();
        let start = Instant::now();
        store.merge_at("split/7", object(json!({ "online": true })), start);
        store.sweep_at(Duration::from_secs(300), start + Duration::from_secs(400));

        assert!(matches!(
            updates.try_recv(),
            Ok(StatusUpdate::Updated { key, .. }) if key == "split/7"
        ));
        assert_eq!(
            updates.try_recv(),
            Ok(StatusUpdate::Expired { key: "split/7".into() })
        );
    }

    #[test]
    fn status_handler_keys_by_type_and_id() {
        let store = DeviceStatusStore::default();
        let handler = status_handler(store.clone());

        handler(r#"{"online":true}"#, "ac-control/split/7/status").unwrap();
        assert_eq!(store.get("split/7").unwrap().online(), Some(true));

        assert!(matches!(
            handler("{not json", "ac-control/split/7/status"),
            Err(DispatchError::Payload { .. })
        ));
        assert!(matches!(
            handler("[1,2]", "ac-control/split/7/status"),
            Err(DispatchError::NotAnObject(_))
        ));
        assert!(matches!(
            handler("{}", "ac-control"),
            Err(DispatchError::Topic(_))
        ));
        assert_eq!(store.len(), 1);
    }
}
