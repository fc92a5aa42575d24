//! Session-scoped key/value storage and the record layout inside it

use super::{ProcessingPhase, SessionRecord};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;

pub const KEY_BROWSER_DATA: &str = "fpBrowserData";
pub const KEY_COLLECT_LATENCY: &str = "fpCollectLatency";
pub const KEY_LOAD_LATENCY: &str = "fpLoadLatency";
pub const KEY_TOTAL_LATENCY: &str = "fpTotalLatency";
pub const KEY_PROCESSING_PHASE: &str = "fpProcessingPhase";
/// Store plus identify, both measured by the client
pub const KEY_BACKEND_LATENCY: &str = "fpBackendLatency";
/// Client round trip of the store call; the relay's own timing is not persisted
pub const KEY_STORAGE_LATENCY: &str = "fpStorageLatency";
pub const KEY_IDENTIFICATION_LATENCY: &str = "fpIdentificationLatency";
pub const KEY_VISITOR_ID: &str = "fpVisitorId";

/// Every key the session writes; reset removes all of them
pub const SESSION_KEYS: [&str; 9] = [
    KEY_BROWSER_DATA,
    KEY_COLLECT_LATENCY,
    KEY_LOAD_LATENCY,
    KEY_TOTAL_LATENCY,
    KEY_PROCESSING_PHASE,
    KEY_BACKEND_LATENCY,
    KEY_STORAGE_LATENCY,
    KEY_IDENTIFICATION_LATENCY,
    KEY_VISITOR_ID,
];

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Session storage unavailable: {0}")]
    Unavailable(String),
}

/// String key/value storage that lives as long as the browsing session
pub trait SessionStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

/// In-process storage; clones share the same map
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.entries
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?
            .remove(key);
        Ok(())
    }
}

// Storage failures never interrupt the flow; they are logged and the session
// carries on with whatever it has in memory.

fn read(storage: &dyn SessionStorage, key: &str) -> Option<String> {
    storage
        .get(key)
        .map_err(|e| warn!(key, error = %e, "Failed to read session storage"))
        .ok()
        .flatten()
}

fn read_latency(storage: &dyn SessionStorage, key: &str) -> Option<f64> {
    read(storage, key).and_then(|v| v.parse().ok())
}

fn write(storage: &dyn SessionStorage, key: &str, value: Option<String>) {
    let Some(value) = value else { return };
    if let Err(e) = storage.set(key, &value) {
        warn!(key, error = %e, "Failed to write session storage");
    }
}

/// Rebuild the persisted record and phase, if any were stored
pub fn load_record(storage: &dyn SessionStorage) -> (SessionRecord, ProcessingPhase) {
    let record = SessionRecord {
        signal_payload: read(storage, KEY_BROWSER_DATA)
            .map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw))),
        collect_latency_ms: read_latency(storage, KEY_COLLECT_LATENCY),
        load_latency_ms: read_latency(storage, KEY_LOAD_LATENCY),
        total_latency_ms: read_latency(storage, KEY_TOTAL_LATENCY),
        backend_storage_latency_ms: read_latency(storage, KEY_STORAGE_LATENCY),
        identification_latency_ms: read_latency(storage, KEY_IDENTIFICATION_LATENCY),
        backend_latency_ms: read_latency(storage, KEY_BACKEND_LATENCY),
        visitor_id: read(storage, KEY_VISITOR_ID),
        ..SessionRecord::default()
    };

    let phase = read(storage, KEY_PROCESSING_PHASE)
        .and_then(|p| p.parse().ok())
        .unwrap_or_default();

    (record, phase)
}

/// Write every populated field of `record` along with the settled `phase`
pub fn persist_record(storage: &dyn SessionStorage, record: &SessionRecord, phase: ProcessingPhase) {
    let latency = |v: Option<f64>| v.map(|ms| ms.to_string());

    write(
        storage,
        KEY_BROWSER_DATA,
        record.signal_payload.as_ref().map(Value::to_string),
    );
    write(storage, KEY_COLLECT_LATENCY, latency(record.collect_latency_ms));
    write(storage, KEY_LOAD_LATENCY, latency(record.load_latency_ms));
    write(storage, KEY_TOTAL_LATENCY, latency(record.total_latency_ms));
    write(storage, KEY_STORAGE_LATENCY, latency(record.backend_storage_latency_ms));
    write(
        storage,
        KEY_IDENTIFICATION_LATENCY,
        latency(record.identification_latency_ms),
    );
    write(storage, KEY_BACKEND_LATENCY, latency(record.backend_latency_ms));
    write(storage, KEY_VISITOR_ID, record.visitor_id.clone());
    write(storage, KEY_PROCESSING_PHASE, Some(phase.to_string()));
}

pub fn clear_record(storage: &dyn SessionStorage) {
    for key in SESSION_KEYS {
        if let Err(e) = storage.remove(key) {
            warn!(key, error = %e, "Failed to clear session storage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Storage that fails every operation
    struct BrokenStorage;

    impl SessionStorage for BrokenStorage {
        fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("disabled".to_string()))
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disabled".to_string()))
        }
        fn remove(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disabled".to_string()))
        }
    }

    #[test]
    fn test_persist_then_load() {
        let storage = MemoryStorage::new();
        let record = SessionRecord {
            signal_payload: Some(json!({ "s": [1, 2] })),
            collect_latency_ms: Some(12.5),
            load_latency_ms: Some(40.0),
            total_latency_ms: Some(52.5),
            backend_storage_latency_ms: Some(3.25),
            visitor_id: Some("v-1".to_string()),
            ..SessionRecord::default()
        };

        persist_record(&storage, &record, ProcessingPhase::Stored);
        let (loaded, phase) = load_record(&storage);

        assert_eq!(phase, ProcessingPhase::Stored);
        assert_eq!(loaded.signal_payload, record.signal_payload);
        assert_eq!(loaded.collect_latency_ms, Some(12.5));
        assert_eq!(loaded.backend_storage_latency_ms, Some(3.25));
        assert_eq!(loaded.visitor_id.as_deref(), Some("v-1"));
        assert!(loaded.identification_latency_ms.is_none());
    }

    #[test]
    fn test_raw_string_payload_is_kept() {
        let storage = MemoryStorage::new();
        storage.set(KEY_BROWSER_DATA, "not json at all").unwrap();
        let (loaded, phase) = load_record(&storage);
        assert_eq!(loaded.signal_payload, Some(json!("not json at all")));
        assert_eq!(phase, ProcessingPhase::Initial);
    }

    #[test]
    fn test_clear_removes_every_key() {
        let storage = MemoryStorage::new();
        for key in SESSION_KEYS {
            storage.set(key, "1").unwrap();
        }
        storage.set("unrelated", "kept").unwrap();

        clear_record(&storage);

        for key in SESSION_KEYS {
            assert!(storage.get(key).unwrap().is_none());
        }
        assert_eq!(storage.get("unrelated").unwrap().as_deref(), Some("kept"));
    }

    #[test]
    fn test_broken_storage_is_non_fatal() {
        let record = SessionRecord {
            collect_latency_ms: Some(1.0),
            ..SessionRecord::default()
        };
        persist_record(&BrokenStorage, &record, ProcessingPhase::Processing);
        clear_record(&BrokenStorage);
        let (loaded, phase) = load_record(&BrokenStorage);
        assert_eq!(loaded, SessionRecord::default());
        assert_eq!(phase, ProcessingPhase::Initial);
    }
}
