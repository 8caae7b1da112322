//! # In-Process Document Store
//!
//! [`MemoryStore`] keeps documents in a map and implements the server side
//! of the habitat database that the uploader relies on, most importantly the
//! `payload_telemetry/add_listener` update handler that merges one receiver's
//! observation into a shared telemetry document.
//!
//! Used when the listener runs offline and by the tests. Failures can be
//! queued with [`MemoryStore::fail_next_update`] to simulate contention.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::store::{DocumentStore, StoreError, ViewOptions};
use super::{ADD_LISTENER_UPDATE, PAYLOAD_TELEMETRY_DESIGN};

#[derive(Debug, Default)]
struct Inner {
    docs: HashMap<String, Value>,
    views: HashMap<(String, String), Value>,
    update_failures: VecDeque<StoreError>,
    update_attempts: usize,
    next_uuid: u64,
    next_rev: u64,
}

/// Thread-safe in-memory document store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `update_put` fail with `error` instead of running
    ///
    /// Queued failures are consumed in order, one per attempt.
    pub fn fail_next_update(&self, error: StoreError) {
        self.lock().update_failures.push_back(error);
    }

    /// Serve `response` for the view `design/view_name`
    pub fn set_view(&self, design: &str, view_name: &str, response: Value) {
        self.lock()
            .views
            .insert((design.to_string(), view_name.to_string()), response);
    }

    /// Number of `update_put` calls seen, failed or not
    pub fn update_attempts(&self) -> usize {
        self.lock().update_attempts
    }

    /// Snapshot of a stored document
    pub fn document(&self, doc_id: &str) -> Option<Value> {
        self.lock().docs.get(doc_id).cloned()
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.lock().docs.len()
    }

    /// Is the store empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Every write completes before the guard drops
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn allocate_uuid(&mut self) -> String {
        self.next_uuid += 1;
        format!("{:032x}", self.next_uuid)
    }

    fn store(&mut self, doc_id: &str, mut doc: Value) -> Result<String, StoreError> {
        let current_rev = self
            .docs
            .get(doc_id)
            .and_then(|d| d.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let Some(obj) = doc.as_object_mut() else {
            return Err(StoreError::Http {
                status: 400,
                body: "document must be an object".to_string(),
            });
        };

        let given_rev = obj.get("_rev").and_then(Value::as_str).map(str::to_string);
        if given_rev != current_rev {
            return Err(StoreError::Conflict(doc_id.to_string()));
        }

        let generation = current_rev
            .as_deref()
            .and_then(|r| r.split('-').next())
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        self.next_rev += 1;
        let rev = format!("{}-{:08x}", generation, self.next_rev);

        obj.insert("_id".into(), Value::String(doc_id.to_string()));
        obj.insert("_rev".into(), Value::String(rev.clone()));
        self.docs.insert(doc_id.to_string(), doc);

        Ok(rev)
    }

    /// Server side merge of `{data: {_raw}, receivers: {callsign: info}}`
    fn add_listener(&mut self, doc_id: &str, payload: &Value) -> Result<String, StoreError> {
        let bad_request = |msg: &str| StoreError::Http {
            status: 400,
            body: msg.to_string(),
        };

        let raw = payload
            .pointer("/data/_raw")
            .and_then(Value::as_str)
            .ok_or_else(|| bad_request("missing data._raw"))?;
        let receivers = payload
            .get("receivers")
            .and_then(Value::as_object)
            .filter(|r| r.len() == 1)
            .ok_or_else(|| bad_request("exactly one receiver required"))?;

        let mut doc = match self.docs.get(doc_id) {
            Some(existing) => {
                if existing.pointer("/data/_raw").and_then(Value::as_str) != Some(raw) {
                    return Err(StoreError::Forbidden { status: 403 });
                }
                existing.clone()
            }
            None => json!({
                "type": "payload_telemetry",
                "data": {"_raw": raw},
                "receivers": {},
            }),
        };

        if !doc.get("receivers").is_some_and(Value::is_object) {
            doc["receivers"] = Value::Object(Map::new());
        }
        if let Some(existing) = doc["receivers"].as_object_mut() {
            for (callsign, info) in receivers {
                existing.insert(callsign.clone(), info.clone());
            }
        }

        self.store(doc_id, doc)?;
        Ok("OK".to_string())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_doc(&self, doc_id: &str) -> Result<Value, StoreError> {
        self.lock()
            .docs
            .get(doc_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))
    }

    async fn put_doc(&self, doc_id: &str, doc: &Value) -> Result<String, StoreError> {
        self.lock().store(doc_id, doc.clone())
    }

    async fn save_doc(&self, doc: &Value) -> Result<String, StoreError> {
        let mut inner = self.lock();
        let doc_id = match doc.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => inner.allocate_uuid(),
        };
        inner.store(&doc_id, doc.clone())?;
        Ok(doc_id)
    }

    async fn update_put(
        &self,
        design: &str,
        update_name: &str,
        doc_id: &str,
        payload: &Value,
    ) -> Result<String, StoreError> {
        let mut inner = self.lock();
        inner.update_attempts += 1;

        if let Some(error) = inner.update_failures.pop_front() {
            debug!("MemoryStore: forced failure for {}: {}", doc_id, error);
            return Err(error);
        }

        if design == PAYLOAD_TELEMETRY_DESIGN && update_name == ADD_LISTENER_UPDATE {
            inner.add_listener(doc_id, payload)
        } else {
            Err(StoreError::Http {
                status: 404,
                body: format!("missing update handler {}/{}", design, update_name),
            })
        }
    }

    async fn view(
        &self,
        design: &str,
        view_name: &str,
        _options: &ViewOptions,
    ) -> Result<Value, StoreError> {
        self.lock()
            .views
            .get(&(design.to_string(), view_name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("_design/{}/_view/{}", design, view_name)))
    }
}
