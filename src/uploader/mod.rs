//! # Uploader Module
//!
//! Uploads telemetry and listener documents to the habitat database.
//!
//! This module handles:
//! - Content addressing raw telemetry (base64 + SHA-256)
//! - Merging this receiver's observation into the shared telemetry document,
//!   retrying on write conflicts
//! - Listener information / telemetry documents, and stamping telemetry with
//!   the latest of each
//! - Payload configuration and flight queries
//!
//! ## Concurrency
//!
//! `payload_telemetry`, `listener_telemetry` and `listener_information` hold
//! one lock for their whole duration, so they never interleave on the same
//! [`Uploader`]. Share it between tasks with an `Arc`.

pub mod address;
pub mod couchdb;
pub mod memory;
pub mod store;

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{HabitatError, Result};
use crate::rfc3339;
use couchdb::json_query_value;
use store::{DocumentStore, StoreError, ViewOptions};

/// Default number of merge attempts before giving up
pub const DEFAULT_MAX_MERGE_ATTEMPTS: usize = 20;

/// Design document holding the telemetry update handler
pub const PAYLOAD_TELEMETRY_DESIGN: &str = "payload_telemetry";

/// Update handler merging a receiver into a telemetry document
pub const ADD_LISTENER_UPDATE: &str = "add_listener";

/// Keys the uploader writes itself; callers may not supply them
pub const RESERVED_METADATA_KEYS: [&str; 4] = [
    "time_created",
    "time_uploaded",
    "latest_listener_information",
    "latest_listener_telemetry",
];

/// Kinds of listener document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerDocType {
    Information,
    Telemetry,
}

impl ListenerDocType {
    /// Value of the document's `type` key
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Information => "listener_information",
            Self::Telemetry => "listener_telemetry",
        }
    }
}

/// Ids of the most recently uploaded listener documents
#[derive(Debug, Default)]
struct LatestListenerDocs {
    information: Option<String>,
    telemetry: Option<String>,
}

/// Habitat uploader for one receiving station
pub struct Uploader {
    callsign: String,
    store: Arc<dyn DocumentStore>,
    max_merge_attempts: usize,
    latest: Mutex<LatestListenerDocs>,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("callsign", &self.callsign)
            .field("max_merge_attempts", &self.max_merge_attempts)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    /// Create an uploader with the default merge attempt limit
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `callsign` is empty.
    pub fn new(callsign: impl Into<String>, store: Arc<dyn DocumentStore>) -> Result<Self> {
        Self::with_max_merge_attempts(callsign, store, DEFAULT_MAX_MERGE_ATTEMPTS)
    }

    /// Create an uploader giving up after `max_merge_attempts` conflicts
    pub fn with_max_merge_attempts(
        callsign: impl Into<String>,
        store: Arc<dyn DocumentStore>,
        max_merge_attempts: usize,
    ) -> Result<Self> {
        let callsign = callsign.into();

        if callsign.is_empty() {
            return Err(HabitatError::InvalidArgument(
                "Callsign of zero length".to_string(),
            ));
        }

        if max_merge_attempts == 0 {
            return Err(HabitatError::InvalidArgument(
                "max_merge_attempts must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            callsign,
            store,
            max_merge_attempts,
            latest: Mutex::new(LatestListenerDocs::default()),
        })
    }

    /// This station's callsign
    pub fn callsign(&self) -> &str {
        &self.callsign
    }

    /// Merge attempt limit
    pub fn max_merge_attempts(&self) -> usize {
        self.max_merge_attempts
    }

    /// Upload raw telemetry heard by this station
    ///
    /// # Arguments
    ///
    /// * `raw` - Sentence exactly as received
    /// * `metadata` - Extra receiver information (object), or `None`
    /// * `time_created` - When it was received; defaults to now
    ///
    /// # Returns
    ///
    /// * `Result<String>` - Document id, identical for every receiver of the
    ///   same bytes
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for empty telemetry or bad metadata
    /// - `Unmergeable` once every attempt hit a write conflict
    /// - `Rejected` if the store refused the write outright
    pub async fn payload_telemetry(
        &self,
        raw: &[u8],
        metadata: Option<&Value>,
        time_created: Option<i64>,
    ) -> Result<String> {
        let latest = self.latest.lock().await;

        if raw.is_empty() {
            return Err(HabitatError::InvalidArgument(
                "Can't upload string of zero length".to_string(),
            ));
        }

        let (payload, doc_id) = address::address(raw);
        let time_created = time_created.unwrap_or_else(rfc3339::now);

        let mut receiver_info = match metadata {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(meta)) => {
                if let Some(key) = RESERVED_METADATA_KEYS.iter().find(|k| meta.contains_key(**k)) {
                    return Err(HabitatError::InvalidArgument(format!(
                        "found forbidden key in metadata: {}",
                        key
                    )));
                }
                meta.clone()
            }
            Some(_) => {
                return Err(HabitatError::InvalidArgument(
                    "metadata must be an object/dict or null".to_string(),
                ))
            }
        };

        if let Some(id) = &latest.information {
            receiver_info.insert("latest_listener_information".into(), json!(id));
        }
        if let Some(id) = &latest.telemetry {
            receiver_info.insert("latest_listener_telemetry".into(), json!(id));
        }

        for attempt in 1..=self.max_merge_attempts {
            set_time(&mut receiver_info, time_created)?;

            let doc = json!({
                "data": {"_raw": payload},
                "receivers": {self.callsign.as_str(): receiver_info},
            });

            match self
                .store
                .update_put(PAYLOAD_TELEMETRY_DESIGN, ADD_LISTENER_UPDATE, &doc_id, &doc)
                .await
            {
                Ok(_) => {
                    info!("Uploaded payload telemetry {}", doc_id);
                    return Ok(doc_id);
                }
                Err(StoreError::Conflict(_)) => {
                    debug!(
                        "Conflict merging {} (attempt {}/{})",
                        doc_id, attempt, self.max_merge_attempts
                    );
                }
                Err(e @ StoreError::Forbidden { .. }) => {
                    warn!("Payload telemetry {} rejected: {}", doc_id, e);
                    return Err(HabitatError::Rejected(e));
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            "Giving up on {} after {} conflicts",
            doc_id, self.max_merge_attempts
        );
        Err(HabitatError::Unmergeable {
            attempts: self.max_merge_attempts,
        })
    }

    /// Upload a listener telemetry document (e.g. station position)
    ///
    /// Subsequent telemetry uploads reference the returned id.
    pub async fn listener_telemetry(&self, data: &Value, time_created: Option<i64>) -> Result<String> {
        let mut latest = self.latest.lock().await;
        let id = self
            .listener_doc(ListenerDocType::Telemetry, data, time_created)
            .await?;
        latest.telemetry = Some(id.clone());
        Ok(id)
    }

    /// Upload a listener information document (e.g. radio, antenna)
    ///
    /// Subsequent telemetry uploads reference the returned id.
    pub async fn listener_information(&self, data: &Value, time_created: Option<i64>) -> Result<String> {
        let mut latest = self.latest.lock().await;
        let id = self
            .listener_doc(ListenerDocType::Information, data, time_created)
            .await?;
        latest.information = Some(id.clone());
        Ok(id)
    }

    /// Id of the latest listener telemetry document uploaded
    pub async fn latest_listener_telemetry(&self) -> Option<String> {
        self.latest.lock().await.telemetry.clone()
    }

    /// Id of the latest listener information document uploaded
    pub async fn latest_listener_information(&self) -> Option<String> {
        self.latest.lock().await.information.clone()
    }

    async fn listener_doc(
        &self,
        doc_type: ListenerDocType,
        data: &Value,
        time_created: Option<i64>,
    ) -> Result<String> {
        let time_created = time_created.unwrap_or_else(rfc3339::now);

        let Some(fields) = data.as_object() else {
            return Err(HabitatError::InvalidArgument(
                "data must be an object/dict".to_string(),
            ));
        };

        if fields.contains_key("callsign") {
            return Err(HabitatError::InvalidArgument(
                "forbidden key in data: callsign".to_string(),
            ));
        }

        let mut copied = fields.clone();
        copied.insert("callsign".into(), json!(self.callsign));

        let mut doc = Map::new();
        doc.insert("type".into(), json!(doc_type.type_name()));
        doc.insert("data".into(), Value::Object(copied));
        set_time(&mut doc, time_created)?;

        let id = self.store.save_doc(&Value::Object(doc)).await?;
        info!("Uploaded {} {}", doc_type.type_name(), id);
        Ok(id)
    }

    /// All payload configuration documents
    pub async fn payloads(&self) -> Result<Vec<Value>> {
        let options: ViewOptions = vec![("include_docs".into(), "true".into())];
        let response = self
            .store
            .view("payload_configuration", "name_time_created", &options)
            .await?;

        view_rows(&response)?
            .iter()
            .map(|row| {
                row.as_object()
                    .map(|r| r.get("doc").cloned().unwrap_or(Value::Null))
                    .ok_or_else(|| invalid_response("doc was not an object"))
            })
            .collect()
    }

    /// Flights that have not ended yet, each with its payload configurations
    /// under `_payload_docs`
    pub async fn flights(&self) -> Result<Vec<Value>> {
        let options: ViewOptions = vec![
            ("include_docs".into(), "true".into()),
            ("startkey".into(), json_query_value(&json!([rfc3339::now()]))),
        ];
        let response = self
            .store
            .view("flight", "end_start_including_payloads", &options)
            .await?;

        group_flights(view_rows(&response)?)
    }
}

/// Stamp `time_created` and a fresh `time_uploaded`
fn set_time(thing: &mut Map<String, Value>, time_created: i64) -> Result<()> {
    thing.insert(
        "time_uploaded".into(),
        json!(rfc3339::now_to_rfc3339_localoffset()),
    );
    thing.insert(
        "time_created".into(),
        json!(rfc3339::timestamp_to_rfc3339_localoffset(time_created)?),
    );
    Ok(())
}

fn view_rows(response: &Value) -> Result<&Vec<Value>> {
    if !response.is_object() {
        return Err(invalid_response("was not an object"));
    }

    response
        .get("rows")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid_response("rows was not an array"))
}

/// Fold `[end, start, flight_id, is_pcfg]` rows into flight documents
fn group_flights(rows: &[Value]) -> Result<Vec<Value>> {
    let mut flights: Vec<Value> = Vec::with_capacity(rows.len());

    for row in rows {
        let Some(row) = row.as_object() else {
            return Err(invalid_response("row was not an object"));
        };

        let is_pcfg = match row.get("key").and_then(Value::as_array) {
            Some(key) if key.len() == 4 => match &key[3] {
                Value::Bool(b) => *b,
                Value::Number(n) if n.is_i64() || n.is_u64() => n.as_i64() != Some(0),
                _ => return Err(invalid_response("bad key in row")),
            },
            _ => return Err(invalid_response("bad key in row")),
        };

        let doc = row
            .get("doc")
            .and_then(Value::as_object)
            .filter(|d| !d.is_empty());

        if !is_pcfg {
            let Some(doc) = doc else {
                return Err(invalid_response("bad doc in row"));
            };

            let mut flight = doc.clone();
            flight.insert("_payload_docs".into(), Value::Array(Vec::new()));
            flights.push(Value::Object(flight));
        } else if let Some(doc) = doc {
            let current = flights
                .last_mut()
                .and_then(|f| f.get_mut("_payload_docs"))
                .and_then(Value::as_array_mut)
                .ok_or_else(|| invalid_response("payload row before any flight"))?;
            current.push(Value::Object(doc.clone()));
        }
    }

    Ok(flights)
}

fn invalid_response(msg: &str) -> HabitatError {
    HabitatError::Store(StoreError::InvalidResponse(format!("Invalid response: {}", msg)))
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::store::MockDocumentStore;
    use super::*;

    const RAW: &[u8] = b"$$CALL,1,2.5,3*05\n";

    fn memory_uploader(callsign: &str) -> (Arc<MemoryStore>, Uploader) {
        let store = Arc::new(MemoryStore::new());
        let uploader = Uploader::new(callsign, store.clone()).unwrap();
        (store, uploader)
    }

    #[test]
    fn test_new_rejects_empty_callsign() {
        let store = Arc::new(MemoryStore::new());
        assert!(matches!(
            Uploader::new("", store.clone()),
            Err(HabitatError::InvalidArgument(_))
        ));
        assert!(matches!(
            Uploader::with_max_merge_attempts("CALL", store, 0),
            Err(HabitatError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_payload_telemetry_simple() {
        let (store, uploader) = memory_uploader("LISTENER");
        let meta = json!({"frequency": 434.075});

        let doc_id = uploader
            .payload_telemetry(RAW, Some(&meta), Some(1_300_000_000))
            .await
            .unwrap();

        assert_eq!(doc_id, address::id_for(&address::encode_raw(RAW)));

        let doc = store.document(&doc_id).unwrap();
        assert_eq!(doc["data"]["_raw"], json!(address::encode_raw(RAW)));

        let receiver = &doc["receivers"]["LISTENER"];
        assert_eq!(receiver["frequency"], json!(434.075));
        assert_eq!(
            rfc3339::rfc3339_to_timestamp(receiver["time_created"].as_str().unwrap()).unwrap(),
            1_300_000_000
        );
        assert!(rfc3339::validate_rfc3339(receiver["time_uploaded"].as_str().unwrap()));
        assert!(receiver.get("latest_listener_information").is_none());
        assert!(receiver.get("latest_listener_telemetry").is_none());
    }

    #[tokio::test]
    async fn test_payload_telemetry_rejects_bad_arguments() {
        let (store, uploader) = memory_uploader("LISTENER");

        assert!(matches!(
            uploader.payload_telemetry(b"", None, None).await,
            Err(HabitatError::InvalidArgument(_))
        ));

        for key in RESERVED_METADATA_KEYS {
            let meta = json!({ key: "x" });
            assert!(matches!(
                uploader.payload_telemetry(RAW, Some(&meta), None).await,
                Err(HabitatError::InvalidArgument(_))
            ));
        }

        assert!(matches!(
            uploader.payload_telemetry(RAW, Some(&json!([1, 2])), None).await,
            Err(HabitatError::InvalidArgument(_))
        ));

        assert_eq!(store.update_attempts(), 0);
    }

    #[tokio::test]
    async fn test_payload_telemetry_retries_conflicts() {
        let (store, uploader) = memory_uploader("LISTENER");
        for _ in 0..3 {
            store.fail_next_update(StoreError::Conflict("x".into()));
        }

        let doc_id = uploader.payload_telemetry(RAW, None, None).await.unwrap();

        assert_eq!(store.update_attempts(), 4);
        assert!(store.document(&doc_id).unwrap()["receivers"]["LISTENER"].is_object());
    }

    #[tokio::test]
    async fn test_payload_telemetry_gives_up_after_max_attempts() {
        let mut mock = MockDocumentStore::new();
        mock.expect_update_put()
            .times(DEFAULT_MAX_MERGE_ATTEMPTS)
            .returning(|_, _, doc_id, _| Err(StoreError::Conflict(doc_id.to_string())));

        let uploader = Uploader::new("LISTENER", Arc::new(mock)).unwrap();

        match uploader.payload_telemetry(RAW, None, None).await {
            Err(HabitatError::Unmergeable { attempts }) => {
                assert_eq!(attempts, DEFAULT_MAX_MERGE_ATTEMPTS)
            }
            other => panic!("Expected Unmergeable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_payload_telemetry_custom_attempt_limit() {
        let (store, _) = memory_uploader("LISTENER");
        let uploader = Uploader::with_max_merge_attempts("LISTENER", store.clone(), 3).unwrap();
        for _ in 0..5 {
            store.fail_next_update(StoreError::Conflict("x".into()));
        }

        let result = uploader.payload_telemetry(RAW, None, None).await;

        assert!(matches!(result, Err(HabitatError::Unmergeable { attempts: 3 })));
        assert_eq!(store.update_attempts(), 3);
    }

    #[tokio::test]
    async fn test_payload_telemetry_does_not_retry_forbidden() {
        for status in [401u16, 403] {
            let mut mock = MockDocumentStore::new();
            mock.expect_update_put()
                .times(1)
                .returning(move |_, _, _, _| Err(StoreError::Forbidden { status }));

            let uploader = Uploader::new("LISTENER", Arc::new(mock)).unwrap();

            match uploader.payload_telemetry(RAW, None, None).await {
                Err(HabitatError::Rejected(StoreError::Forbidden { status: s })) => {
                    assert_eq!(s, status)
                }
                other => panic!("Expected Rejected, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_payload_telemetry_propagates_other_errors() {
        let mut mock = MockDocumentStore::new();
        mock.expect_update_put().times(1).returning(|_, _, _, _| {
            Err(StoreError::Http {
                status: 500,
                body: "oops".into(),
            })
        });

        let uploader = Uploader::new("LISTENER", Arc::new(mock)).unwrap();

        assert!(matches!(
            uploader.payload_telemetry(RAW, None, None).await,
            Err(HabitatError::Store(StoreError::Http { status: 500, .. }))
        ));
    }

    #[tokio::test]
    async fn test_payload_telemetry_sends_add_listener_update() {
        let expected_id = address::id_for(&address::encode_raw(RAW));
        let id_for_check = expected_id.clone();

        let mut mock = MockDocumentStore::new();
        mock.expect_update_put()
            .withf(move |design, update, doc_id, payload| {
                design == PAYLOAD_TELEMETRY_DESIGN
                    && update == ADD_LISTENER_UPDATE
                    && doc_id == id_for_check
                    && payload["receivers"].as_object().map(|r| r.len()) == Some(1)
                    && payload["receivers"]["LISTENER"]["time_created"].is_string()
            })
            .times(1)
            .returning(|_, _, _, _| Ok("OK".to_string()));

        let uploader = Uploader::new("LISTENER", Arc::new(mock)).unwrap();
        assert_eq!(uploader.payload_telemetry(RAW, None, None).await.unwrap(), expected_id);
    }

    #[tokio::test]
    async fn test_listener_docs() {
        let (store, uploader) = memory_uploader("LISTENER");

        let info_id = uploader
            .listener_information(&json!({"radio": "FT-790R"}), Some(1_300_000_000))
            .await
            .unwrap();
        let tlm_id = uploader
            .listener_telemetry(&json!({"latitude": 52.0, "longitude": 0.1}), None)
            .await
            .unwrap();

        let info = store.document(&info_id).unwrap();
        assert_eq!(info["type"], json!("listener_information"));
        assert_eq!(info["data"]["radio"], json!("FT-790R"));
        assert_eq!(info["data"]["callsign"], json!("LISTENER"));
        assert_eq!(
            rfc3339::rfc3339_to_timestamp(info["time_created"].as_str().unwrap()).unwrap(),
            1_300_000_000
        );

        let tlm = store.document(&tlm_id).unwrap();
        assert_eq!(tlm["type"], json!("listener_telemetry"));
        assert!(tlm["time_uploaded"].is_string());

        assert_eq!(uploader.latest_listener_information().await, Some(info_id.clone()));
        assert_eq!(uploader.latest_listener_telemetry().await, Some(tlm_id.clone()));

        let doc_id = uploader.payload_telemetry(RAW, None, None).await.unwrap();
        let receiver = &store.document(&doc_id).unwrap()["receivers"]["LISTENER"];
        assert_eq!(receiver["latest_listener_information"], json!(info_id));
        assert_eq!(receiver["latest_listener_telemetry"], json!(tlm_id));
    }

    #[tokio::test]
    async fn test_latest_listener_doc_is_replaced() {
        let (_, uploader) = memory_uploader("LISTENER");

        let first = uploader.listener_telemetry(&json!({"a": 1}), None).await.unwrap();
        let second = uploader.listener_telemetry(&json!({"a": 2}), None).await.unwrap();

        assert_ne!(first, second);
        assert_eq!(uploader.latest_listener_telemetry().await, Some(second));
        assert_eq!(uploader.latest_listener_information().await, None);
    }

    #[tokio::test]
    async fn test_listener_doc_rejects_bad_data() {
        let (store, uploader) = memory_uploader("LISTENER");

        assert!(matches!(
            uploader.listener_telemetry(&json!({"callsign": "X"}), None).await,
            Err(HabitatError::InvalidArgument(_))
        ));
        assert!(matches!(
            uploader.listener_information(&json!("text"), None).await,
            Err(HabitatError::InvalidArgument(_))
        ));
        assert!(store.is_empty());
        assert_eq!(uploader.latest_listener_telemetry().await, None);
    }

    #[tokio::test]
    async fn test_payloads() {
        let (store, uploader) = memory_uploader("LISTENER");
        let docs: Vec<Value> = (0..3).map(|i| json!({"_id": format!("pcfg_{}", i)})).collect();
        let rows: Vec<Value> = docs
            .iter()
            .map(|d| json!({"id": d["_id"], "key": [d["_id"], 0], "doc": d}))
            .collect();
        store.set_view("payload_configuration", "name_time_created", json!({"rows": rows}));

        assert_eq!(uploader.payloads().await.unwrap(), docs);
    }

    #[tokio::test]
    async fn test_payloads_invalid_response() {
        let (store, uploader) = memory_uploader("LISTENER");
        store.set_view("payload_configuration", "name_time_created", json!({"rows": 3}));
        assert!(uploader.payloads().await.is_err());
    }

    #[tokio::test]
    async fn test_flights_groups_payload_docs() {
        let (store, uploader) = memory_uploader("LISTENER");
        store.set_view(
            "flight",
            "end_start_including_payloads",
            json!({"rows": [
                {"key": [2000, 1000, "f1", 0], "doc": {"_id": "f1"}},
                {"key": [2000, 1000, "f1", 1], "doc": {"_id": "p1"}},
                {"key": [2000, 1000, "f1", 1], "doc": null},
                {"key": [2000, 1000, "f1", 1], "doc": {"_id": "p2"}},
                {"key": [3000, 1500, "f2", 0], "doc": {"_id": "f2"}}
            ]}),
        );

        let flights = uploader.flights().await.unwrap();

        assert_eq!(flights.len(), 2);
        assert_eq!(flights[0]["_id"], json!("f1"));
        assert_eq!(flights[0]["_payload_docs"], json!([{"_id": "p1"}, {"_id": "p2"}]));
        assert_eq!(flights[1]["_payload_docs"], json!([]));
    }

    #[test]
    fn test_group_flights_rejects_bad_rows() {
        assert!(group_flights(&[json!({"key": [1, 2, 3], "doc": {"a": 1}})]).is_err());
        assert!(group_flights(&[json!({"key": [1, 2, 3, "x"], "doc": {"a": 1}})]).is_err());
        assert!(group_flights(&[json!({"key": [1, 2, 3, 0], "doc": {}})]).is_err());
        assert!(group_flights(&[json!({"key": [1, 2, 3, 1], "doc": {"a": 1}})]).is_err());
        assert!(group_flights(&[json!(7)]).is_err());
    }

    #[test]
    fn test_listener_doc_type_names() {
        assert_eq!(ListenerDocType::Information.type_name(), "listener_information");
        assert_eq!(ListenerDocType::Telemetry.type_name(), "listener_telemetry");
    }

    /// Store whose `save_doc` parks until released, recording any
    /// `update_put` that arrives while a save is still in progress
    struct GatedStore {
        inner: MemoryStore,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
        saving: std::sync::atomic::AtomicBool,
        updates: std::sync::atomic::AtomicUsize,
        updates_during_save: std::sync::atomic::AtomicUsize,
    }

    impl GatedStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                entered: tokio::sync::Notify::new(),
                release: tokio::sync::Notify::new(),
                saving: std::sync::atomic::AtomicBool::new(false),
                updates: std::sync::atomic::AtomicUsize::new(0),
                updates_during_save: std::sync::atomic::AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl DocumentStore for GatedStore {
        async fn get_doc(&self, doc_id: &str) -> std::result::Result<Value, StoreError> {
            self.inner.get_doc(doc_id).await
        }

        async fn put_doc(&self, doc_id: &str, doc: &Value) -> std::result::Result<String, StoreError> {
            self.inner.put_doc(doc_id, doc).await
        }

        async fn save_doc(&self, doc: &Value) -> std::result::Result<String, StoreError> {
            use std::sync::atomic::Ordering;

            self.saving.store(true, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;

            let result = self.inner.save_doc(doc).await;
            self.saving.store(false, Ordering::SeqCst);
            result
        }

        async fn update_put(
            &self,
            design: &str,
            update_name: &str,
            doc_id: &str,
            payload: &Value,
        ) -> std::result::Result<String, StoreError> {
            use std::sync::atomic::Ordering;

            self.updates.fetch_add(1, Ordering::SeqCst);
            if self.saving.load(Ordering::SeqCst) {
                self.updates_during_save.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.update_put(design, update_name, doc_id, payload).await
        }

        async fn view(
            &self,
            design: &str,
            view_name: &str,
            options: &ViewOptions,
        ) -> std::result::Result<Value, StoreError> {
            self.inner.view(design, view_name, options).await
        }
    }

    #[tokio::test]
    async fn test_telemetry_waits_for_listener_doc() {
        use std::sync::atomic::Ordering;

        let store = Arc::new(GatedStore::new());
        let uploader = Arc::new(Uploader::new("LISTENER", store.clone()).unwrap());

        let listener_task = {
            let uploader = uploader.clone();
            tokio::spawn(async move {
                uploader
                    .listener_telemetry(&json!({"latitude": 51.5}), None)
                    .await
            })
        };

        // listener_telemetry now holds the lock inside save_doc
        store.entered.notified().await;

        let payload_task = {
            let uploader = uploader.clone();
            tokio::spawn(async move { uploader.payload_telemetry(RAW, None, None).await })
        };

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.updates.load(Ordering::SeqCst), 0);
        assert!(!payload_task.is_finished());

        store.release.notify_one();

        let listener_id = listener_task.await.unwrap().unwrap();
        let doc_id = payload_task.await.unwrap().unwrap();

        assert_eq!(store.updates.load(Ordering::SeqCst), 1);
        assert_eq!(store.updates_during_save.load(Ordering::SeqCst), 0);

        let doc = store.inner.document(&doc_id).unwrap();
        assert_eq!(
            doc["receivers"]["LISTENER"]["latest_listener_telemetry"],
            json!(listener_id)
        );
    }
}
