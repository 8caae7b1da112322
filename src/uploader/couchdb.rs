//! # CouchDB Transport
//!
//! HTTP implementation of [`DocumentStore`] for the habitat CouchDB.
//!
//! This module handles:
//! - Building document, update handler and view URLs
//! - Allocating document ids from the server's `_uuids`, 100 at a time
//! - Mapping HTTP status codes onto [`StoreError`]

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::store::{DocumentStore, StoreError, ViewOptions};
use crate::error::{HabitatError, Result};

/// Number of ids fetched per `_uuids` request
const UUID_BATCH: usize = 100;

/// Encode a JSON value for use as a view query parameter
pub fn json_query_value(value: &Value) -> String {
    value.to_string()
}

/// One CouchDB database
pub struct CouchDatabase {
    client: Client,
    server_url: Url,
    db_url: Url,
    uuid_cache: Mutex<VecDeque<String>>,
}

impl std::fmt::Debug for CouchDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchDatabase")
            .field("db_url", &self.db_url.as_str())
            .finish_non_exhaustive()
    }
}

impl CouchDatabase {
    /// Connect to `database` on the server at `server`
    ///
    /// # Errors
    ///
    /// Returns error if either name is empty or the URL does not parse.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use habitat_listener::uploader::couchdb::CouchDatabase;
    ///
    /// let db = CouchDatabase::new("http://localhost:5984", "habitat", Duration::from_secs(10))?;
    /// assert_eq!(db.url(), "http://localhost:5984/habitat/");
    /// # Ok::<(), habitat_listener::error::HabitatError>(())
    /// ```
    pub fn new(server: &str, database: &str, timeout: Duration) -> Result<Self> {
        let server_url = server_url(server)?;
        let db_url = database_url(&server_url, database)?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            server_url,
            db_url,
            uuid_cache: Mutex::new(VecDeque::with_capacity(UUID_BATCH)),
        })
    }

    /// Database URL, always ending in `/`
    pub fn url(&self) -> &str {
        self.db_url.as_str()
    }

    fn doc_url(&self, doc_id: &str) -> Url {
        join(&self.db_url, &[doc_id])
    }

    fn update_url(&self, design: &str, update_name: &str, doc_id: &str) -> Url {
        let mut segments = vec!["_design", design, "_update", update_name];
        if !doc_id.is_empty() {
            segments.push(doc_id);
        }
        join(&self.db_url, &segments)
    }

    fn view_url(&self, design: &str, view_name: &str) -> Url {
        if design.is_empty() {
            join(&self.db_url, &[view_name])
        } else {
            join(&self.db_url, &["_design", design, "_view", view_name])
        }
    }

    async fn next_uuid(&self) -> std::result::Result<String, StoreError> {
        let mut cache = self.uuid_cache.lock().await;

        if let Some(uuid) = cache.pop_front() {
            return Ok(uuid);
        }

        let mut url = join(&self.server_url, &["_uuids"]);
        url.query_pairs_mut()
            .append_pair("count", &UUID_BATCH.to_string());

        let response = get_json(self.client.get(url), "_uuids").await?;
        let mut uuids = response
            .get("uuids")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string))
            .into_iter()
            .flatten();

        let first = uuids
            .next()
            .ok_or_else(|| StoreError::InvalidResponse("Invalid UUIDs response".to_string()))?;
        cache.extend(uuids);

        debug!("Fetched {} server uuids", cache.len() + 1);
        Ok(first)
    }
}

#[async_trait]
impl DocumentStore for CouchDatabase {
    async fn get_doc(&self, doc_id: &str) -> std::result::Result<Value, StoreError> {
        get_json(self.client.get(self.doc_url(doc_id)), doc_id).await
    }

    async fn put_doc(&self, doc_id: &str, doc: &Value) -> std::result::Result<String, StoreError> {
        let info = send_json(self.client.put(self.doc_url(doc_id)).json(doc), doc_id).await?;

        if info.get("id").and_then(Value::as_str) != Some(doc_id) {
            return Err(StoreError::InvalidResponse(format!(
                "server saved wrong _id (expected {})",
                doc_id
            )));
        }

        info.get("rev")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::InvalidResponse("rev is not a string".to_string()))
    }

    async fn save_doc(&self, doc: &Value) -> std::result::Result<String, StoreError> {
        let doc_id = match doc.get("_id") {
            None | Some(Value::Null) => self.next_uuid().await?,
            Some(Value::String(id)) => id.clone(),
            Some(_) => {
                return Err(StoreError::InvalidDocument(
                    "_id must be a string if set".to_string(),
                ))
            }
        };

        if doc_id.is_empty() {
            return Err(StoreError::InvalidDocument(
                "_id cannot be an empty string".to_string(),
            ));
        }
        if doc_id.starts_with('_') {
            return Err(StoreError::InvalidDocument(
                "_id cannot start with _".to_string(),
            ));
        }

        self.put_doc(&doc_id, doc).await?;
        Ok(doc_id)
    }

    async fn update_put(
        &self,
        design: &str,
        update_name: &str,
        doc_id: &str,
        payload: &Value,
    ) -> std::result::Result<String, StoreError> {
        let url = self.update_url(design, update_name, doc_id);
        send(self.client.put(url).json(payload), doc_id).await
    }

    async fn view(
        &self,
        design: &str,
        view_name: &str,
        options: &ViewOptions,
    ) -> std::result::Result<Value, StoreError> {
        let url = self.view_url(design, view_name);
        get_json(self.client.get(url).query(options), view_name).await
    }
}

fn server_url(url: &str) -> Result<Url> {
    if url.is_empty() {
        return Err(HabitatError::InvalidArgument("URL of zero length".to_string()));
    }

    let with_slash = if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    };

    Url::parse(&with_slash)
        .map_err(|e| HabitatError::InvalidArgument(format!("invalid URL '{}': {}", url, e)))
}

fn database_url(server: &Url, db: &str) -> Result<Url> {
    if db.is_empty() {
        return Err(HabitatError::InvalidArgument("DB of zero length".to_string()));
    }

    // The trailing empty segment keeps the URL ending in '/'
    Ok(join(server, &[db.trim_end_matches('/'), ""]))
}

/// Append percent-escaped path segments to a directory URL
fn join(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Map a response status onto the store's error kinds
fn classify(status: StatusCode, body: String, doc_id: &str) -> std::result::Result<String, StoreError> {
    match status.as_u16() {
        _ if status.is_success() => Ok(body),
        409 => Err(StoreError::Conflict(doc_id.to_string())),
        401 | 403 => Err(StoreError::Forbidden {
            status: status.as_u16(),
        }),
        404 => Err(StoreError::NotFound(doc_id.to_string())),
        code => Err(StoreError::Http { status: code, body }),
    }
}

async fn send(request: RequestBuilder, doc_id: &str) -> std::result::Result<String, StoreError> {
    let response = request
        .send()
        .await
        .map_err(|e| StoreError::Transport(e.to_string()))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| StoreError::Transport(e.to_string()))?;

    classify(status, body, doc_id)
}

async fn send_json(request: RequestBuilder, doc_id: &str) -> std::result::Result<Value, StoreError> {
    let body = send(request, doc_id).await?;
    serde_json::from_str(&body).map_err(|e| StoreError::InvalidResponse(e.to_string()))
}

async fn get_json(request: RequestBuilder, what: &str) -> std::result::Result<Value, StoreError> {
    send_json(request, what).await
}
