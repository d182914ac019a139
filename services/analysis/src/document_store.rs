//! Client for the REST JSON document store (SODA-style collections).
//!
//! Protocol, relative to `{base_url}/{schema}/soda/latest`:
//!
//! | operation          | request                                             |
//! |--------------------|-----------------------------------------------------|
//! | create collection  | `PUT /{collection}` (409 = already exists)          |
//! | keyed insert       | `PUT /{collection}/{key}` + `If-None-Match: *`      |
//! | generated insert   | `POST /{collection}` (key in `items[0].id`)         |
//! | fetch              | `GET /{collection}/{key}`                           |
//! | delete             | `DELETE /{collection}/{key}` then acknowledgment `GET` (must be 404) |
//!
//! Every payload crossing this module boundary goes through [`normalize`].

use crate::config::DocumentStoreConfig;
use crate::credentials::Credential;
use crate::error::{AuthenticationError, StoreError};
use anyhow::{bail, Context};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoffBuilder};
use parking_lot::RwLock;
use reqwest::header::IF_NONE_MATCH;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Extended-JSON wrappers the store uses for values JSON cannot express natively
const EXTENDED_SCALAR_KEYS: &[&str] = &[
    "$oid",
    "$date",
    "$numberDecimal",
    "$numberLong",
    "$numberDouble",
    "$numberInt",
    "$binary",
    "$rawid",
    "$id",
    "$timestamp",
];

/// Longest remote error body kept in error messages
const MAX_ERROR_BODY: usize = 512;

/// Document store operations. Every call carries a resolved credential.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create the collection, treating "already exists" as success
    async fn ensure_collection_exists(
        &self,
        credential: &Credential,
        collection: &str,
    ) -> Result<(), StoreError>;

    /// Insert a payload. With a key, an existing document makes this a no-op
    /// that returns the key.
    async fn put(
        &self,
        credential: &Credential,
        collection: &str,
        payload: &Value,
        key: Option<String>,
    ) -> Result<String, StoreError>;

    async fn get(
        &self,
        credential: &Credential,
        collection: &str,
        key: &str,
    ) -> Result<Option<Value>, StoreError>;

    /// `true` if the document was removed, `false` if it was already absent
    async fn delete(
        &self,
        credential: &Credential,
        collection: &str,
        key: &str,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Deserialize)]
struct InsertResponse {
    #[serde(default)]
    items: Vec<InsertedItem>,
}

#[derive(Debug, Deserialize)]
struct InsertedItem {
    id: String,
}

/// Collection metadata sent on creation: client-assigned string keys
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CollectionMetadata {
    key_column: Value,
    content_column: Value,
    version_column: Value,
    last_modified_column: Value,
    creation_time_column: Value,
}

impl Default for CollectionMetadata {
    fn default() -> Self {
        Self {
            key_column: serde_json::json!({
                "name": "ID",
                "sqlType": "VARCHAR2",
                "maxLength": 255,
                "assignmentMethod": "CLIENT"
            }),
            content_column: serde_json::json!({ "name": "JSON_DOCUMENT", "sqlType": "BLOB" }),
            version_column: serde_json::json!({ "name": "VERSION", "method": "UUID" }),
            last_modified_column: serde_json::json!({ "name": "LAST_MODIFIED" }),
            creation_time_column: serde_json::json!({ "name": "CREATED_ON" }),
        }
    }
}

/// HTTP client for the SODA REST interface
pub struct SodaClient {
    http: reqwest::Client,
    base: Url,
    max_retries: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
    /// Collections confirmed to exist during this process lifetime
    confirmed_collections: RwLock<HashSet<String>>,
}

impl SodaClient {
    pub fn new(config: &DocumentStoreConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&config.soda_url())
            .with_context(|| format!("Invalid document store URL: {}", config.base_url))?;
        if base.cannot_be_a_base() {
            bail!("Document store URL cannot carry a path: {}", base);
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .context("Failed to build document store HTTP client")?;

        info!(url = %base, "Document store client initialized");

        Ok(Self {
            http,
            base,
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay(),
            retry_max_delay: config.retry_max_delay(),
            confirmed_collections: RwLock::new(HashSet::new()),
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn forget_collection(&self, collection: &str) {
        if self.confirmed_collections.write().remove(collection) {
            debug!(collection = %collection, "Collection no longer confirmed");
        }
    }

    /// Send a request, retrying transport failures with exponential backoff
    async fn send<F>(&self, operation: &'static str, build: F) -> Result<Response, StoreError>
    where
        F: Fn() -> RequestBuilder,
    {
        let (response, _) = self.send_attempts(operation, self.max_retries, build).await?;
        Ok(response)
    }

    /// Send with an explicit retry budget, returning the response and the
    /// number of attempts it took
    async fn send_attempts<F>(
        &self,
        operation: &'static str,
        max_retries: u32,
        build: F,
    ) -> Result<(Response, u32), StoreError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_base_delay)
            .with_max_interval(self.retry_max_delay)
            .with_max_elapsed_time(None)
            .build();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let error = match build().send().await {
                Ok(response) => return Ok((response, attempts)),
                Err(e) => transport_error(e),
            };

            if !error.is_retryable() || attempts > max_retries {
                metrics::counter!("document_store.request_failures", "operation" => operation)
                    .increment(1);
                return Err(error);
            }

            match backoff.next_backoff() {
                Some(delay) => {
                    // Jitter may overshoot the ceiling
                    let delay = delay.min(self.retry_max_delay);
                    warn!(
                        operation = operation,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Document store request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(error),
            }
        }
    }

    fn authed(&self, request: RequestBuilder, credential: &Credential) -> RequestBuilder {
        request.basic_auth(&credential.username, Some(credential.secret()))
    }

    async fn fetch(
        &self,
        credential: &Credential,
        collection: &str,
        key: &str,
    ) -> Result<Option<Value>, StoreError> {
        let url = self.url(&[collection, key]);
        let response = self
            .send("get", || self.authed(self.http.get(url.clone()), credential))
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await.map_err(transport_error)?;
                let value: Value = serde_json::from_slice(&body)?;
                Ok(Some(normalize(value)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(error_from_response(response).await),
        }
    }
}

#[async_trait]
impl DocumentStore for SodaClient {
    #[instrument(skip(self, credential))]
    async fn ensure_collection_exists(
        &self,
        credential: &Credential,
        collection: &str,
    ) -> Result<(), StoreError> {
        if self.confirmed_collections.read().contains(collection) {
            return Ok(());
        }

        let url = self.url(&[collection]);
        let metadata = CollectionMetadata::default();
        let response = self
            .send("create_collection", || {
                self.authed(self.http.put(url.clone()), credential).json(&metadata)
            })
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::CONFLICT => {
                info!(
                    collection = %collection,
                    status = response.status().as_u16(),
                    "Collection confirmed"
                );
                self.confirmed_collections
                    .write()
                    .insert(collection.to_string());
                Ok(())
            }
            _ => Err(error_from_response(response).await),
        }
    }

    #[instrument(skip(self, credential, payload))]
    async fn put(
        &self,
        credential: &Credential,
        collection: &str,
        payload: &Value,
        key: Option<String>,
    ) -> Result<String, StoreError> {
        let payload = normalize(payload.clone());

        let Some(key) = key else {
            let url = self.url(&[collection]);
            // A lost response would turn a retried POST into a second document
            let (response, _) = self
                .send_attempts("insert", 0, || {
                    self.authed(self.http.post(url.clone()), credential).json(&payload)
                })
                .await?;

            return match response.status() {
                StatusCode::OK | StatusCode::CREATED => {
                    let body = response.bytes().await.map_err(transport_error)?;
                    let inserted: InsertResponse = serde_json::from_slice(&body)?;
                    let key = inserted.items.into_iter().next().map(|item| item.id).ok_or_else(
                        || StoreError::Serialization("insert response carried no key".to_string()),
                    )?;
                    debug!(collection = %collection, key = %key, "Inserted document");
                    Ok(key)
                }
                StatusCode::NOT_FOUND => {
                    self.forget_collection(collection);
                    Err(error_from_response(response).await)
                }
                _ => Err(error_from_response(response).await),
            };
        };

        // Fetch-before-insert saves a write on redelivery; the conditional PUT
        // below closes the race window between check and insert.
        if self.fetch(credential, collection, &key).await?.is_some() {
            debug!(collection = %collection, key = %key, "Document already exists, skipping insert");
            metrics::counter!("document_store.duplicate_inserts").increment(1);
            return Ok(key);
        }

        let url = self.url(&[collection, &key]);
        let response = self
            .send("insert", || {
                self.authed(self.http.put(url.clone()), credential)
                    .header(IF_NONE_MATCH, "*")
                    .json(&payload)
            })
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => {
                debug!(collection = %collection, key = %key, "Inserted document");
                Ok(key)
            }
            StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
                debug!(collection = %collection, key = %key, "Concurrent insert won, keeping existing document");
                metrics::counter!("document_store.duplicate_inserts").increment(1);
                Ok(key)
            }
            StatusCode::NOT_FOUND => {
                self.forget_collection(collection);
                Err(error_from_response(response).await)
            }
            _ => Err(error_from_response(response).await),
        }
    }

    #[instrument(skip(self, credential))]
    async fn get(
        &self,
        credential: &Credential,
        collection: &str,
        key: &str,
    ) -> Result<Option<Value>, StoreError> {
        self.fetch(credential, collection, key).await
    }

    #[instrument(skip(self, credential))]
    async fn delete(
        &self,
        credential: &Credential,
        collection: &str,
        key: &str,
    ) -> Result<bool, StoreError> {
        let url = self.url(&[collection, key]);
        let (response, attempts) = self
            .send_attempts("delete", self.max_retries, || {
                self.authed(self.http.delete(url.clone()), credential)
            })
            .await?;

        match response.status() {
            // An earlier attempt may have removed it before its response was lost
            StatusCode::NOT_FOUND if attempts > 1 => {
                info!(collection = %collection, key = %key, attempts, "Document deleted on an earlier attempt");
                return Ok(true);
            }
            StatusCode::NOT_FOUND => {
                debug!(collection = %collection, key = %key, "Document already absent");
                return Ok(false);
            }
            status if status.is_success() => {}
            _ => return Err(error_from_response(response).await),
        }

        // Acknowledgment: the delete only counts once a read confirms it
        match self.fetch(credential, collection, key).await? {
            None => {
                info!(collection = %collection, key = %key, "Document deleted");
                Ok(true)
            }
            Some(_) => {
                metrics::counter!("document_store.unacknowledged_deletes").increment(1);
                Err(StoreError::DataConsistency(format!(
                    "delete of {}/{} was not acknowledged: document still present",
                    collection, key
                )))
            }
        }
    }
}

/// Rewrite extended-JSON scalar wrappers to their string form, recursively
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some((key, inner)) = map.iter().next() {
                    if EXTENDED_SCALAR_KEYS.contains(&key.as_str()) {
                        return Value::String(scalar_string(inner));
                    }
                }
            }
            Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, normalize(value)))
                    .collect::<Map<String, Value>>(),
            )
        }
        other => other,
    }
}

fn scalar_string(inner: &Value) -> String {
    match normalize(inner.clone()) {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Serialize a typed document into a normalized store payload
pub fn to_payload<T: Serialize>(document: &T) -> Result<Value, StoreError> {
    let value = serde_json::to_value(document)?;
    Ok(normalize(value))
}

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_builder() {
        StoreError::Serialization(err.to_string())
    } else if err.is_decode() {
        StoreError::Serialization(err.to_string())
    } else {
        StoreError::TransientNetwork(err.to_string())
    }
}

fn status_error(status: StatusCode, body: &str) -> StoreError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StoreError::Authentication(AuthenticationError::Rejected {
                status: status.as_u16(),
            })
        }
        _ => {
            let mut message = body.trim().to_string();
            if message.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            StoreError::RemoteService {
                status: status.as_u16(),
                message,
            }
        }
    }
}

async fn error_from_response(response: Response) -> StoreError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    status_error(status, &body)
}
