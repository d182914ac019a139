//! In-process SODA REST server for integration tests.

#![allow(dead_code)]

use analysis_service::config::DocumentStoreConfig;
use analysis_service::credentials::{Credential, CredentialKind};
use analysis_service::document_store::SodaClient;
use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::put,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

pub const USERNAME: &str = "ADMIN";
pub const PASSWORD: &str = "correct-horse";

#[derive(Default)]
pub struct FakeState {
    pub collections: HashMap<String, HashMap<String, Value>>,
    /// Keys that exist but are reported missing by GET
    pub hidden_from_get: HashSet<String>,
    /// DELETE answers success but keeps the document
    pub ignore_deletes: bool,
    pub create_calls: usize,
    pub generated: usize,
    /// Number of upcoming writes that apply but answer too late for the client
    pub stalled_writes: usize,
    pub post_calls: usize,
    pub delete_calls: usize,
}

/// Longer than the one-second client timeout used by stalled-write tests
const STALL: Duration = Duration::from_millis(1500);

fn take_stall(state: &mut FakeState) -> bool {
    if state.stalled_writes == 0 {
        return false;
    }
    state.stalled_writes -= 1;
    true
}

#[derive(Clone)]
pub struct FakeSoda {
    pub addr: SocketAddr,
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeSoda {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(FakeState::default()));

        let router = Router::new()
            .route(
                "/ords/admin/soda/latest/:collection",
                put(create_collection).post(insert_generated),
            )
            .route(
                "/ords/admin/soda/latest/:collection/:key",
                put(insert_keyed).get(get_document).delete(delete_document),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake SODA server");
        let addr = listener.local_addr().expect("local addr");

        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("fake SODA server");
        });

        Self { addr, state }
    }

    pub fn config(&self) -> DocumentStoreConfig {
        DocumentStoreConfig {
            max_retries: 1,
            retry_base_delay_ms: 10,
            retry_max_delay_ms: 20,
            ..DocumentStoreConfig::with_base_url(format!("http://{}/ords/", self.addr))
        }
    }

    pub fn client(&self) -> SodaClient {
        SodaClient::new(&self.config()).expect("SODA client")
    }

    pub fn seed(&self, collection: &str, key: &str, document: Value) {
        self.state
            .lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), document);
    }

    pub fn document(&self, collection: &str, key: &str) -> Option<Value> {
        self.state
            .lock()
            .collections
            .get(collection)
            .and_then(|documents| documents.get(key).cloned())
    }

    pub fn count(&self, collection: &str) -> usize {
        self.state
            .lock()
            .collections
            .get(collection)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}

pub fn credential() -> Credential {
    Credential::new(CredentialKind::Environment, USERNAME, PASSWORD)
}

pub fn wrong_credential() -> Credential {
    Credential::new(CredentialKind::StaticFallback, USERNAME, "wrong")
}

type Shared = State<Arc<Mutex<FakeState>>>;

fn authorized(headers: &HeaderMap) -> bool {
    let expected = format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", USERNAME, PASSWORD))
    );
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(|value| value == expected)
        .unwrap_or(false)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "authentication required").into_response()
}

async fn create_collection(
    State(state): Shared,
    Path(collection): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }

    let mut state = state.lock();
    state.create_calls += 1;
    if state.collections.contains_key(&collection) {
        return StatusCode::CONFLICT.into_response();
    }
    state.collections.insert(collection, HashMap::new());
    StatusCode::CREATED.into_response()
}

async fn insert_generated(
    State(state): Shared,
    Path(collection): Path<String>,
    headers: HeaderMap,
    Json(document): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }

    let (response, stall) = {
        let mut state = state.lock();
        state.post_calls += 1;
        state.generated += 1;
        let key = format!("GEN{:04}", state.generated);
        let response = match state.collections.get_mut(&collection) {
            Some(documents) => {
                documents.insert(key.clone(), document);
                (
                    StatusCode::CREATED,
                    Json(json!({ "items": [{ "id": key, "etag": "E1" }], "hasMore": false })),
                )
                    .into_response()
            }
            None => (StatusCode::NOT_FOUND, "collection not found").into_response(),
        };
        (response, take_stall(&mut state))
    };

    if stall {
        tokio::time::sleep(STALL).await;
    }
    response
}

async fn insert_keyed(
    State(state): Shared,
    Path((collection, key)): Path<(String, String)>,
    headers: HeaderMap,
    Json(document): Json<Value>,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }

    let conditional = headers
        .get(header::IF_NONE_MATCH)
        .map(|value| value == "*")
        .unwrap_or(false);

    let mut state = state.lock();
    let Some(documents) = state.collections.get_mut(&collection) else {
        return (StatusCode::NOT_FOUND, "collection not found").into_response();
    };

    if documents.contains_key(&key) {
        if conditional {
            return StatusCode::PRECONDITION_FAILED.into_response();
        }
        documents.insert(key, document);
        return StatusCode::OK.into_response();
    }

    documents.insert(key, document);
    StatusCode::CREATED.into_response()
}

async fn get_document(
    State(state): Shared,
    Path((collection, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }

    let state = state.lock();
    if state.hidden_from_get.contains(&key) {
        return StatusCode::NOT_FOUND.into_response();
    }

    match state
        .collections
        .get(&collection)
        .and_then(|documents| documents.get(&key))
    {
        Some(document) => Json(document.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn delete_document(
    State(state): Shared,
    Path((collection, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return unauthorized();
    }

    let stall = {
        let mut state = state.lock();
        state.delete_calls += 1;
        let ignore = state.ignore_deletes;
        let Some(documents) = state.collections.get_mut(&collection) else {
            return StatusCode::NOT_FOUND.into_response();
        };

        if !documents.contains_key(&key) {
            return StatusCode::NOT_FOUND.into_response();
        }
        if !ignore {
            documents.remove(&key);
        }
        take_stall(&mut state)
    };

    if stall {
        tokio::time::sleep(STALL).await;
    }
    StatusCode::OK.into_response()
}
