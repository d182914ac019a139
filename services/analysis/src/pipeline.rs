//! Analysis pipeline handler.
//!
//! Invoked once per upload notification. Each invocation walks
//!
//! ```text
//! received -> fetching-asset -> invoking-analysis -> persisting-result -> done
//!                                       |                    |
//!                                     failed             degraded
//! ```
//!
//! and ends in exactly one terminal state. The document key is derived from
//! the asset, so redelivered events converge on the same document.

use crate::analysis::{AnalysisCapability, AnalysisRequest};
use crate::credentials::CredentialResolver;
use crate::document_store::{normalize, to_payload, DocumentStore};
use crate::error::{AnalysisError, StoreError};
use crate::events::ObjectCreatedEvent;
use crate::models::{document_key_for, AnalysisDocument, AnalysisStatus, ImageAsset};
use crate::object_store::ObjectStore;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Handler states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandlerState {
    Received,
    FetchingAsset,
    InvokingAnalysis,
    PersistingResult,
    Done,
    /// Document store unusable; the asset stays stored and viewable
    Degraded,
    /// Analysis failed or timed out, or the asset could not be read
    Failed,
}

impl HandlerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerState::Received => "received",
            HandlerState::FetchingAsset => "fetching-asset",
            HandlerState::InvokingAnalysis => "invoking-analysis",
            HandlerState::PersistingResult => "persisting-result",
            HandlerState::Done => "done",
            HandlerState::Degraded => "degraded",
            HandlerState::Failed => "failed",
        }
    }
}

/// Result of one handler invocation
#[derive(Debug, Clone, Serialize)]
pub struct HandlerOutcome {
    pub state: HandlerState,
    pub image_key: String,
    pub document_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Handler settings taken from configuration
#[derive(Debug, Clone)]
pub struct HandlerSettings {
    pub collection: String,
    pub bucket: String,
    pub namespace: String,
    pub analysis_timeout: Duration,
    /// Send image bytes with the analysis request instead of a storage reference
    pub inline_image_bytes: bool,
}

/// Turns an upload notification into a persisted analysis document
pub struct AnalysisHandler {
    resolver: Arc<CredentialResolver>,
    store: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    analysis: Arc<dyn AnalysisCapability>,
    settings: HandlerSettings,
}

/// Per-invocation bookkeeping
struct Invocation<'a> {
    image_key: &'a str,
    document_key: String,
    state: HandlerState,
}

impl<'a> Invocation<'a> {
    fn new(bucket: &str, image_key: &'a str) -> Self {
        Self {
            image_key,
            document_key: document_key_for(bucket, image_key),
            state: HandlerState::Received,
        }
    }

    fn transition(&mut self, next: HandlerState) {
        debug!(
            image_key = %self.image_key,
            from = self.state.as_str(),
            to = next.as_str(),
            "Handler state transition"
        );
        self.state = next;
    }

    fn finish(mut self, state: HandlerState, detail: Option<String>) -> HandlerOutcome {
        self.transition(state);
        HandlerOutcome {
            state,
            image_key: self.image_key.to_string(),
            document_key: self.document_key,
            detail,
        }
    }
}

impl AnalysisHandler {
    pub fn new(
        resolver: Arc<CredentialResolver>,
        store: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        analysis: Arc<dyn AnalysisCapability>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            resolver,
            store,
            objects,
            analysis,
            settings,
        }
    }

    /// Handle an object-created notification
    #[instrument(
        skip(self, event),
        fields(event_id = event.event_id.as_deref().unwrap_or("-"))
    )]
    pub async fn handle_event(&self, event: &ObjectCreatedEvent) -> HandlerOutcome {
        if let Some(bucket) = event.bucket_name.as_deref() {
            if bucket != self.settings.bucket {
                warn!(
                    bucket = %bucket,
                    image_key = %event.object_name,
                    "Event for an unmanaged bucket, skipping"
                );
                return HandlerOutcome {
                    state: HandlerState::Done,
                    image_key: event.object_name.clone(),
                    document_key: document_key_for(bucket, &event.object_name),
                    detail: Some(format!("bucket {} is not managed by this service", bucket)),
                };
            }
        }

        let namespace = event
            .namespace
            .as_deref()
            .unwrap_or(&self.settings.namespace);
        self.run(&event.object_name, namespace).await
    }

    /// Analyze an image already in the managed bucket
    pub async fn handle(&self, image_key: &str) -> HandlerOutcome {
        self.run(image_key, &self.settings.namespace).await
    }

    #[instrument(skip(self, namespace), fields(image_key = %image_key))]
    async fn run(&self, image_key: &str, namespace: &str) -> HandlerOutcome {
        let started = Instant::now();
        metrics::counter!("analysis.invocations").increment(1);

        let outcome = self.process(image_key, namespace).await;

        metrics::counter!("analysis.outcome", "state" => outcome.state.as_str()).increment(1);
        metrics::histogram!("analysis.duration_seconds").record(started.elapsed().as_secs_f64());

        match outcome.state {
            HandlerState::Done => info!(
                image_key = %image_key,
                document_key = %outcome.document_key,
                detail = outcome.detail.as_deref().unwrap_or(""),
                "Analysis handled"
            ),
            HandlerState::Failed => warn!(
                image_key = %image_key,
                detail = outcome.detail.as_deref().unwrap_or(""),
                "Analysis failed, failure recorded"
            ),
            _ => error!(
                image_key = %image_key,
                state = outcome.state.as_str(),
                detail = outcome.detail.as_deref().unwrap_or(""),
                "Analysis result not persisted"
            ),
        }

        outcome
    }

    async fn process(&self, image_key: &str, namespace: &str) -> HandlerOutcome {
        let mut invocation = Invocation::new(&self.settings.bucket, image_key);

        // No credential means nothing can be persisted; skip the analysis cost
        if let Err(e) = self.resolver.resolve().await {
            return invocation.finish(HandlerState::Degraded, Some(e.to_string()));
        }

        let existing = self.existing_document(&invocation.document_key).await;
        match existing {
            Ok(true) => {
                return invocation.finish(
                    HandlerState::Done,
                    Some("analysis document already exists".to_string()),
                )
            }
            Ok(false) => {}
            Err(e) if e.is_authentication() => {
                return invocation.finish(HandlerState::Degraded, Some(e.to_string()))
            }
            Err(e) => {
                warn!(error = %e, "Existence check failed, relying on conditional insert");
            }
        }

        invocation.transition(HandlerState::FetchingAsset);
        let (asset, image_bytes) = match self.fetch_asset(image_key).await {
            Ok(Some(fetched)) => fetched,
            Ok(None) => {
                return invocation.finish(
                    HandlerState::Done,
                    Some("asset no longer exists, nothing to analyze".to_string()),
                )
            }
            Err(detail) => return invocation.finish(HandlerState::Failed, Some(detail)),
        };

        invocation.transition(HandlerState::InvokingAnalysis);
        let request = AnalysisRequest {
            asset,
            namespace: namespace.to_string(),
            image_bytes,
        };
        let document = match self.invoke_analysis(&request).await {
            Ok(results) => AnalysisDocument::complete(&request.asset, normalize(results)),
            Err(e) => {
                warn!(error = %e, "Analysis capability failed");
                AnalysisDocument::failed(&request.asset, e.to_string())
            }
        };

        invocation.transition(HandlerState::PersistingResult);
        let (payload, failure) = match self.prepare_payload(&request.asset, document) {
            Ok(prepared) => prepared,
            Err(e) => return invocation.finish(HandlerState::Degraded, Some(e.to_string())),
        };

        let persisted = self.persist(&invocation.document_key, &payload).await;
        match persisted {
            Ok(_) => match failure {
                Some(error) => invocation.finish(HandlerState::Failed, Some(error)),
                None => invocation.finish(HandlerState::Done, None),
            },
            Err(e) => invocation.finish(HandlerState::Degraded, Some(e.to_string())),
        }
    }

    async fn existing_document(&self, document_key: &str) -> Result<bool, StoreError> {
        let store = &self.store;
        let collection = self.settings.collection.as_str();

        let existing = self
            .resolver
            .with_credential(|credential| async move {
                store.get(&credential, collection, document_key).await
            })
            .await?;

        Ok(existing.is_some())
    }

    async fn fetch_asset(
        &self,
        image_key: &str,
    ) -> Result<Option<(ImageAsset, Option<Vec<u8>>)>, String> {
        let asset = match self.objects.head(image_key).await {
            Ok(Some(asset)) => asset,
            Ok(None) => return Ok(None),
            Err(e) => return Err(e.to_string()),
        };

        if !self.settings.inline_image_bytes {
            return Ok(Some((asset, None)));
        }

        match self.objects.get(image_key).await {
            Ok(Some(bytes)) => Ok(Some((asset, Some(bytes)))),
            Ok(None) => Ok(None),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn invoke_analysis(&self, request: &AnalysisRequest) -> Result<Value, AnalysisError> {
        let timeout = self.settings.analysis_timeout;
        match tokio::time::timeout(timeout, self.analysis.analyze(request)).await {
            Ok(result) => result,
            Err(_) => Err(AnalysisError::Timeout(timeout.as_secs())),
        }
    }

    /// Serialize the document. A document that cannot be represented is
    /// replaced by a `failed` one. Returns the payload and, for failed
    /// documents, the recorded error.
    fn prepare_payload(
        &self,
        asset: &ImageAsset,
        document: AnalysisDocument,
    ) -> Result<(Value, Option<String>), StoreError> {
        match to_payload(&document) {
            Ok(payload) => {
                let failure = match document.status {
                    AnalysisStatus::Failed => document.error,
                    _ => None,
                };
                Ok((payload, failure))
            }
            Err(e) => {
                warn!(error = %e, "Analysis result could not be serialized");
                let fallback = AnalysisDocument::failed(asset, e.to_string());
                let error = fallback.error.clone();
                Ok((to_payload(&fallback)?, error))
            }
        }
    }

    async fn persist(&self, document_key: &str, payload: &Value) -> Result<String, StoreError> {
        let store = &self.store;
        let collection = self.settings.collection.as_str();

        self.resolver
            .with_credential(|credential| async move {
                store.ensure_collection_exists(&credential, collection).await?;
                store
                    .put(&credential, collection, payload, Some(document_key.to_string()))
                    .await
            })
            .await
    }
}
