//! Display-ready records combining an image with its analysis.
//!
//! The analysis half keeps "not analyzed yet", "analysis failed" and
//! "store unreachable" apart, so a missing document is never mistaken for a
//! failure.

use crate::credentials::CredentialResolver;
use crate::document_store::DocumentStore;
use crate::error::{ObjectStoreError, StoreError};
use crate::models::{document_key_for, ImageAsset};
use crate::object_store::{is_allowed_image, ObjectStore};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Analysis half of a [`ResultView`]
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisView {
    NotAnalyzed,
    Pending,
    Complete {
        results: Value,
        analyzed_at: Option<DateTime<Utc>>,
        object_count: Option<usize>,
    },
    Failed {
        error: String,
    },
    StoreUnreachable {
        reason: String,
    },
}

/// An image with its analysis state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultView {
    pub asset: ImageAsset,
    /// Time-limited download URL, absent if presigning failed
    pub image_url: Option<String>,
    pub analysis: AnalysisView,
}

/// Combine an asset with the outcome of its document lookup
pub fn compose(asset: ImageAsset, document: Result<Option<Value>, StoreError>) -> ResultView {
    let analysis = match document {
        Ok(None) => AnalysisView::NotAnalyzed,
        Ok(Some(document)) => analysis_from_document(&document),
        Err(e) => AnalysisView::StoreUnreachable {
            reason: e.to_string(),
        },
    };

    ResultView {
        asset,
        image_url: None,
        analysis,
    }
}

fn analysis_from_document(document: &Value) -> AnalysisView {
    let results = document.get("analysis_results").filter(|r| !r.is_null());

    // Documents written before `status` existed carry only the results
    match document.get("status").and_then(Value::as_str) {
        Some("pending") => AnalysisView::Pending,
        Some("failed") => AnalysisView::Failed {
            error: document
                .get("error")
                .and_then(Value::as_str)
                .filter(|e| !e.trim().is_empty())
                .unwrap_or("analysis failed without detail")
                .to_string(),
        },
        Some("complete") => complete_view(document, results.cloned().unwrap_or(Value::Null)),
        None => match results {
            Some(results) => complete_view(document, results.clone()),
            None => AnalysisView::Pending,
        },
        Some(other) => AnalysisView::Failed {
            error: format!("unrecognized analysis status: {}", other),
        },
    }
}

fn complete_view(document: &Value, results: Value) -> AnalysisView {
    AnalysisView::Complete {
        object_count: results
            .get("objects")
            .and_then(Value::as_array)
            .map(Vec::len),
        analyzed_at: document
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc)),
        results,
    }
}

pub struct ResultViewComposer {
    resolver: Arc<CredentialResolver>,
    store: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    collection: String,
    bucket: String,
    url_expiry: Duration,
    concurrency: usize,
}

impl ResultViewComposer {
    pub fn new(
        resolver: Arc<CredentialResolver>,
        store: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        collection: impl Into<String>,
        bucket: impl Into<String>,
        url_expiry: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            resolver,
            store,
            objects,
            collection: collection.into(),
            bucket: bucket.into(),
            url_expiry,
            concurrency: concurrency.max(1),
        }
    }

    /// View for one image, `None` if the image does not exist
    #[instrument(skip(self), fields(image_key = %image_key))]
    pub async fn view(&self, image_key: &str) -> Result<Option<ResultView>, ObjectStoreError> {
        let Some(asset) = self.objects.head(image_key).await? else {
            return Ok(None);
        };

        let document = self.lookup(&document_key_for(&self.bucket, image_key)).await;
        if let Err(e) = &document {
            warn!(error = %e, "Analysis document unavailable");
        }

        let mut view = compose(asset, document);
        view.image_url = match self.objects.presign_get(image_key, self.url_expiry).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(error = %e, "Failed to presign image URL");
                None
            }
        };

        Ok(Some(view))
    }

    /// Views for the gallery, newest first
    #[instrument(skip(self))]
    pub async fn list_views(
        &self,
        prefix: Option<String>,
        limit: usize,
    ) -> Result<Vec<ResultView>, ObjectStoreError> {
        let max_keys = i32::try_from(limit).unwrap_or(i32::MAX);
        let keys: Vec<String> = self
            .objects
            .list(prefix, max_keys)
            .await?
            .into_iter()
            .filter(|key| is_allowed_image(key))
            .collect();

        let mut views: Vec<ResultView> = stream::iter(keys)
            .map(|key| async move {
                match self.view(&key).await {
                    Ok(view) => view,
                    Err(e) => {
                        warn!(image_key = %key, error = %e, "Skipping image in listing");
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|view| async move { view })
            .collect()
            .await;

        views.sort_by(|a, b| {
            b.asset
                .created_at
                .cmp(&a.asset.created_at)
                .then_with(|| a.asset.key.cmp(&b.asset.key))
        });

        debug!(count = views.len(), "Listed result views");
        Ok(views)
    }

    async fn lookup(&self, document_key: &str) -> Result<Option<Value>, StoreError> {
        let store = &self.store;
        let collection = self.collection.as_str();

        self.resolver
            .with_credential(|credential| async move {
                store.get(&credential, collection, document_key).await
            })
            .await
    }
}
