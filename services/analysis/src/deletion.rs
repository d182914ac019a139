//! Deletes an image together with its analysis document.

use crate::credentials::CredentialResolver;
use crate::document_store::DocumentStore;
use crate::error::StoreError;
use crate::models::document_key_for;
use crate::object_store::ObjectStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Outcome of deleting one asset and its analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionResult {
    pub image_key: String,
    /// The image was removed by this call
    pub asset_removed: bool,
    /// The analysis document was removed by this call
    pub document_removed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl DeletionResult {
    /// Neither half failed
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct DeletionCoordinator {
    resolver: Arc<CredentialResolver>,
    store: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    collection: String,
    bucket: String,
}

impl DeletionCoordinator {
    pub fn new(
        resolver: Arc<CredentialResolver>,
        store: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        collection: impl Into<String>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            resolver,
            store,
            objects,
            collection: collection.into(),
            bucket: bucket.into(),
        }
    }

    /// Delete the analysis document, then the image. Both halves are always
    /// attempted and reported independently.
    #[instrument(skip(self), fields(image_key = %image_key))]
    pub async fn delete_asset_and_analysis(&self, image_key: &str) -> DeletionResult {
        let document_key = document_key_for(&self.bucket, image_key);
        let mut errors = Vec::new();

        let document_outcome = self.delete_document(&document_key).await;
        let document_removed = match &document_outcome {
            Ok(removed) => *removed,
            Err(e) => {
                warn!(error = %e, document_key = %document_key, "Failed to delete analysis document");
                errors.push(format!("analysis document: {}", e));
                false
            }
        };

        let asset_removed = match self.objects.delete(image_key).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "Failed to delete image");
                errors.push(format!("image: {}", e));
                false
            }
        };

        // Asset gone, document possibly left behind
        if document_outcome.is_err() && asset_removed {
            let violation = StoreError::DataConsistency(format!(
                "analysis document {} may outlive deleted image {}",
                document_key, image_key
            ));
            error!(error = %violation, "Deletion left a dangling analysis document");
            metrics::counter!("deletion.consistency_violations").increment(1);
            errors.push(violation.to_string());
        }

        info!(
            asset_removed,
            document_removed,
            errors = errors.len(),
            "Deletion finished"
        );

        DeletionResult {
            image_key: image_key.to_string(),
            asset_removed,
            document_removed,
            errors,
        }
    }

    async fn delete_document(&self, document_key: &str) -> Result<bool, StoreError> {
        let store = &self.store;
        let collection = self.collection.as_str();

        self.resolver
            .with_credential(|credential| async move {
                store.delete(&credential, collection, document_key).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credential, CredentialKind};
    use crate::document_store::MockDocumentStore;
    use crate::error::{AuthenticationError, ObjectStoreError};
    use crate::object_store::MockObjectStore;
    use crate::pipeline::tests::{resolver, MemoryStore};
    use serde_json::json;

    fn coordinator(store: Arc<dyn DocumentStore>, objects: MockObjectStore) -> DeletionCoordinator {
        DeletionCoordinator::new(resolver(), store, Arc::new(objects), "IMAGE_ANALYSIS", "images")
    }

    async fn seeded_store(image_key: &str) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        let credential = Credential::new(CredentialKind::Environment, "ADMIN", "secret");
        store
            .put(
                &credential,
                "IMAGE_ANALYSIS",
                &json!({ "image_name": image_key, "status": "complete" }),
                Some(document_key_for("images", image_key)),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_deletes_document_then_asset() {
        let store = seeded_store("cat.jpg").await;
        let mut objects = MockObjectStore::new();
        objects
            .expect_delete()
            .withf(|key| key.to_string() == "cat.jpg")
            .times(1)
            .returning(|_| Ok(true));

        let result = coordinator(store.clone(), objects)
            .delete_asset_and_analysis("cat.jpg")
            .await;

        assert!(result.asset_removed);
        assert!(result.document_removed);
        assert!(result.is_clean());
        assert!(store.document(&document_key_for("images", "cat.jpg")).is_none());
    }

    #[tokio::test]
    async fn test_document_without_asset() {
        let store = seeded_store("cat.jpg").await;
        let mut objects = MockObjectStore::new();
        objects.expect_delete().times(1).returning(|_| Ok(false));

        let result = coordinator(store, objects)
            .delete_asset_and_analysis("cat.jpg")
            .await;

        assert!(result.document_removed);
        assert!(!result.asset_removed);
        assert!(result.is_clean());
    }

    #[tokio::test]
    async fn test_second_delete_reports_nothing_removed() {
        let store = seeded_store("cat.jpg").await;
        let mut objects = MockObjectStore::new();
        objects.expect_delete().times(1).returning(|_| Ok(true));
        objects.expect_delete().times(1).returning(|_| Ok(false));

        let coordinator = coordinator(store, objects);
        coordinator.delete_asset_and_analysis("cat.jpg").await;
        let second = coordinator.delete_asset_and_analysis("cat.jpg").await;

        assert!(!second.asset_removed);
        assert!(!second.document_removed);
        assert!(second.is_clean());
    }

    #[tokio::test]
    async fn test_document_failure_still_deletes_asset_and_reports_violation() {
        let mut store = MockDocumentStore::new();
        store.expect_delete().returning(|_, _, _| {
            Err(StoreError::TransientNetwork("connection refused".to_string()))
        });
        let mut objects = MockObjectStore::new();
        objects.expect_delete().times(1).returning(|_| Ok(true));

        let result = coordinator(Arc::new(store), objects)
            .delete_asset_and_analysis("cat.jpg")
            .await;

        assert!(result.asset_removed);
        assert!(!result.document_removed);
        assert_eq!(result.errors.len(), 2);
        assert!(result.errors[1].contains("Data consistency violation"));
    }

    #[tokio::test]
    async fn test_rejected_credential_does_not_block_asset_deletion() {
        let mut store = MockDocumentStore::new();
        store
            .expect_delete()
            .times(2)
            .returning(|_, _, _| Err(AuthenticationError::Rejected { status: 401 }.into()));
        let mut objects = MockObjectStore::new();
        objects.expect_delete().times(1).returning(|_| Ok(true));

        let result = coordinator(Arc::new(store), objects)
            .delete_asset_and_analysis("cat.jpg")
            .await;

        assert!(result.asset_removed);
        assert!(result.errors[0].contains("rejected credential"));
    }

    #[tokio::test]
    async fn test_asset_failure_keeps_document_deletion() {
        let store = seeded_store("cat.jpg").await;
        let mut objects = MockObjectStore::new();
        objects
            .expect_delete()
            .returning(|_| Err(ObjectStoreError::Backend("delete failed: timeout".to_string())));

        let result = coordinator(store.clone(), objects)
            .delete_asset_and_analysis("cat.jpg")
            .await;

        assert!(result.document_removed);
        assert!(!result.asset_removed);
        assert_eq!(result.errors, vec!["image: Object store failure: delete failed: timeout"]);
    }
}
