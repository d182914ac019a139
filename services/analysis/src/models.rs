use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic analysis document keys
const DOCUMENT_KEY_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0x1e, 0x4c, 0x2a, 0x93, 0x0d, 0x4f, 0x57, 0x8a, 0x41, 0x2f, 0xc3, 0x5d, 0x77, 0x0e, 0x19,
]);

/// An uploaded image, owned by the object store. Only metadata lives here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAsset {
    pub key: String,
    pub bucket: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub created_at: Option<DateTime<Utc>>,
}

/// Lifecycle status of an analysis document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Complete,
    Failed,
}

/// Analysis result persisted in the document store, one per image.
///
/// `complete` and `failed` documents are never updated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisDocument {
    #[serde(rename = "image_name")]
    pub image_key: String,
    pub bucket_name: String,
    pub status: AnalysisStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_results: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AnalysisDocument {
    pub fn complete(asset: &ImageAsset, results: serde_json::Value) -> Self {
        Self {
            image_key: asset.key.clone(),
            bucket_name: asset.bucket.clone(),
            status: AnalysisStatus::Complete,
            analysis_results: Some(results),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// A failed document always carries a non-empty error summary
    pub fn failed(asset: &ImageAsset, error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.trim().is_empty() {
            error = "analysis failed without detail".to_string();
        }

        Self {
            image_key: asset.key.clone(),
            bucket_name: asset.bucket.clone(),
            status: AnalysisStatus::Failed,
            analysis_results: None,
            error: Some(error),
            timestamp: Utc::now(),
        }
    }
}

/// Document key for an image: stable across redeliveries of the same upload event
pub fn document_key_for(bucket: &str, image_key: &str) -> String {
    let name = format!("{}/{}", bucket, image_key);
    Uuid::new_v5(&DOCUMENT_KEY_NAMESPACE, name.as_bytes())
        .simple()
        .to_string()
        .to_uppercase()
}

/// Content type for an image key, by extension
pub fn content_type_for(key: &str) -> &'static str {
    let extension = key.rsplit_once('.').map(|(_, ext)| ext.to_lowercase());
    match extension.as_deref() {
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(key: &str) -> ImageAsset {
        ImageAsset {
            key: key.to_string(),
            bucket: "images".to_string(),
            content_type: content_type_for(key).to_string(),
            size_bytes: 42,
            created_at: None,
        }
    }

    #[test]
    fn test_document_key_is_deterministic() {
        let first = document_key_for("images", "cat.jpg");
        let second = document_key_for("images", "cat.jpg");
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

        assert_ne!(first, document_key_for("images", "dog.jpg"));
        assert_ne!(first, document_key_for("other", "cat.jpg"));
    }

    #[test]
    fn test_document_serialization_layout() {
        let doc = AnalysisDocument::complete(&asset("cat.jpg"), serde_json::json!({"labels": ["cat"]}));
        let value = serde_json::to_value(&doc).unwrap();

        assert_eq!(value["image_name"], "cat.jpg");
        assert_eq!(value["bucket_name"], "images");
        assert_eq!(value["status"], "complete");
        assert_eq!(value["analysis_results"]["labels"][0], "cat");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_failed_document_has_error_detail() {
        let doc = AnalysisDocument::failed(&asset("dog.jpg"), "  ");
        assert_eq!(doc.status, AnalysisStatus::Failed);
        assert!(!doc.error.unwrap().is_empty());
        assert!(doc.analysis_results.is_none());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("cat.JPG"), "image/jpeg");
        assert_eq!(content_type_for("a/b/c.png"), "image/png");
        assert_eq!(content_type_for("anim.gif"), "image/gif");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }
}
