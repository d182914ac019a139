//! Image analysis capability.
//!
//! The vision service is external. [`VisionClient`] posts an analyze-image
//! request over HTTP and shapes the detected objects into the stored
//! `{"objects": [...]}` layout.

use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::models::ImageAsset;
use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, instrument};

/// What to analyze: an object storage reference, optionally with the bytes
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub asset: ImageAsset,
    pub namespace: String,
    pub image_bytes: Option<Vec<u8>>,
}

/// Produces a JSON analysis result for an image
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnalysisCapability: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Value, AnalysisError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeImageBody<'a> {
    features: Vec<Feature>,
    image: ImageDetails<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    compartment_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Feature {
    feature_type: &'static str,
    max_results: u32,
}

#[derive(Debug, Serialize)]
#[serde(tag = "source")]
enum ImageDetails<'a> {
    #[serde(rename = "OBJECT_STORAGE", rename_all = "camelCase")]
    ObjectStorage {
        namespace_name: &'a str,
        bucket_name: &'a str,
        object_name: &'a str,
    },
    #[serde(rename = "INLINE")]
    Inline { data: String },
}

/// HTTP client for the analyze-image endpoint
pub struct VisionClient {
    http: reqwest::Client,
    endpoint: String,
    compartment_id: Option<String>,
    max_results: u32,
    timeout: Duration,
}

impl VisionClient {
    pub fn new(config: &AnalysisConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build vision HTTP client")?;

        Ok(Self {
            http,
            endpoint: config.endpoint_url.clone(),
            compartment_id: config.compartment_id.clone(),
            max_results: config.max_results,
            timeout,
        })
    }

    fn body<'a>(&'a self, request: &'a AnalysisRequest) -> AnalyzeImageBody<'a> {
        let image = match &request.image_bytes {
            Some(bytes) => ImageDetails::Inline {
                data: STANDARD.encode(bytes),
            },
            None => ImageDetails::ObjectStorage {
                namespace_name: &request.namespace,
                bucket_name: &request.asset.bucket,
                object_name: &request.asset.key,
            },
        };

        AnalyzeImageBody {
            features: vec![Feature {
                feature_type: "OBJECT_DETECTION",
                max_results: self.max_results,
            }],
            image,
            compartment_id: self.compartment_id.as_deref(),
        }
    }
}

#[async_trait]
impl AnalysisCapability for VisionClient {
    #[instrument(skip(self, request), fields(image_key = %request.asset.key))]
    async fn analyze(&self, request: &AnalysisRequest) -> Result<Value, AnalysisError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AnalysisError::Timeout(self.timeout.as_secs())
                } else {
                    AnalysisError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AnalysisError::RemoteService {
                status: status.as_u16(),
                message,
            });
        }

        let raw: Value = response
            .json()
            .await
            .map_err(|e| AnalysisError::InvalidResponse(e.to_string()))?;

        let shaped = shape_results(raw);
        debug!(
            objects = shaped["objects"].as_array().map(|o| o.len()).unwrap_or(0),
            "Analysis response received"
        );
        Ok(shaped)
    }
}

/// Convert a vision response with `imageObjects` into the stored layout.
/// Responses without `imageObjects` pass through unchanged.
pub fn shape_results(raw: Value) -> Value {
    let Some(objects) = raw.get("imageObjects").and_then(Value::as_array) else {
        return raw;
    };

    let objects: Vec<Value> = objects
        .iter()
        .map(|obj| {
            json!({
                "name": obj.get("name").cloned().unwrap_or(Value::Null),
                "confidence": obj.get("confidence").and_then(Value::as_f64),
                "bounding_box": bounding_box(obj),
            })
        })
        .collect();

    json!({ "objects": objects })
}

fn bounding_box(obj: &Value) -> Value {
    let vertices = obj
        .pointer("/boundingPolygon/normalizedVertices")
        .and_then(Value::as_array);

    let point = |v: &Value| -> Option<(f64, f64)> {
        Some((v.get("x")?.as_f64()?, v.get("y")?.as_f64()?))
    };

    match vertices.and_then(|v| Some((point(v.first()?)?, point(v.get(2)?)?))) {
        Some(((left, top), (right, bottom))) => json!({
            "left": left,
            "top": top,
            "width": (right - left).abs(),
            "height": (bottom - top).abs(),
        }),
        None => Value::Null,
    }
}
