//! Object-created notifications delivered by the event service.

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

/// Event type emitted when an object is written to the bucket
pub const OBJECT_CREATED_EVENT: &str = "com.oraclecloud.objectstorage.createobject";

/// Errors parsing an incoming notification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Failed to parse event: {0}")]
    Malformed(String),

    #[error("Missing object name in event")]
    MissingObjectName,
}

/// A parsed object-created notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCreatedEvent {
    pub object_name: String,
    pub bucket_name: Option<String>,
    pub namespace: Option<String>,
    pub event_id: Option<String>,
}

/// Outcome of parsing a notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ObjectCreated(ObjectCreatedEvent),
    /// Any other event type; acknowledged without processing
    Ignored { event_type: String },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudEvent {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    data: EventData,
    #[serde(default)]
    resource_name: Option<String>,
    #[serde(default)]
    object_name: Option<String>,
    #[serde(default)]
    resource_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventData {
    #[serde(default, deserialize_with = "null_as_default")]
    additional_details: AdditionalDetails,
    #[serde(default)]
    object_name: Option<String>,
    #[serde(default)]
    resource_name: Option<String>,
    #[serde(default)]
    resource_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdditionalDetails {
    #[serde(default)]
    object_name: Option<String>,
    #[serde(default)]
    bucket_name: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
}

impl Notification {
    pub fn from_slice(payload: &[u8]) -> Result<Self, EventError> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| EventError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EventError> {
        let event: CloudEvent =
            serde_json::from_value(value).map_err(|e| EventError::Malformed(e.to_string()))?;

        if event.event_type != OBJECT_CREATED_EVENT {
            return Ok(Notification::Ignored {
                event_type: event.event_type,
            });
        }

        // The object name shows up in different places depending on the emitter
        let candidates = [
            event.data.additional_details.object_name.as_deref(),
            event.data.object_name.as_deref(),
            event.data.resource_name.as_deref(),
            event.resource_name.as_deref(),
            event.object_name.as_deref(),
        ];

        let object_name = candidates
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|name| !name.is_empty())
            .map(String::from)
            .or_else(|| {
                event
                    .data
                    .resource_id
                    .as_deref()
                    .or(event.resource_id.as_deref())
                    .and_then(object_from_resource_id)
            })
            .ok_or(EventError::MissingObjectName)?;

        Ok(Notification::ObjectCreated(ObjectCreatedEvent {
            object_name,
            bucket_name: non_empty(event.data.additional_details.bucket_name),
            namespace: non_empty(event.data.additional_details.namespace),
            event_id: event.event_id,
        }))
    }
}

/// Some emitters send `null` for sections they leave empty
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `/n/{namespace}/b/{bucket}/o/{object}` -> object name
fn object_from_resource_id(resource_id: &str) -> Option<String> {
    let (_, object) = resource_id.split_once("/o/")?;
    let object = object.trim();
    (!object.is_empty()).then(|| object.to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
