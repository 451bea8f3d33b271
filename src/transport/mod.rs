pub mod rest;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::transport::rest::RestError;

/// Human-readable field used to resolve a record id through a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaturalKey {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordTarget {
    Id {
        #[serde(rename = "recordId")]
        record_id: String,
    },
    NaturalKey {
        lookup: NaturalKey,
    },
}

/// One partial update, consumed exactly once by an updater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub object_type: String,
    #[serde(flatten)]
    pub target: RecordTarget,
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl UpdateRequest {
    pub fn by_id(object_type: &str, record_id: &str, fields: Map<String, Value>) -> Self {
        Self {
            object_type: object_type.to_string(),
            target: RecordTarget::Id {
                record_id: record_id.to_string(),
            },
            fields,
            metadata: Map::new(),
        }
    }

    pub fn by_natural_key(
        object_type: &str,
        field: &str,
        value: &str,
        fields: Map<String, Value>,
    ) -> Self {
        Self {
            object_type: object_type.to_string(),
            target: RecordTarget::NaturalKey {
                lookup: NaturalKey {
                    field: field.to_string(),
                    value: value.to_string(),
                },
            },
            fields,
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// The record id when it is known without a lookup.
    pub fn record_id(&self) -> Option<&str> {
        match &self.target {
            RecordTarget::Id { record_id } => Some(record_id),
            RecordTarget::NaturalKey { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeError {
    Http { status: u16, body: Value },
    NoResponse { message: String },
    NotFound { field: String, value: String },
    Other { message: String },
}

impl OutcomeError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::NotFound { .. } => Some(404),
            Self::NoResponse { .. } | Self::Other { .. } => None,
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

impl fmt::Display for OutcomeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { status, body } => write!(f, "HTTP {status}: {body}"),
            Self::NoResponse { message } => write!(f, "no response: {message}"),
            Self::NotFound { field, value } => write!(f, "no record with {field} = {value:?}"),
            Self::Other { message } => f.write_str(message),
        }
    }
}

impl From<RestError> for OutcomeError {
    fn from(err: RestError) -> Self {
        match err {
            RestError::Status { status, body } => Self::Http { status, body },
            RestError::NoResponse(message) => Self::NoResponse { message },
            RestError::Other(message) => Self::Other { message },
        }
    }
}

/// The recorded result of one attempted update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub success: bool,
    pub object_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    pub update_data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
}

impl UpdateOutcome {
    pub fn succeeded(request: &UpdateRequest, record_id: &str, status: u16) -> Self {
        Self {
            success: true,
            object_type: request.object_type.clone(),
            record_id: Some(record_id.to_string()),
            update_data: request.fields.clone(),
            metadata: request.metadata.clone(),
            timestamp: Utc::now(),
            status_code: Some(status),
            error: None,
        }
    }

    pub fn failed(request: &UpdateRequest, record_id: Option<&str>, error: OutcomeError) -> Self {
        Self {
            success: false,
            object_type: request.object_type.clone(),
            record_id: record_id.map(String::from),
            update_data: request.fields.clone(),
            metadata: request.metadata.clone(),
            timestamp: Utc::now(),
            status_code: error.status(),
            error: Some(error),
        }
    }
}
