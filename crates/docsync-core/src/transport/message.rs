//! Service protocol message types
//!
//! Requests and responses exchanged with the analysis service, as JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};

/// Incremental edit sent in place of the whole document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub delta_offset: usize,
    pub delta_replace_length: usize,
    pub delta_text: String,
}

/// A request addressed to one resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceRequest {
    pub resource: String,
    #[serde(flatten)]
    pub kind: RequestKind,
}

/// Service-specific part of a request, tagged by `serviceType`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "serviceType", rename_all = "camelCase")]
pub enum RequestKind {
    #[serde(rename_all = "camelCase")]
    Update {
        #[serde(skip_serializing_if = "Option::is_none")]
        full_text: Option<String>,
        #[serde(flatten)]
        delta: Option<Delta>,
        #[serde(skip_serializing_if = "Option::is_none")]
        required_state_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Assist {
        caret_offset: usize,
        proposals_limit: usize,
        required_state_id: String,
        #[serde(flatten)]
        delta: Option<Delta>,
    },

    #[serde(rename_all = "camelCase")]
    Format {
        selection_start: usize,
        selection_end: usize,
        required_state_id: String,
    },

    #[serde(rename_all = "camelCase")]
    Hover {
        caret_offset: usize,
        expected_state_id: String,
    },

    #[serde(rename_all = "camelCase")]
    Occurrences {
        caret_offset: usize,
        expected_state_id: String,
    },
}

impl RequestKind {
    /// Wire name of the service
    pub fn service_type(&self) -> &'static str {
        match self {
            RequestKind::Update { .. } => "update",
            RequestKind::Assist { .. } => "assist",
            RequestKind::Format { .. } => "format",
            RequestKind::Hover { .. } => "hover",
            RequestKind::Occurrences { .. } => "occurrences",
        }
    }

    /// State id the request assumes on the server, if any
    pub fn assumed_state_id(&self) -> Option<&str> {
        match self {
            RequestKind::Update {
                required_state_id, ..
            } => required_state_id.as_deref(),
            RequestKind::Assist {
                required_state_id, ..
            }
            | RequestKind::Format {
                required_state_id, ..
            } => Some(required_state_id),
            RequestKind::Hover {
                expected_state_id, ..
            }
            | RequestKind::Occurrences {
                expected_state_id, ..
            } => Some(expected_state_id),
        }
    }
}

impl ServiceRequest {
    /// Replace the whole document on the server
    pub fn full_text_update(resource: &str, full_text: String) -> Self {
        Self {
            resource: resource.to_string(),
            kind: RequestKind::Update {
                full_text: Some(full_text),
                delta: None,
                required_state_id: None,
            },
        }
    }

    /// Apply a delta on top of `required_state_id`
    pub fn delta_update(resource: &str, required_state_id: String, delta: Delta) -> Self {
        Self {
            resource: resource.to_string(),
            kind: RequestKind::Update {
                full_text: None,
                delta: Some(delta),
                required_state_id: Some(required_state_id),
            },
        }
    }

    pub fn assist(
        resource: &str,
        caret_offset: usize,
        proposals_limit: usize,
        required_state_id: String,
        delta: Option<Delta>,
    ) -> Self {
        Self {
            resource: resource.to_string(),
            kind: RequestKind::Assist {
                caret_offset,
                proposals_limit,
                required_state_id,
                delta,
            },
        }
    }

    pub fn format(
        resource: &str,
        selection_start: usize,
        selection_end: usize,
        required_state_id: String,
    ) -> Self {
        Self {
            resource: resource.to_string(),
            kind: RequestKind::Format {
                selection_start,
                selection_end,
                required_state_id,
            },
        }
    }

    pub fn hover(resource: &str, caret_offset: usize, expected_state_id: String) -> Self {
        Self {
            resource: resource.to_string(),
            kind: RequestKind::Hover {
                caret_offset,
                expected_state_id,
            },
        }
    }

    pub fn occurrences(resource: &str, caret_offset: usize, expected_state_id: String) -> Self {
        Self {
            resource: resource.to_string(),
            kind: RequestKind::Occurrences {
                caret_offset,
                expected_state_id,
            },
        }
    }

    pub fn service_type(&self) -> &'static str {
        self.kind.service_type()
    }
}

/// Acknowledged document state
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStateResult {
    pub state_id: String,
}

/// A contiguous region of the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextRegion {
    pub offset: usize,
    pub length: usize,
}

impl TextRegion {
    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// Extra replacement applied together with a proposal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceRegion {
    pub offset: usize,
    pub length: usize,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentAssistEntry {
    pub prefix: String,
    pub proposal: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub documentation: Option<String>,
    #[serde(default)]
    pub escape_position: Option<usize>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub text_replacements: Vec<ReplaceRegion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentAssistResult {
    pub state_id: String,
    pub entries: Vec<ContentAssistEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormattingResult {
    pub state_id: String,
    pub formatted_text: String,
    #[serde(default)]
    pub replace_region: Option<TextRegion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoverResult {
    pub state_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OccurrencesResult {
    pub state_id: String,
    #[serde(default)]
    pub write_regions: Vec<TextRegion>,
    #[serde(default)]
    pub read_regions: Vec<TextRegion>,
}

/// Marker carried by conflict responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictKind {
    /// The assumed state id is stale; resynchronize with the full text
    InvalidStateId,
    /// The server abandoned the request
    Canceled,
}

#[derive(Deserialize)]
struct ConflictResult {
    conflict: ConflictKind,
}

/// Extract the conflict marker from a response, if any
pub fn conflict_of(response: &Value) -> Option<ConflictKind> {
    if response.get("conflict").is_none() {
        return None;
    }
    ConflictResult::deserialize(response)
        .ok()
        .map(|result| result.conflict)
}

/// A response that is either the expected result or a conflict
#[derive(Debug, Clone, PartialEq)]
pub enum Response<T> {
    Ok(T),
    Conflict(ConflictKind),
}

/// Interpret a raw response
///
/// A conflict marker wins over everything else in the payload; without one
/// the payload must parse as `T`.
pub fn parse_response<T: DeserializeOwned>(
    service: &'static str,
    response: Value,
) -> SyncResult<Response<T>> {
    if let Some(kind) = conflict_of(&response) {
        return Ok(Response::Conflict(kind));
    }
    if response.get("conflict").is_some() {
        return Err(SyncError::protocol(service, "unknown conflict marker"));
    }
    serde_json::from_value(response)
        .map(Response::Ok)
        .map_err(|e| SyncError::protocol(service, e.to_string()))
}

/// Message pushed by the server outside any request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub resource: String,
    pub push_service: String,
    pub push: Value,
}
