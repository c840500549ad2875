//! Pipeline requests and the aggregated status map returned for them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::stage::Stage;
use super::task::StageState;
use crate::error::StageError;

/// Overall status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    #[default]
    Created,
    Processing,
    PartialFailure,
    Completed,
    Failed,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestStatus::Created => write!(f, "created"),
            RequestStatus::Processing => write!(f, "processing"),
            RequestStatus::PartialFailure => write!(f, "partial_failure"),
            RequestStatus::Completed => write!(f, "completed"),
            RequestStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One end-to-end submission spanning all stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    #[serde(default = "new_request_id")]
    pub id: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub docs_source: String,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunking_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<String>,
    #[serde(rename = "vectorDB", default, skip_serializing_if = "Option::is_none")]
    pub vector_db: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<String>,
    #[serde(default)]
    pub status: RequestStatus,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl PipelineRequest {
    pub fn new(
        id: impl Into<String>,
        domain: impl Into<String>,
        docs_source: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            domain: domain.into(),
            docs_source: docs_source.into(),
            queries: Vec::new(),
            text_data: None,
            chunking_method: None,
            embedding: None,
            vector_db: None,
            rag_text: None,
            llm: None,
            status: RequestStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder method to set the queries.
    pub fn with_queries(mut self, queries: Vec<String>) -> Self {
        self.queries = queries;
        self
    }

    /// Builder method to set inline text.
    pub fn with_text_data(mut self, text: impl Into<String>) -> Self {
        self.text_data = Some(text.into());
        self
    }

    /// Checks the fields every stage relies on.
    pub fn validate(&self) -> Result<(), StageError> {
        for (name, value) in [
            ("id", &self.id),
            ("domain", &self.domain),
            ("docsSource", &self.docs_source),
        ] {
            if value.trim().is_empty() {
                return Err(StageError::MalformedInput(format!(
                    "request is missing required field '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn set_status(&mut self, status: RequestStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Final view of one stage in a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub state: StageState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Aggregated outcome of a request, one entry per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMap {
    pub request_id: String,
    pub status: RequestStatus,
    pub stages: BTreeMap<Stage, StageReport>,
}

impl StatusMap {
    pub fn state(&self, stage: Stage) -> Option<StageState> {
        self.stages.get(&stage).map(|report| report.state)
    }

    pub fn error(&self, stage: Stage) -> Option<&str> {
        self.stages.get(&stage).and_then(|report| report.error.as_deref())
    }

    pub fn result(&self, stage: Stage) -> Option<&Value> {
        self.stages.get(&stage).and_then(|report| report.result.as_ref())
    }

    /// Derives the request status from terminal stage states.
    pub fn outcome<'a>(states: impl IntoIterator<Item = &'a StageState>) -> RequestStatus {
        let (mut completed, mut total) = (0usize, 0usize);
        for state in states {
            total += 1;
            if *state == StageState::Completed {
                completed += 1;
            }
        }

        if total > 0 && completed == total {
            RequestStatus::Completed
        } else if completed == 0 {
            RequestStatus::Failed
        } else {
            RequestStatus::PartialFailure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_json_shape() {
        let raw = json!({
            "id": "p-1",
            "domain": "medical",
            "docsSource": "/data/papers",
            "queries": ["q1"],
            "vectorDB": "qdrant",
            "ragText": "ctx"
        });
        let request: PipelineRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.docs_source, "/data/papers");
        assert_eq!(request.vector_db.as_deref(), Some("qdrant"));
        assert_eq!(request.rag_text.as_deref(), Some("ctx"));
        assert_eq!(request.status, RequestStatus::Created);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_missing_id_is_generated() {
        let request: PipelineRequest =
            serde_json::from_value(json!({"domain": "d", "docsSource": "s"})).unwrap();
        assert!(uuid::Uuid::parse_str(&request.id).is_ok());
    }

    #[test]
    fn test_validate_required_fields() {
        let err = PipelineRequest::new("p-1", "", "/docs").validate().unwrap_err();
        assert!(err.to_string().contains("domain"));

        let err = PipelineRequest::new("p-1", "legal", "  ").validate().unwrap_err();
        assert!(err.to_string().contains("docsSource"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_outcome_aggregation() {
        use StageState::*;
        assert_eq!(StatusMap::outcome(&[Completed, Completed]), RequestStatus::Completed);
        assert_eq!(StatusMap::outcome(&[Completed, Failed, Skipped]), RequestStatus::PartialFailure);
        assert_eq!(StatusMap::outcome(&[Failed, Skipped]), RequestStatus::Failed);
    }
}
