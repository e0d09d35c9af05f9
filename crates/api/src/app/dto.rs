use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cloudtasker_core::{Job, JobStatus};
use cloudtasker_infra::TaskReceipt;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    /// A string is stored verbatim; any other JSON value as its serialized text.
    #[serde(default)]
    pub payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    #[serde(default)]
    pub result: Option<Value>,
}

/// Flatten an opaque JSON field into the text the store keeps.
/// `null`, `""`, `{}` and `[]` count as absent.
pub fn payload_text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s),
        Value::Object(map) if map.is_empty() => None,
        Value::Array(items) if items.is_empty() => None,
        other => Some(other.to_string()),
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct ReceiptResponse {
    pub job_id: i64,
    pub status: JobStatus,
}

impl From<TaskReceipt> for ReceiptResponse {
    fn from(receipt: TaskReceipt) -> Self {
        Self {
            job_id: receipt.job_id.as_i64(),
            status: receipt.status,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub job_id: i64,
    pub status: JobStatus,
    pub result: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Job> for TaskResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.as_i64(),
            status: job.status,
            result: job.result.clone(),
            created_at: rfc3339(job.created_at),
            updated_at: rfc3339(job.updated_at),
        }
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
