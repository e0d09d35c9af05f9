//! Wire format of job notifications.
//!
//! ```text
//! {"kind":"dispatch","job_id":1,"payload":"payload-A"}
//! {"kind":"completion","job_id":1,"status":"SUCCEEDED","result":"result-A"}
//! ```
//!
//! Every message carries the job id so consumers can deduplicate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cloudtasker_core::{Job, JobId, JobStatus, OutboxKind};

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to encode message: {0}")]
    Encode(serde_json::Error),

    #[error("failed to decode message: {0}")]
    Decode(serde_json::Error),
}

/// A notification about a job, as published on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobMessage {
    /// The job is recorded and ready for processing.
    Dispatch { job_id: JobId, payload: String },
    /// The job reached a terminal status.
    Completion {
        job_id: JobId,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
    },
}

impl JobMessage {
    pub fn dispatch(job: &Job) -> Self {
        Self::Dispatch {
            job_id: job.id,
            payload: job.payload.clone(),
        }
    }

    pub fn completion(job: &Job) -> Self {
        Self::Completion {
            job_id: job.id,
            status: job.status,
            result: job.result.clone(),
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            JobMessage::Dispatch { job_id, .. } | JobMessage::Completion { job_id, .. } => *job_id,
        }
    }

    pub fn kind(&self) -> OutboxKind {
        match self {
            JobMessage::Dispatch { .. } => OutboxKind::Dispatch,
            JobMessage::Completion { .. } => OutboxKind::Completion,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(bytes).map_err(MessageError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pending(id: i64, payload: &str) -> Job {
        Job::new(JobId::from_i64(id), payload, Utc::now())
    }

    #[test]
    fn dispatch_message_wire_shape() {
        let msg = JobMessage::dispatch(&pending(1, "payload-A"));
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "dispatch", "job_id": 1, "payload": "payload-A"})
        );
    }

    #[test]
    fn completion_message_decodes() {
        let bytes = br#"{"kind":"completion","job_id":3,"status":"FAILED","result":"boom"}"#;
        let msg = JobMessage::decode(bytes).unwrap();
        assert_eq!(msg.job_id(), JobId::from_i64(3));
        assert_eq!(msg.kind(), OutboxKind::Completion);
        assert_eq!(
            msg,
            JobMessage::Completion {
                job_id: JobId::from_i64(3),
                status: JobStatus::Failed,
                result: Some("boom".into()),
            }
        );
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            JobMessage::decode(b"not json"),
            Err(MessageError::Decode(_))
        ));
    }
}
