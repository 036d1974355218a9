//! Sandbox wire protocol
//!
//! Newline-delimited JSON frames over the child's stdin/stdout:
//!
//! ```text
//! child → parent   {"type":"ready"}
//! parent → child   {"type":"execute","jobId":...,"name":...,"data":...}
//! child → parent   {"type":"progress","jobId":...,"data":...}
//! child → parent   {"type":"result","jobId":...,"data":...}
//! child → parent   {"type":"error","jobId":...,"error":{...}}
//! parent → child   {"type":"shutdown"}
//! ```
//!
//! One frame per line; frames never contain raw newlines (serde_json
//! escapes them).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Structured error payload carried by an `error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameError {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl FrameError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

/// A protocol frame, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    /// Child is initialized and accepting work.
    Ready,

    /// Run the named executor with the given input.
    #[serde(rename_all = "camelCase")]
    Execute {
        job_id: Uuid,
        name: String,
        data: serde_json::Value,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<serde_json::Value>,
    },

    /// Intermediate progress for a running job.
    #[serde(rename_all = "camelCase")]
    Progress {
        job_id: Uuid,
        data: serde_json::Value,
    },

    /// Successful completion.
    #[serde(rename_all = "camelCase")]
    Result {
        job_id: Uuid,
        data: serde_json::Value,
    },

    /// Failure.
    #[serde(rename_all = "camelCase")]
    Error { job_id: Uuid, error: FrameError },

    /// Parent asks the child to exit cleanly.
    Shutdown,
}

impl Frame {
    /// Encode as one protocol line (no trailing newline).
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode one protocol line.
    pub fn decode(line: &str) -> Result<Frame, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// The job this frame belongs to, if any.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Frame::Execute { job_id, .. }
            | Frame::Progress { job_id, .. }
            | Frame::Result { job_id, .. }
            | Frame::Error { job_id, .. } => Some(*job_id),
            Frame::Ready | Frame::Shutdown => None,
        }
    }
}
