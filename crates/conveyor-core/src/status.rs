//! Status enums for workflow instances, node instances and queue jobs
//!
//! All statuses are stored as snake_case strings. Transition rules are
//! centralized here so every mutation path shares the same guard.

use serde::{Deserialize, Serialize};

/// Workflow instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Instance created but not started
    Pending,

    /// Instance is being advanced by a scheduler
    Running,

    /// Instance is paused by an operator
    Paused,

    /// Instance completed successfully (terminal)
    Completed,

    /// Instance failed (terminal)
    Failed,

    /// Instance was cancelled (terminal)
    Cancelled,

    /// Instance was stopped or its owner crashed; eligible for resume
    Interrupted,
}

impl InstanceStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition from `self` to `next` is allowed.
    ///
    /// Terminal statuses reject everything. `Interrupted` may only go back
    /// to `Running` (resume) or be cancelled.
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        if *self == next {
            return false;
        }
        match self {
            Self::Completed | Self::Failed | Self::Cancelled => false,
            Self::Pending => matches!(
                next,
                Self::Running | Self::Cancelled | Self::Failed | Self::Interrupted
            ),
            Self::Running => !matches!(next, Self::Pending),
            Self::Paused => matches!(next, Self::Running | Self::Cancelled | Self::Interrupted),
            Self::Interrupted => matches!(next, Self::Running | Self::Cancelled),
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "interrupted" => Ok(Self::Interrupted),
            other => Err(format!("unknown instance status: {}", other)),
        }
    }
}

/// Node instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Failed, but a retry has been scheduled
    FailedRetry,
    Cancelled,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }

    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        if *self == next {
            return false;
        }
        match self {
            Self::Completed | Self::Cancelled | Self::Skipped => false,
            // A failed node may still be reset to pending by the retry path.
            Self::Failed => matches!(next, Self::FailedRetry | Self::Pending),
            Self::Pending => matches!(next, Self::Running | Self::Cancelled | Self::Skipped),
            Self::Running => matches!(
                next,
                Self::Completed | Self::Failed | Self::FailedRetry | Self::Cancelled
            ),
            Self::FailedRetry => matches!(next, Self::Pending | Self::Running | Self::Cancelled),
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::FailedRetry => "failed_retry",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "failed_retry" => Ok(Self::FailedRetry),
            "cancelled" => Ok(Self::Cancelled),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown node status: {}", other)),
        }
    }
}

/// Queue job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for claiming
    Waiting,

    /// Claimed and running on a worker
    Executing,

    /// Held back by a group pause
    Paused,

    /// Not eligible until `delay_until`
    Delayed,

    /// Failed; stays in the active table so it can be retried
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Delayed => "delayed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "executing" => Ok(Self::Executing),
            "paused" => Ok(Self::Paused),
            "delayed" => Ok(Self::Delayed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Loop fan-out phase, stored inside the node's `loop_progress` JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    /// The data-source executor is being invoked and children created
    Creating,

    /// Children exist; they are being executed
    Executing,

    /// All children are terminal
    Completed,
}

/// Progress of a loop (or parallel) node's fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopProgress {
    pub status: LoopPhase,
    pub total_count: i32,
    pub completed_count: i32,
    pub failed_count: i32,
}

impl LoopProgress {
    pub fn creating() -> Self {
        Self {
            status: LoopPhase::Creating,
            total_count: 0,
            completed_count: 0,
            failed_count: 0,
        }
    }

    pub fn executing(total_count: i32) -> Self {
        Self {
            status: LoopPhase::Executing,
            total_count,
            completed_count: 0,
            failed_count: 0,
        }
    }

    /// Whether every child has reached a terminal status.
    pub fn is_settled(&self) -> bool {
        self.completed_count + self.failed_count >= self.total_count
    }
}

/// Lock type column values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Workflow,
    Node,
    Resource,
}

impl std::fmt::Display for LockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Workflow => "workflow",
            Self::Node => "node",
            Self::Resource => "resource",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for LockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(Self::Workflow),
            "node" => Ok(Self::Node),
            "resource" => Ok(Self::Resource),
            other => Err(format!("unknown lock type: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_terminal_instance_statuses_reject_transitions() {
        for terminal in [
            InstanceStatus::Completed,
            InstanceStatus::Failed,
            InstanceStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(InstanceStatus::Running));
            assert!(!terminal.can_transition_to(InstanceStatus::Pending));
        }
    }

    #[test]
    fn test_interrupted_resumes_to_running() {
        assert!(InstanceStatus::Interrupted.can_transition_to(InstanceStatus::Running));
        assert!(InstanceStatus::Interrupted.can_transition_to(InstanceStatus::Cancelled));
        assert!(!InstanceStatus::Interrupted.can_transition_to(InstanceStatus::Completed));
    }

    #[test]
    fn test_failed_node_can_reset_for_retry() {
        assert!(NodeStatus::Failed.can_transition_to(NodeStatus::Pending));
        assert!(NodeStatus::FailedRetry.can_transition_to(NodeStatus::Pending));
        assert!(!NodeStatus::Completed.can_transition_to(NodeStatus::Pending));
    }

    #[test]
    fn test_status_round_trip() {
        for s in [
            "pending",
            "running",
            "paused",
            "completed",
            "failed",
            "cancelled",
            "interrupted",
        ] {
            assert_eq!(InstanceStatus::from_str(s).unwrap().to_string(), s);
        }
        for s in ["waiting", "executing", "paused", "delayed", "failed"] {
            assert_eq!(JobStatus::from_str(s).unwrap().to_string(), s);
        }
        assert!(InstanceStatus::from_str("bogus").is_err());
    }

    #[test]
    fn test_loop_progress_settled() {
        let mut progress = LoopProgress::executing(3);
        assert!(!progress.is_settled());
        progress.completed_count = 2;
        progress.failed_count = 1;
        assert!(progress.is_settled());
    }

    #[test]
    fn test_loop_progress_serialization() {
        let progress = LoopProgress::executing(5);
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["status"], "executing");
        assert_eq!(json["totalCount"], 5);
        let parsed: LoopProgress = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, progress);
    }
}
