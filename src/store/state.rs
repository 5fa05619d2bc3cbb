use serde::{Deserialize, Serialize};

use crate::error::ConductorError;

/// Lifecycle state of a job.
///
/// All state mutations are funnelled through the transition gate; any direct
/// update of a job's state outside the gate is a correctness bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Scheduled,
        JobState::Running,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    /// Terminal jobs are immutable apart from observational metadata.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Scheduled => "SCHEDULED",
            JobState::Running => "RUNNING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = ConductorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "PENDING" => Ok(JobState::Pending),
            "SCHEDULED" => Ok(JobState::Scheduled),
            "RUNNING" => Ok(JobState::Running),
            "COMPLETED" => Ok(JobState::Completed),
            "FAILED" => Ok(JobState::Failed),
            "CANCELLED" => Ok(JobState::Cancelled),
            other => Err(ConductorError::Internal(format!(
                "unknown job state: {other}"
            ))),
        }
    }
}

/// The allowed-transition table.
///
/// RUNNING -> PENDING is the sanctioned recovery edge for jobs whose worker
/// died mid-execution; recovery goes through the gate like every other
/// mutation rather than bypassing it.
pub fn is_transition_allowed(from: JobState, to: JobState) -> bool {
    use JobState::*;

    matches!(
        (from, to),
        (Pending, Scheduled)
            | (Pending, Cancelled)
            | (Scheduled, Running)
            | (Scheduled, Pending)
            | (Scheduled, Cancelled)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Running, Pending)
            | (Failed, Pending)
    )
}
