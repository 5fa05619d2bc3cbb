use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

use crate::error::{ConductorError, Result};
use crate::store::{Job, JobState};

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub payload: Box<RawValue>,
    pub max_attempts: i32,
    pub timeout_seconds: i32,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub state: JobState,
}

#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub state: JobState,
    pub payload: Box<RawValue>,
    pub max_attempts: i32,
    pub current_attempt: i32,
    pub timeout_seconds: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<Job> for JobResponse {
    type Error = ConductorError;

    fn try_from(job: Job) -> Result<Self> {
        // Payloads only enter through the submit endpoint, so they are JSON;
        // hand them back verbatim rather than re-encoding.
        let payload = String::from_utf8(job.payload)
            .map_err(|_| ConductorError::Internal("job payload is not valid UTF-8".into()))?;
        let payload = RawValue::from_string(payload)
            .map_err(|_| ConductorError::Internal("job payload is not valid JSON".into()))?;

        Ok(Self {
            job_id: job.id,
            state: job.state,
            payload,
            max_attempts: job.max_attempts,
            current_attempt: job.current_attempt,
            timeout_seconds: job.timeout_seconds,
            last_error: job.last_error,
            created_at: job.created_at,
            updated_at: job.updated_at,
            cancelled_at: job.cancelled_at,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<JobResponse>,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    pub state: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AcquireLeaseRequest {
    pub scheduler_id: Uuid,
    pub lease_duration_seconds: i64,
}

#[derive(Debug, Serialize)]
pub struct AcquireLeaseResponse {
    pub job_id: Uuid,
    pub lease_expires_at: DateTime<Utc>,
}

/// Response for the internal start/complete/fail transitions, reporting the
/// state the job was left in.
#[derive(Debug, Serialize)]
pub struct JobStateResponse {
    pub job_id: Uuid,
    pub state: JobState,
}

#[derive(Debug, Deserialize)]
pub struct FailJobRequest {
    pub error: String,
    #[serde(default)]
    pub retryable: bool,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default = "default_capacity")]
    pub capacity: i32,
}

fn default_capacity() -> i32 {
    1
}
