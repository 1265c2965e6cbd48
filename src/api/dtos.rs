use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{Job, JobItem, JobPhase, JobStatus, JobType, MessageKind};

#[derive(Debug, Deserialize)]
pub struct CreateJobBody {
    pub tenant: String,
    pub job_type: JobType,
    pub language: String,
    #[serde(default = "default_true")]
    pub meta_title: bool,
    #[serde(default = "default_true")]
    pub meta_description: bool,
    #[serde(default)]
    pub generation_hints: Value,
    #[serde(default)]
    pub pro_plan: bool,
    pub targets: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub tenant: String,
    pub status: Option<JobStatus>,
    pub phase: Option<JobPhase>,
    pub job_type: Option<JobType>,
    /// Free-text match against the job id.
    pub q: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JobDetailResponse {
    pub job: Job,
    pub items: Vec<JobItem>,
}

#[derive(Debug, Deserialize)]
pub struct RetryBody {
    pub phase: MessageKind,
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub retried: u64,
}

#[derive(Debug, Deserialize, Default)]
pub struct PublishBody {
    pub item_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub apply_only_changed: bool,
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub queued: u64,
}

#[derive(Debug, Serialize)]
pub struct ClearTenantResponse {
    pub removed: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
