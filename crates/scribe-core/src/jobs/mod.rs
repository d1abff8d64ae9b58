//! Job model: kinds, payloads, options and lifecycle states.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChatId, TaskId, UserId},
    errors::Error,
    Result,
};

pub mod queue;
pub mod worker;

pub use queue::{Claimed, FailOutcome, JobQueue, JobQueues};
pub use worker::{JobHandler, WorkerConfig, WorkerPool};

/// Task kinds. Each kind has its own queue and worker pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Text,
    OcrSingle,
    OcrGroup,
    WebLink,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::Text,
        JobKind::OcrSingle,
        JobKind::OcrGroup,
        JobKind::WebLink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Text => "text",
            JobKind::OcrSingle => "ocr-single",
            JobKind::OcrGroup => "ocr-group",
            JobKind::WebLink => "web-link",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(JobKind::Text),
            "ocr-single" => Ok(JobKind::OcrSingle),
            "ocr-group" | "ocr-media-group" => Ok(JobKind::OcrGroup),
            "web-link" => Ok(JobKind::WebLink),
            other => Err(Error::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingMode {
    /// Light touch: fix typos and punctuation only.
    Optimize,
    /// Full rewrite into structured markdown.
    Process,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextJob {
    pub task_id: TaskId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub text: String,
    pub mode: ProcessingMode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrSingleJob {
    pub task_id: TaskId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub file_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrGroupJob {
    pub task_id: TaskId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub group_id: String,
    /// Arrival order.
    pub file_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebLinkJob {
    pub task_id: TaskId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobPayload {
    Text(TextJob),
    OcrSingle(OcrSingleJob),
    OcrGroup(OcrGroupJob),
    WebLink(WebLinkJob),
}

impl JobPayload {
    /// Decode a raw payload for `kind`. Shape mismatches are permanent input failures.
    pub fn from_value(kind: JobKind, value: serde_json::Value) -> Result<Self> {
        let bad = |e: serde_json::Error| Error::InvalidPayload(format!("{kind}: {e}"));
        Ok(match kind {
            JobKind::Text => JobPayload::Text(serde_json::from_value(value).map_err(bad)?),
            JobKind::OcrSingle => {
                JobPayload::OcrSingle(serde_json::from_value(value).map_err(bad)?)
            }
            JobKind::OcrGroup => JobPayload::OcrGroup(serde_json::from_value(value).map_err(bad)?),
            JobKind::WebLink => JobPayload::WebLink(serde_json::from_value(value).map_err(bad)?),
        })
    }

    /// Wire shape of the payload, the inverse of [`JobPayload::from_value`].
    pub fn to_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            JobPayload::Text(j) => serde_json::to_value(j),
            JobPayload::OcrSingle(j) => serde_json::to_value(j),
            JobPayload::OcrGroup(j) => serde_json::to_value(j),
            JobPayload::WebLink(j) => serde_json::to_value(j),
        };
        Ok(value?)
    }

    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Text(_) => JobKind::Text,
            JobPayload::OcrSingle(_) => JobKind::OcrSingle,
            JobPayload::OcrGroup(_) => JobKind::OcrGroup,
            JobPayload::WebLink(_) => JobKind::WebLink,
        }
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            JobPayload::Text(j) => &j.task_id,
            JobPayload::OcrSingle(j) => &j.task_id,
            JobPayload::OcrGroup(j) => &j.task_id,
            JobPayload::WebLink(j) => &j.task_id,
        }
    }

    pub fn chat_id(&self) -> ChatId {
        match self {
            JobPayload::Text(j) => j.chat_id,
            JobPayload::OcrSingle(j) => j.chat_id,
            JobPayload::OcrGroup(j) => j.chat_id,
            JobPayload::WebLink(j) => j.chat_id,
        }
    }

    pub fn user_id(&self) -> UserId {
        match self {
            JobPayload::Text(j) => j.user_id,
            JobPayload::OcrSingle(j) => j.user_id,
            JobPayload::OcrGroup(j) => j.user_id,
            JobPayload::WebLink(j) => j.user_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackoffPolicy {
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`.
    Exponential { base: Duration },
}

impl BackoffPolicy {
    /// Delay before the retry that follows failed attempt number `attempts_made` (1-based).
    pub fn delay(&self, attempts_made: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed(d) => d,
            BackoffPolicy::Exponential { base } => {
                let exp = attempts_made.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << exp)
            }
        }
    }
}

/// Bounds on how long terminal jobs stay visible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    pub max_age: Option<Duration>,
    pub max_count: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobOptions {
    /// Caller-chosen id; enqueueing an id that is already known returns the existing job.
    pub job_id: Option<String>,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub remove_on_complete: RetentionPolicy,
    pub remove_on_fail: RetentionPolicy,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            max_attempts: 3,
            backoff: BackoffPolicy::Exponential {
                base: Duration::from_millis(2000),
            },
            remove_on_complete: RetentionPolicy {
                max_age: Some(Duration::from_secs(60 * 60)),
                max_count: Some(1000),
            },
            remove_on_fail: RetentionPolicy {
                max_age: Some(Duration::from_secs(24 * 60 * 60)),
                max_count: None,
            },
        }
    }
}

impl JobOptions {
    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Waiting,
    /// Waiting for a retry backoff to elapse.
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

#[derive(Clone, Debug)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub return_value: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobHandle {
    pub id: JobId,
    pub kind: JobKind,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: usize,
    pub active: usize,
    pub delayed: usize,
    pub completed: usize,
    pub failed: usize,
}
