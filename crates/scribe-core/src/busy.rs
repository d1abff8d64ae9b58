//! Per-user busy record.
//!
//! One record per user (`u:{id}:task`), owned by the task currently being processed.
//! The record always carries an expiry so a crashed worker cannot leave a user
//! stuck as busy.

use std::{fmt, sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    domain::{TaskId, UserId},
    store::{keys, KeyValueStore},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Ocr,
    Llm,
    WebFetch,
    Sending,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Ocr => "OCR",
            Phase::Llm => "LLM",
            Phase::WebFetch => "WEB_FETCH",
            Phase::Sending => "SENDING",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusyState {
    Idle,
    Busy,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusyRecord {
    pub state: BusyState,
    pub task_id: TaskId,
    pub phase: Phase,
    /// Unix millis.
    pub started_at: i64,
    /// Unix millis.
    pub last_heartbeat: i64,
}

#[derive(Clone, Copy, Debug)]
pub struct BusyConfig {
    /// Crash-recovery fuse: the record disappears this long after the last write.
    pub ttl: Duration,
    /// How often a waiting task re-checks whether the user became free.
    pub acquire_poll: Duration,
}

impl Default for BusyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            acquire_poll: Duration::from_millis(250),
        }
    }
}

#[derive(Clone)]
pub struct BusyTracker {
    store: Arc<dyn KeyValueStore>,
    cfg: BusyConfig,
}

impl BusyTracker {
    pub fn new(store: Arc<dyn KeyValueStore>, cfg: BusyConfig) -> Self {
        Self { store, cfg }
    }

    /// Mark `user_id` busy with `task_id`, waiting while another task owns the record.
    ///
    /// A redelivered task that already owns the record takes it over again.
    pub async fn acquire(&self, user_id: UserId, task_id: &TaskId, phase: Phase) -> Result<BusyGuard> {
        let key = keys::busy(user_id);
        let mut logged_wait = false;
        loop {
            let now = Utc::now().timestamp_millis();
            let record = BusyRecord {
                state: BusyState::Busy,
                task_id: task_id.clone(),
                phase,
                started_at: now,
                last_heartbeat: now,
            };
            let json = serde_json::to_string(&record)?;
            if self.store.set_nx(&key, &json, Some(self.cfg.ttl)).await? {
                return Ok(self.guard(user_id, task_id));
            }

            match self.status(user_id).await? {
                None => continue,
                Some(existing) if existing.task_id == *task_id => {
                    self.mark_busy(user_id, task_id, phase).await?;
                    return Ok(self.guard(user_id, task_id));
                }
                Some(existing) => {
                    if !logged_wait {
                        debug!(
                            user_id = user_id.0,
                            task_id = %task_id,
                            owner = %existing.task_id,
                            "user busy, waiting for previous task"
                        );
                        logged_wait = true;
                    }
                    tokio::time::sleep(self.cfg.acquire_poll).await;
                }
            }
        }
    }

    fn guard(&self, user_id: UserId, task_id: &TaskId) -> BusyGuard {
        BusyGuard {
            tracker: self.clone(),
            user_id,
            task_id: task_id.clone(),
            released: false,
        }
    }

    /// Switch the owned record to `phase`, keeping `started_at`. `false` if not the owner.
    pub async fn mark_busy(&self, user_id: UserId, task_id: &TaskId, phase: Phase) -> Result<bool> {
        let Some(mut record) = self.owned(user_id, task_id).await? else {
            return Ok(false);
        };
        record.phase = phase;
        record.last_heartbeat = Utc::now().timestamp_millis();
        self.write(user_id, &record).await?;
        Ok(true)
    }

    /// Refresh liveness and expiry. `false` if not the owner.
    pub async fn heartbeat(&self, user_id: UserId, task_id: &TaskId) -> Result<bool> {
        let Some(mut record) = self.owned(user_id, task_id).await? else {
            return Ok(false);
        };
        record.last_heartbeat = Utc::now().timestamp_millis();
        self.write(user_id, &record).await?;
        Ok(true)
    }

    /// Delete the record if `task_id` owns it.
    pub async fn clear(&self, user_id: UserId, task_id: &TaskId) -> Result<bool> {
        if self.owned(user_id, task_id).await?.is_none() {
            return Ok(false);
        }
        self.store.del(&keys::busy(user_id)).await
    }

    /// Current record, `None` when idle.
    pub async fn status(&self, user_id: UserId) -> Result<Option<BusyRecord>> {
        let Some(raw) = self.store.get(&keys::busy(user_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<BusyRecord>(&raw) {
            Ok(r) => Ok(Some(r)),
            Err(e) => {
                warn!(user_id = user_id.0, error = %e, "dropping unreadable busy record");
                self.store.del(&keys::busy(user_id)).await?;
                Ok(None)
            }
        }
    }

    async fn owned(&self, user_id: UserId, task_id: &TaskId) -> Result<Option<BusyRecord>> {
        Ok(self
            .status(user_id)
            .await?
            .filter(|r| r.task_id == *task_id))
    }

    async fn write(&self, user_id: UserId, record: &BusyRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.store
            .set(&keys::busy(user_id), &json, Some(self.cfg.ttl))
            .await
    }
}

/// Scoped ownership of a user's busy record.
///
/// Call [`BusyGuard::release`] on every exit path. If the guard is dropped without
/// it (panic, cancelled future) the record is cleared from a spawned task.
pub struct BusyGuard {
    tracker: BusyTracker,
    user_id: UserId,
    task_id: TaskId,
    released: bool,
}

impl BusyGuard {
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub async fn phase(&self, phase: Phase) -> Result<()> {
        self.tracker
            .mark_busy(self.user_id, &self.task_id, phase)
            .await
            .map(|_| ())
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.tracker
            .heartbeat(self.user_id, &self.task_id)
            .await
            .map(|_| ())
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.tracker
            .clear(self.user_id, &self.task_id)
            .await
            .map(|_| ())
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let tracker = self.tracker.clone();
        let user_id = self.user_id;
        let task_id = self.task_id.clone();
        handle.spawn(async move {
            if let Err(e) = tracker.clear(user_id, &task_id).await {
                warn!(user_id = user_id.0, task_id = %task_id, error = %e, "failed to clear busy record");
            }
        });
    }
}
