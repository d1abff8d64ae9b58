//! Job queues kept in the shared store.
//!
//! Every instance pointed at the same store sees the same queues. Per kind the
//! layout is:
//!
//! - `job:{id}`: JSON job record
//! - `wait`: list of claimable ids, oldest first
//! - `delayed`: retries scored by due time (epoch ms)
//! - `active`: claimed ids scored by lease expiry
//! - `lease:{id}`: token of the current holder
//! - `completed` / `failed`: terminal ids scored by purge time
//! - `token`: lease token counter

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::Notify,
    time::{sleep, Instant},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    jobs::{
        BackoffPolicy, Job, JobCounts, JobHandle, JobId, JobKind, JobOptions, JobPayload,
        JobState, RetentionPolicy,
    },
    store::{keys, KeyValueStore},
    Error, Result,
};

/// Purge score offset for terminal jobs without an age limit (about 35k years).
const NEVER_PURGED: i64 = 1 << 50;

/// A job handed to exactly one worker, together with the lease token that
/// worker must present to acknowledge it.
#[derive(Clone, Debug)]
pub struct Claimed {
    pub job: Job,
    pub token: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued; becomes claimable again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Attempts exhausted (or the error was permanent).
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobRecord {
    id: String,
    kind: JobKind,
    payload: serde_json::Value,
    attempts_made: u32,
    max_attempts: u32,
    backoff: BackoffPolicy,
    state: JobState,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    return_value: Option<String>,
    remove_on_complete: RetentionPolicy,
    remove_on_fail: RetentionPolicy,
}

impl JobRecord {
    fn to_job(&self) -> Result<Job> {
        Ok(Job {
            id: JobId(self.id.clone()),
            kind: self.kind,
            payload: JobPayload::from_value(self.kind, self.payload.clone())?,
            attempts_made: self.attempts_made,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            state: self.state,
            created_at: self.created_at,
            finished_at: self.finished_at,
            last_error: self.last_error.clone(),
            return_value: self.return_value.clone(),
        })
    }
}

/// Epoch milliseconds that advance with the tokio clock, so a paused test
/// clock drives leases and backoff.
#[derive(Clone, Copy, Debug)]
struct QueueClock {
    anchor: Instant,
    epoch_ms: i64,
}

impl QueueClock {
    fn new() -> Self {
        Self {
            anchor: Instant::now(),
            epoch_ms: Utc::now().timestamp_millis(),
        }
    }

    fn now_ms(&self) -> i64 {
        self.epoch_ms.saturating_add(millis(self.anchor.elapsed()))
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Queue for one job kind.
///
/// Claims are exclusive and lease-based: a claimed job is invisible to other
/// workers (in this process or any other sharing the store) until its lease
/// expires, after which it is redelivered.
pub struct JobQueue {
    kind: JobKind,
    store: Arc<dyn KeyValueStore>,
    clock: QueueClock,
    notify: Notify,
}

impl JobQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, kind: JobKind) -> Self {
        Self {
            kind,
            store,
            clock: QueueClock::new(),
            notify: Notify::new(),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    fn key(&self, part: &str) -> String {
        keys::queue(self.kind.as_str(), part)
    }

    fn job_key(&self, id: &str) -> String {
        keys::queue_job(self.kind.as_str(), id)
    }

    fn lease_key(&self, id: &str) -> String {
        keys::queue_lease(self.kind.as_str(), id)
    }

    async fn load(&self, id: &str) -> Result<Option<JobRecord>> {
        match self.store.get(&self.job_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, record: &JobRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.store.set(&self.job_key(&record.id), &json, None).await
    }

    /// Move a job record from `from` to `to`; records already moved on are left alone.
    async fn transition(&self, id: &str, from: JobState, to: JobState) -> Result<()> {
        if let Some(mut record) = self.load(id).await? {
            if record.state == from {
                record.state = to;
                self.save(&record).await?;
            }
        }
        Ok(())
    }

    pub async fn enqueue(&self, payload: JobPayload, opts: JobOptions) -> Result<JobHandle> {
        if payload.kind() != self.kind {
            return Err(Error::InvalidPayload(format!(
                "{} payload sent to {} queue",
                payload.kind(),
                self.kind
            )));
        }

        let id = JobId(
            opts.job_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        );
        let handle = JobHandle {
            id: id.clone(),
            kind: self.kind,
        };
        let task_id = payload.task_id().clone();
        let record = JobRecord {
            id: id.0.clone(),
            kind: self.kind,
            payload: payload.to_value()?,
            attempts_made: 0,
            max_attempts: opts.max_attempts.max(1),
            backoff: opts.backoff,
            state: JobState::Waiting,
            created_at: Utc::now(),
            finished_at: None,
            last_error: None,
            return_value: None,
            remove_on_complete: opts.remove_on_complete,
            remove_on_fail: opts.remove_on_fail,
        };
        let json = serde_json::to_string(&record)?;
        if !self.store.set_nx(&self.job_key(&id.0), &json, None).await? {
            debug!(job_id = %id, kind = %self.kind, "duplicate job id, returning existing job");
            return Ok(handle);
        }
        self.store.rpush(&self.key("wait"), &id.0).await?;

        info!(job_id = %id, kind = %self.kind, task_id = %task_id, "job enqueued");
        self.notify.notify_one();
        Ok(handle)
    }

    /// Move due retries to waiting and recover jobs whose lease ran out.
    async fn promote(&self, now: i64) -> Result<()> {
        let due = self
            .store
            .move_due(&self.key("delayed"), &self.key("wait"), now)
            .await?;
        for id in due {
            self.transition(&id, JobState::Delayed, JobState::Waiting)
                .await?;
        }

        let stalled = self
            .store
            .move_due(&self.key("active"), &self.key("wait"), now)
            .await?;
        for id in stalled {
            warn!(job_id = %id, kind = %self.kind, "job lease expired, returning to waiting");
            self.store.del(&self.lease_key(&id)).await?;
            self.transition(&id, JobState::Active, JobState::Waiting)
                .await?;
        }
        Ok(())
    }

    /// Claim the next waiting job for `lease`.
    pub async fn claim(&self, lease: Duration) -> Result<Option<Claimed>> {
        let now = self.clock.now_ms();
        self.promote(now).await?;

        let expires_at = now.saturating_add(millis(lease));
        while let Some(id) = self
            .store
            .move_head(&self.key("wait"), &self.key("active"), expires_at)
            .await?
        {
            let token = self.store.incr(&self.key("token")).await?;
            self.store
                .set(&self.lease_key(&id), &token.to_string(), None)
                .await?;

            let Some(mut record) = self.load(&id).await? else {
                // Purged while it was still listed.
                self.release(&id, token).await?;
                continue;
            };
            record.state = JobState::Active;
            self.save(&record).await?;

            match record.to_job() {
                Ok(job) => return Ok(Some(Claimed { job, token })),
                Err(e) => {
                    warn!(job_id = %id, kind = %self.kind, "stored payload unreadable: {e}");
                    self.fail(&JobId(id), token, &e.to_string(), true).await?;
                }
            }
        }
        Ok(None)
    }

    async fn holds_lease(&self, id: &str, token: u64) -> Result<bool> {
        let current = self.store.get(&self.lease_key(id)).await?;
        Ok(current.as_deref() == Some(token.to_string().as_str()))
    }

    /// Give up a lease. False when the caller no longer holds it.
    async fn release(&self, id: &str, token: u64) -> Result<bool> {
        if !self.holds_lease(id, token).await? {
            return Ok(false);
        }
        if !self.store.zrem(&self.key("active"), id).await? {
            return Ok(false);
        }
        self.store.del(&self.lease_key(id)).await?;
        Ok(true)
    }

    /// Renew a lease. Returns false if the caller no longer holds it.
    pub async fn extend_lease(&self, id: &JobId, token: u64, lease: Duration) -> Result<bool> {
        if !self.holds_lease(&id.0, token).await? {
            return Ok(false);
        }
        let expires_at = self.clock.now_ms().saturating_add(millis(lease));
        self.store
            .zrescore(&self.key("active"), &id.0, expires_at)
            .await
    }

    /// Acknowledge success. Ignored (returns false) when the lease was lost.
    pub async fn complete(
        &self,
        id: &JobId,
        token: u64,
        return_value: Option<String>,
    ) -> Result<bool> {
        if !self.release(&id.0, token).await? {
            warn!(job_id = %id, kind = %self.kind, "stale completion ignored");
            return Ok(false);
        }
        let Some(mut record) = self.load(&id.0).await? else {
            return Ok(true);
        };
        record.state = JobState::Completed;
        record.attempts_made += 1;
        record.finished_at = Some(Utc::now());
        record.return_value = return_value;
        self.save(&record).await?;
        self.retire(&id.0, "completed", record.remove_on_complete)
            .await?;
        Ok(true)
    }

    /// Record a failed attempt and decide between retry and terminal failure.
    ///
    /// Returns `None` when the lease was lost (the attempt is not counted).
    pub async fn fail(
        &self,
        id: &JobId,
        token: u64,
        error: &str,
        permanent: bool,
    ) -> Result<Option<FailOutcome>> {
        if !self.release(&id.0, token).await? {
            warn!(job_id = %id, kind = %self.kind, "stale failure ignored");
            return Ok(None);
        }
        let Some(mut record) = self.load(&id.0).await? else {
            return Ok(None);
        };
        record.attempts_made += 1;
        record.last_error = Some(error.to_string());
        let attempt = record.attempts_made;

        if !permanent && attempt < record.max_attempts {
            let delay = record.backoff.delay(attempt);
            record.state = JobState::Delayed;
            self.save(&record).await?;
            let due = self.clock.now_ms().saturating_add(millis(delay));
            self.store.zadd(&self.key("delayed"), &id.0, due).await?;
            return Ok(Some(FailOutcome::Retrying { attempt, delay }));
        }

        record.state = JobState::Failed;
        record.finished_at = Some(Utc::now());
        self.save(&record).await?;
        self.retire(&id.0, "failed", record.remove_on_fail).await?;
        Ok(Some(FailOutcome::Failed))
    }

    /// File a terminal job and apply its retention to that list.
    async fn retire(&self, id: &str, list: &str, policy: RetentionPolicy) -> Result<()> {
        let now = self.clock.now_ms();
        let purge_at = match policy.max_age {
            Some(age) => now.saturating_add(millis(age)),
            None => now.saturating_add(NEVER_PURGED),
        };
        let key = self.key(list);
        self.store.zadd(&key, id, purge_at).await?;
        self.purge_expired(&key, now).await?;

        if let Some(max) = policy.max_count {
            let len = self.store.zcard(&key).await?;
            if len > max {
                for old in self.store.zpop_min(&key, len - max).await? {
                    self.store.del(&self.job_key(&old)).await?;
                }
            }
        }
        Ok(())
    }

    async fn purge_expired(&self, key: &str, now: i64) -> Result<()> {
        for id in self.store.zpop_upto(key, now).await? {
            self.store.del(&self.job_key(&id)).await?;
        }
        Ok(())
    }

    pub async fn job(&self, id: &JobId) -> Result<Option<Job>> {
        self.load(&id.0)
            .await?
            .map(|record| record.to_job())
            .transpose()
    }

    pub async fn counts(&self) -> Result<JobCounts> {
        let now = self.clock.now_ms();
        self.promote(now).await?;
        let completed = self.key("completed");
        let failed = self.key("failed");
        self.purge_expired(&completed, now).await?;
        self.purge_expired(&failed, now).await?;
        Ok(JobCounts {
            waiting: self.store.llen(&self.key("wait")).await?,
            active: self.store.zcard(&self.key("active")).await?,
            delayed: self.store.zcard(&self.key("delayed")).await?,
            completed: self.store.zcard(&completed).await?,
            failed: self.store.zcard(&failed).await?,
        })
    }

    /// Earliest retry due time or lease expiry, in epoch ms.
    async fn next_due(&self) -> Result<Option<i64>> {
        let delayed = self.store.zmin(&self.key("delayed")).await?;
        let lease = self.store.zmin(&self.key("active")).await?;
        Ok(delayed.into_iter().chain(lease).min())
    }

    /// Wait until a job may be claimable: a local enqueue signal, the next
    /// retry or lease coming due, or `max_wait` elapsing. Jobs enqueued by
    /// other instances are picked up on the `max_wait` poll.
    pub async fn wait_for_work(&self, max_wait: Duration) {
        let next_due = match self.next_due().await {
            Ok(due) => due,
            Err(e) => {
                warn!(kind = %self.kind, "queue poll failed: {e}");
                None
            }
        };
        let wait = match next_due {
            Some(due) => {
                let ms = due.saturating_sub(self.clock.now_ms()).max(0);
                Duration::from_millis(ms as u64).min(max_wait)
            }
            None => max_wait,
        };
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = sleep(wait) => {}
        }
    }
}

/// One queue per job kind, all over the same store.
pub struct JobQueues {
    store: Arc<dyn KeyValueStore>,
    queues: HashMap<JobKind, Arc<JobQueue>>,
    defaults: JobOptions,
}

impl JobQueues {
    pub fn new(store: Arc<dyn KeyValueStore>, defaults: JobOptions) -> Self {
        let queues = JobKind::ALL
            .iter()
            .map(|k| (*k, Arc::new(JobQueue::new(store.clone(), *k))))
            .collect();
        Self {
            store,
            queues,
            defaults,
        }
    }

    pub fn defaults(&self) -> &JobOptions {
        &self.defaults
    }

    pub fn queue(&self, kind: JobKind) -> Arc<JobQueue> {
        // Every kind is registered in `new`.
        match self.queues.get(&kind) {
            Some(q) => q.clone(),
            None => Arc::new(JobQueue::new(self.store.clone(), kind)),
        }
    }

    /// Enqueue a raw payload by kind name.
    pub async fn enqueue(
        &self,
        kind: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<JobHandle> {
        let kind: JobKind = kind.parse()?;
        let payload = JobPayload::from_value(kind, payload)?;
        self.queue(kind).enqueue(payload, opts).await
    }

    /// Enqueue a typed payload with the default options.
    pub async fn submit(&self, payload: JobPayload) -> Result<JobHandle> {
        self.queue(payload.kind())
            .enqueue(payload, self.defaults.clone())
            .await
    }

    pub async fn overview(&self) -> Result<Vec<(JobKind, JobCounts)>> {
        let mut out = Vec::with_capacity(JobKind::ALL.len());
        for kind in JobKind::ALL {
            out.push((kind, self.queue(kind).counts().await?));
        }
        Ok(out)
    }
}
