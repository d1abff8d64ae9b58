//! Debounced album aggregation.
//!
//! Telegram delivers an album as separate photo messages sharing a
//! `media_group_id`. Each part is appended to a buffer in the store; the first
//! handler to take the timer lock schedules a single flush that turns the
//! whole buffer into one OCR-group job.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use crate::{
    domain::{ChatId, UserId},
    jobs::{JobHandle, JobPayload, JobQueues, OcrGroupJob},
    store::{keys, KeyValueStore},
    utils::new_task_id,
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct MediaGroupConfig {
    /// Quiet period after the last part before the album is flushed.
    pub window: Duration,
    /// Expiry of the buffer, refreshed on every part.
    pub buffer_ttl: Duration,
    /// Hard cap on how long a flush may be postponed by late parts.
    pub max_wait: Duration,
}

impl Default for MediaGroupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(2500),
            buffer_ttl: Duration::from_secs(120),
            max_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AlbumPart {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub group_id: String,
    pub file_id: String,
}

pub struct MediaGroupAggregator {
    store: Arc<dyn KeyValueStore>,
    queues: Arc<JobQueues>,
    cfg: MediaGroupConfig,
}

impl MediaGroupAggregator {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        queues: Arc<JobQueues>,
        cfg: MediaGroupConfig,
    ) -> Self {
        Self { store, queues, cfg }
    }

    /// Buffer one album part. Returns true when this call won the timer lock
    /// and scheduled the flush.
    pub async fn add_part(self: &Arc<Self>, part: AlbumPart) -> Result<bool> {
        let buffer = keys::media_group(&part.group_id);
        let len = self.store.rpush(&buffer, &part.file_id).await?;
        self.store.expire(&buffer, self.cfg.buffer_ttl).await?;
        self.store
            .set(
                &keys::media_group_last_update(&part.group_id),
                &Utc::now().timestamp_millis().to_string(),
                Some(self.cfg.buffer_ttl),
            )
            .await?;

        let won = self
            .store
            .set_nx(
                &keys::media_group_timer(&part.group_id),
                "1",
                Some(self.lock_ttl()),
            )
            .await?;
        debug!(group_id = %part.group_id, parts = len, lock_won = won, "album part buffered");

        if won {
            let this = self.clone();
            tokio::spawn(async move {
                let group_id = part.group_id.clone();
                if let Err(e) = this.debounce_then_flush(part).await {
                    error!(group_id = %group_id, "album flush failed: {e}");
                }
            });
        }
        Ok(won)
    }

    fn lock_ttl(&self) -> Duration {
        self.cfg.window + Duration::from_secs(1)
    }

    async fn debounce_then_flush(&self, part: AlbumPart) -> Result<Option<JobHandle>> {
        let buffer = keys::media_group(&part.group_id);
        let timer = keys::media_group_timer(&part.group_id);
        let started = Instant::now();
        let mut seen = self.store.llen(&buffer).await?;

        loop {
            sleep(self.cfg.window).await;
            let len = self.store.llen(&buffer).await?;
            if len > seen && started.elapsed() < self.cfg.max_wait {
                seen = len;
                self.store.expire(&timer, self.lock_ttl()).await?;
                continue;
            }
            break;
        }

        self.flush(&part.group_id, part.chat_id, part.user_id).await
    }

    /// Drain the album buffer into one OCR-group job. An empty buffer is a no-op.
    pub async fn flush(
        &self,
        group_id: &str,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<Option<JobHandle>> {
        // Release the lock before draining so a straggler arriving after the
        // drain starts a fresh album instead of being stranded.
        self.store.del(&keys::media_group_timer(group_id)).await?;
        let file_ids = self.store.take_list(&keys::media_group(group_id)).await?;
        if file_ids.is_empty() {
            debug!(group_id, "album buffer empty at flush");
            return Ok(None);
        }
        self.store
            .del(&keys::media_group_last_update(group_id))
            .await?;

        let task_id = new_task_id();
        let count = file_ids.len();
        let handle = self
            .queues
            .submit(JobPayload::OcrGroup(OcrGroupJob {
                task_id: task_id.clone(),
                chat_id,
                user_id,
                group_id: group_id.to_string(),
                file_ids,
            }))
            .await?;
        info!(group_id, task_id = %task_id, photos = count, "album flushed");
        Ok(Some(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        jobs::{JobKind, JobOptions},
        store::MemoryStore,
    };

    fn setup() -> (Arc<MediaGroupAggregator>, Arc<JobQueues>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let queues = Arc::new(JobQueues::new(store.clone(), JobOptions::default()));
        let agg = Arc::new(MediaGroupAggregator::new(
            store.clone(),
            queues.clone(),
            MediaGroupConfig::default(),
        ));
        (agg, queues, store)
    }

    fn part(file: &str) -> AlbumPart {
        AlbumPart {
            chat_id: ChatId(5),
            user_id: UserId(7),
            group_id: "g1".to_string(),
            file_id: file.to_string(),
        }
    }

    async fn group_jobs(queues: &JobQueues) -> Vec<OcrGroupJob> {
        let q = queues.queue(JobKind::OcrGroup);
        let mut out = Vec::new();
        while let Some(c) = q.claim(Duration::from_secs(60)).await.unwrap() {
            if let JobPayload::OcrGroup(g) = c.job.payload {
                out.push(g);
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn album_becomes_one_job_in_arrival_order() {
        let (agg, queues, _) = setup();
        let mut winners = 0;
        for (i, f) in ["a", "b", "c", "d"].iter().enumerate() {
            if i > 0 {
                sleep(Duration::from_millis(300)).await;
            }
            if agg.add_part(part(f)).await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "only one handler schedules the flush");

        sleep(Duration::from_secs(10)).await;
        let jobs = group_jobs(&queues).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].file_ids, vec!["a", "b", "c", "d"]);
        assert_eq!(jobs[0].user_id, UserId(7));
        assert_eq!(jobs[0].group_id, "g1");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_parts_still_flush_once() {
        let (agg, queues, _) = setup();
        let mut handles = Vec::new();
        for i in 0..6 {
            let agg = agg.clone();
            handles.push(tokio::spawn(async move {
                agg.add_part(part(&format!("f{i}"))).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        sleep(Duration::from_secs(10)).await;
        let jobs = group_jobs(&queues).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].file_ids.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn late_parts_postpone_the_flush() {
        let (agg, queues, _) = setup();
        agg.add_part(part("a")).await.unwrap();
        sleep(Duration::from_millis(2000)).await;
        agg.add_part(part("b")).await.unwrap();

        // First window elapses with a new part seen, so the flush waits again.
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(queues.queue(JobKind::OcrGroup).counts().await.unwrap().waiting, 0);

        sleep(Duration::from_secs(5)).await;
        let jobs = group_jobs(&queues).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].file_ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn empty_flush_is_noop() {
        let (agg, queues, _) = setup();
        let h = agg.flush("nothing", ChatId(1), UserId(1)).await.unwrap();
        assert!(h.is_none());
        assert_eq!(queues.queue(JobKind::OcrGroup).counts().await.unwrap().waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn buffer_and_lock_are_gone_after_flush() {
        let (agg, _queues, store) = setup();
        agg.add_part(part("a")).await.unwrap();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(store.llen(&keys::media_group("g1")).await.unwrap(), 0);
        assert!(store
            .get(&keys::media_group_timer("g1"))
            .await
            .unwrap()
            .is_none());
    }
}
