//! The job body shared by every worker pool.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    busy::{BusyGuard, BusyTracker, Phase},
    delivery::ResultDelivery,
    jobs::{Job, JobHandler, JobPayload, ProcessingMode},
    pipeline::Pipelines,
    Result,
};

pub const NO_TEXT_NOTICE: &str = "No text was recognized in the image.";
pub const EMPTY_RESULT_NOTICE: &str =
    "The processed text came out empty, so there is nothing to send.";

enum Produced {
    /// A result to chunk, deliver and cache.
    Result(String),
    /// A plain notice, no save buttons.
    Notice(&'static str),
}

impl Produced {
    fn rewritten(out: String) -> Self {
        if out.trim().is_empty() {
            Produced::Notice(EMPTY_RESULT_NOTICE)
        } else {
            Produced::Result(out)
        }
    }
}

pub struct TaskRunner {
    busy: Arc<BusyTracker>,
    pipelines: Arc<Pipelines>,
    delivery: Arc<ResultDelivery>,
}

impl TaskRunner {
    pub fn new(
        busy: Arc<BusyTracker>,
        pipelines: Arc<Pipelines>,
        delivery: Arc<ResultDelivery>,
    ) -> Self {
        Self {
            busy,
            pipelines,
            delivery,
        }
    }

    async fn produce(&self, payload: &JobPayload, guard: &BusyGuard) -> Result<Produced> {
        match payload {
            JobPayload::Text(j) => {
                let out = self.pipelines.rewrite(&j.text, j.mode).await?;
                Ok(Produced::rewritten(out))
            }
            JobPayload::OcrSingle(j) => {
                self.ocr_then_rewrite(std::slice::from_ref(&j.file_id), guard)
                    .await
            }
            JobPayload::OcrGroup(j) => self.ocr_then_rewrite(&j.file_ids, guard).await,
            JobPayload::WebLink(j) => {
                let page = self.pipelines.fetch(&j.url).await?;
                guard.phase(Phase::Llm).await?;
                let out = self
                    .pipelines
                    .rewrite(&page, ProcessingMode::Process)
                    .await?;
                Ok(Produced::rewritten(out))
            }
        }
    }

    async fn ocr_then_rewrite(&self, file_ids: &[String], guard: &BusyGuard) -> Result<Produced> {
        let text = self.pipelines.recognize(file_ids, guard).await?;
        if text.trim().is_empty() {
            return Ok(Produced::Notice(NO_TEXT_NOTICE));
        }
        guard.phase(Phase::Llm).await?;
        let out = self
            .pipelines
            .rewrite(&text, ProcessingMode::Process)
            .await?;
        Ok(Produced::rewritten(out))
    }

    async fn run(&self, job: &Job, guard: &BusyGuard) -> Result<Option<String>> {
        let result = self.attempt(job, guard).await;
        if let Err(e) = &result {
            // Only the last attempt apologizes; earlier ones are retried quietly.
            if e.is_permanent() || job.attempts_made + 1 >= job.max_attempts {
                self.delivery.notify_failure(job.payload.chat_id()).await;
            }
        }
        result
    }

    async fn attempt(&self, job: &Job, guard: &BusyGuard) -> Result<Option<String>> {
        let payload = &job.payload;
        let chat_id = payload.chat_id();

        // A retry after a failed send resends the cached result as is.
        let cached = if job.attempts_made > 0 {
            self.delivery.cached(payload.task_id()).await?
        } else {
            None
        };
        let produced = match cached {
            Some(out) => {
                info!(task_id = %payload.task_id(), "resending cached result");
                Produced::Result(out)
            }
            None => self.produce(payload, guard).await?,
        };

        guard.phase(Phase::Sending).await?;
        match produced {
            Produced::Notice(text) => {
                self.delivery.send_notice(chat_id, text).await?;
                Ok(Some(text.to_string()))
            }
            Produced::Result(out) => {
                self.delivery
                    .deliver(chat_id, payload.task_id(), &out)
                    .await?;
                Ok(Some(out))
            }
        }
    }
}

fn first_phase(payload: &JobPayload) -> Phase {
    match payload {
        JobPayload::Text(_) => Phase::Llm,
        JobPayload::OcrSingle(_) | JobPayload::OcrGroup(_) => Phase::Ocr,
        JobPayload::WebLink(_) => Phase::WebFetch,
    }
}

#[async_trait]
impl JobHandler for TaskRunner {
    async fn handle(&self, job: Job) -> Result<Option<String>> {
        let payload = &job.payload;
        let guard = self
            .busy
            .acquire(payload.user_id(), payload.task_id(), first_phase(payload))
            .await?;

        let result = self.run(&job, &guard).await;
        if let Err(e) = guard.release().await {
            warn!(task_id = %payload.task_id(), "busy release failed: {e}");
        }
        if result.is_ok() {
            info!(task_id = %payload.task_id(), kind = %job.kind, "task finished");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        busy::BusyConfig,
        delivery::{DeliveryConfig, FAILURE_NOTICE},
        domain::{ChatId, TaskId, UserId},
        jobs::{
            BackoffPolicy, JobId, JobState, OcrGroupJob, OcrSingleJob, TextJob,
            WebLinkJob,
        },
        pipeline::{WEB_RAW_LIMIT, WEB_TRUNCATION_MARKER},
        ports::TextRewriter,
        rate_limit::RateLimiter,
        store::{keys, KeyValueStore, MemoryStore},
        testing::{FakeFetcher, FakeMessenger, FakeOcr, FakeRewriter},
    };
    use chrono::Utc;
    use std::time::Duration;

    struct Harness {
        runner: TaskRunner,
        store: Arc<MemoryStore>,
        messenger: Arc<FakeMessenger>,
        rewriter: Arc<FakeRewriter>,
        ocr: Arc<FakeOcr>,
        fetcher: Arc<FakeFetcher>,
    }

    fn harness(rewriter: FakeRewriter, ocr: FakeOcr, fetcher: FakeFetcher) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let messenger = Arc::new(FakeMessenger::default());
        let rewriter = Arc::new(rewriter);
        let ocr = Arc::new(ocr);
        let fetcher = Arc::new(fetcher);
        let pipelines = Arc::new(Pipelines::new(
            rewriter.clone(),
            ocr.clone(),
            fetcher.clone(),
            ocr.clone(),
            RateLimiter::new(2, Duration::from_secs(1)),
            RateLimiter::new(1, Duration::from_secs(1)),
        ));
        let delivery = Arc::new(ResultDelivery::new(
            messenger.clone(),
            store.clone(),
            DeliveryConfig::default(),
        ));
        let busy = Arc::new(BusyTracker::new(store.clone(), BusyConfig::default()));
        Harness {
            runner: TaskRunner::new(busy, pipelines, delivery),
            store,
            messenger,
            rewriter,
            ocr,
            fetcher,
        }
    }

    fn job(payload: JobPayload, attempts_made: u32) -> Job {
        Job {
            id: JobId("j1".into()),
            kind: payload.kind(),
            payload,
            attempts_made,
            max_attempts: 3,
            backoff: BackoffPolicy::Fixed(Duration::ZERO),
            state: JobState::Active,
            created_at: Utc::now(),
            finished_at: None,
            last_error: None,
            return_value: None,
        }
    }

    fn text_job(text: &str) -> JobPayload {
        JobPayload::Text(TextJob {
            task_id: TaskId::from("t1"),
            chat_id: ChatId(10),
            user_id: UserId(1),
            text: text.to_string(),
            mode: ProcessingMode::Process,
        })
    }

    async fn busy_record_absent(store: &MemoryStore) -> bool {
        store.get(&keys::busy(UserId(1))).await.unwrap().is_none()
    }

    #[tokio::test(start_paused = true)]
    async fn text_is_trimmed_before_rewrite_and_delivered() {
        let h = harness(FakeRewriter::default(), FakeOcr::default(), FakeFetcher::default());
        let out = h
            .runner
            .handle(job(text_job("  hello\u{00A0}world  "), 0))
            .await
            .unwrap();

        assert_eq!(
            h.rewriter.calls.lock().unwrap().clone(),
            vec![("hello world".to_string(), ProcessingMode::Process)]
        );
        assert_eq!(out.as_deref(), Some("rewritten: hello world"));
        let sent = h.messenger.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "rewritten: hello world");
        assert!(sent[0].2.is_some(), "result carries the save keyboard");
        assert_eq!(
            h.store.get(&keys::result(&TaskId::from("t1"))).await.unwrap().as_deref(),
            Some("rewritten: hello world")
        );
        assert!(busy_record_absent(&h.store).await);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_ocr_sends_notice_without_rewrite() {
        let h = harness(
            FakeRewriter::default(),
            FakeOcr::with(&[("photo", "   ")]),
            FakeFetcher::default(),
        );
        let payload = JobPayload::OcrSingle(OcrSingleJob {
            task_id: TaskId::from("t1"),
            chat_id: ChatId(10),
            user_id: UserId(1),
            file_id: "photo".into(),
        });
        let out = h.runner.handle(job(payload, 0)).await.unwrap();

        assert_eq!(out.as_deref(), Some(NO_TEXT_NOTICE));
        assert!(h.rewriter.calls.lock().unwrap().is_empty());
        let sent = h.messenger.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, NO_TEXT_NOTICE);
        assert!(sent[0].2.is_none());
        assert!(busy_record_absent(&h.store).await);
    }

    #[tokio::test(start_paused = true)]
    async fn album_text_is_joined_in_order_and_processed() {
        let h = harness(
            FakeRewriter::default(),
            FakeOcr::with(&[("a", "first"), ("b", "second")]),
            FakeFetcher::default(),
        );
        let payload = JobPayload::OcrGroup(OcrGroupJob {
            task_id: TaskId::from("t1"),
            chat_id: ChatId(10),
            user_id: UserId(1),
            group_id: "g".into(),
            file_ids: vec!["a".into(), "b".into()],
        });
        h.runner.handle(job(payload, 0)).await.unwrap();

        assert_eq!(h.ocr.calls.lock().unwrap().clone(), vec!["a", "b"]);
        assert_eq!(
            h.rewriter.calls.lock().unwrap().clone(),
            vec![("first\n\nsecond".to_string(), ProcessingMode::Process)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failure_clears_busy_and_only_last_attempt_apologizes() {
        let h = harness(
            FakeRewriter {
                fail: true,
                ..FakeRewriter::default()
            },
            FakeOcr::default(),
            FakeFetcher::default(),
        );

        let err = h.runner.handle(job(text_job("hi"), 0)).await;
        assert!(err.is_err());
        assert!(busy_record_absent(&h.store).await);
        assert!(h.messenger.texts().is_empty());

        let err = h.runner.handle(job(text_job("hi"), 2)).await;
        assert!(err.is_err());
        assert!(busy_record_absent(&h.store).await);
        assert_eq!(h.messenger.texts(), vec![FAILURE_NOTICE]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_is_retried_from_cache_without_early_apology() {
        let h = harness(FakeRewriter::default(), FakeOcr::default(), FakeFetcher::default());
        // Exhausts every send of the first attempt.
        *h.messenger.fail_first.lock().unwrap() = 3;

        let err = h.runner.handle(job(text_job("hi"), 0)).await;
        assert!(err.is_err());
        assert!(h.messenger.texts().is_empty(), "attempt 1 of 3 stays quiet");
        assert!(busy_record_absent(&h.store).await);

        let out = h.runner.handle(job(text_job("hi"), 1)).await.unwrap();
        assert_eq!(out.as_deref(), Some("rewritten: hi"));
        assert_eq!(h.rewriter.calls.lock().unwrap().len(), 1, "no second rewrite");
        assert_eq!(h.messenger.texts(), vec!["rewritten: hi"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_on_last_attempt_apologizes() {
        let h = harness(FakeRewriter::default(), FakeOcr::default(), FakeFetcher::default());
        *h.messenger.fail_first.lock().unwrap() = 3;

        assert!(h.runner.handle(job(text_job("hi"), 2)).await.is_err());
        assert_eq!(h.messenger.texts(), vec![FAILURE_NOTICE]);
    }

    /// Returns whitespace no matter the input.
    struct BlankRewriter;

    #[async_trait]
    impl TextRewriter for BlankRewriter {
        async fn rewrite_text(&self, _text: &str, _mode: ProcessingMode) -> Result<String> {
            Ok(" \n\t ".to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn blank_rewrite_sends_notice_instead_of_nothing() {
        let store = Arc::new(MemoryStore::new());
        let messenger = Arc::new(FakeMessenger::default());
        let ocr = Arc::new(FakeOcr::default());
        let pipelines = Arc::new(Pipelines::new(
            Arc::new(BlankRewriter),
            ocr.clone(),
            Arc::new(FakeFetcher::default()),
            ocr,
            RateLimiter::new(2, Duration::from_secs(1)),
            RateLimiter::new(1, Duration::from_secs(1)),
        ));
        let delivery = Arc::new(ResultDelivery::new(
            messenger.clone(),
            store.clone(),
            DeliveryConfig::default(),
        ));
        let busy = Arc::new(BusyTracker::new(store.clone(), BusyConfig::default()));
        let runner = TaskRunner::new(busy, pipelines, delivery);

        let out = runner.handle(job(text_job("hi"), 0)).await.unwrap();
        assert_eq!(out.as_deref(), Some(EMPTY_RESULT_NOTICE));
        let sent = messenger.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, EMPTY_RESULT_NOTICE);
        assert!(sent[0].2.is_none(), "nothing to save");
        assert!(store
            .get(&keys::result(&TaskId::from("t1")))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn web_page_is_truncated_then_rewritten() {
        let h = harness(
            FakeRewriter::default(),
            FakeOcr::default(),
            FakeFetcher {
                body: "x".repeat(WEB_RAW_LIMIT + 500),
                ..FakeFetcher::default()
            },
        );
        let payload = JobPayload::WebLink(WebLinkJob {
            task_id: TaskId::from("t1"),
            chat_id: ChatId(10),
            user_id: UserId(1),
            url: "https://example.com/post".into(),
        });
        h.runner.handle(job(payload, 0)).await.unwrap();

        assert_eq!(
            h.fetcher.calls.lock().unwrap().clone(),
            vec!["https://example.com/post"]
        );
        let calls = h.rewriter.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, ProcessingMode::Process);
        assert!(calls[0].0.ends_with(WEB_TRUNCATION_MARKER.trim()));
        assert!(calls[0].0.starts_with(&"x".repeat(WEB_RAW_LIMIT)));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_url_is_permanent() {
        let h = harness(FakeRewriter::default(), FakeOcr::default(), FakeFetcher::default());
        let payload = JobPayload::WebLink(WebLinkJob {
            task_id: TaskId::from("t1"),
            chat_id: ChatId(10),
            user_id: UserId(1),
            url: "ftp://example.com".into(),
        });
        let err = h.runner.handle(job(payload, 0)).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(h.fetcher.calls.lock().unwrap().is_empty());
        assert_eq!(h.messenger.texts(), vec![FAILURE_NOTICE]);
    }
}
