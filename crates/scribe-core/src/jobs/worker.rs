use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    jobs::{queue::FailOutcome, Claimed, Job, JobKind, JobQueue},
    Result,
};

/// Processing body for one job kind.
///
/// `Ok` completes the job (with an optional return value). `Err` counts as a
/// failed attempt; permanent errors skip the remaining attempts.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> Result<Option<String>>;
}

#[derive(Clone, Copy, Debug)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub lease: Duration,
    /// Upper bound on idle sleeps between claim attempts.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lease: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct WorkerPool {
    kind: JobKind,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        cfg: WorkerConfig,
        cancel: CancellationToken,
    ) -> Self {
        let kind = queue.kind();
        let workers = (0..cfg.concurrency.max(1))
            .map(|idx| {
                tokio::spawn(worker_loop(
                    idx,
                    queue.clone(),
                    handler.clone(),
                    cfg,
                    cancel.clone(),
                ))
            })
            .collect();
        info!(kind = %kind, concurrency = cfg.concurrency.max(1), "worker pool started");
        Self { kind, workers }
    }

    /// Wait for every worker to exit (after cancellation).
    pub async fn join(self) {
        for w in self.workers {
            if let Err(e) = w.await {
                error!(kind = %self.kind, "worker task ended abnormally: {e}");
            }
        }
        info!(kind = %self.kind, "worker pool stopped");
    }
}

async fn worker_loop(
    idx: usize,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    cfg: WorkerConfig,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let claimed = match queue.claim(cfg.lease).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(worker = idx, kind = %queue.kind(), "claim failed: {e}");
                None
            }
        };
        let Some(claimed) = claimed else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = queue.wait_for_work(cfg.poll_interval) => {}
            }
            continue;
        };
        run_one(idx, &queue, &handler, cfg, claimed).await;
    }
}

async fn run_one(
    worker: usize,
    queue: &Arc<JobQueue>,
    handler: &Arc<dyn JobHandler>,
    cfg: WorkerConfig,
    claimed: Claimed,
) {
    let Claimed { job, token } = claimed;
    let id = job.id.clone();
    let kind = job.kind;
    info!(
        worker,
        job_id = %id,
        kind = %kind,
        attempt = job.attempts_made + 1,
        "job started"
    );

    // The body runs in its own task so a panic surfaces as a JoinError.
    let h = handler.clone();
    let mut body = tokio::spawn(async move { h.handle(job).await });

    let renew_every = (cfg.lease / 3).max(Duration::from_millis(10));
    let mut renew = tokio::time::interval(renew_every);
    renew.tick().await;

    let outcome = loop {
        tokio::select! {
            res = &mut body => break res,
            _ = renew.tick() => {
                match queue.extend_lease(&id, token, cfg.lease).await {
                    Ok(true) => {}
                    Ok(false) => warn!(job_id = %id, kind = %kind, "lease lost while job running"),
                    Err(e) => warn!(job_id = %id, kind = %kind, "lease renewal failed: {e}"),
                }
            }
        }
    };

    match outcome {
        Ok(Ok(rv)) => match queue.complete(&id, token, rv).await {
            Ok(true) => info!(job_id = %id, kind = %kind, "job completed"),
            Ok(false) => {}
            Err(e) => error!(job_id = %id, kind = %kind, "could not record completion: {e}"),
        },
        Ok(Err(e)) => {
            let permanent = e.is_permanent();
            match queue.fail(&id, token, &e.to_string(), permanent).await {
                Ok(Some(FailOutcome::Retrying { attempt, delay })) => warn!(
                    job_id = %id,
                    kind = %kind,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "job failed, retrying: {e}"
                ),
                Ok(Some(FailOutcome::Failed)) => {
                    error!(job_id = %id, kind = %kind, permanent, "job failed: {e}")
                }
                Ok(None) => {}
                Err(store_err) => {
                    error!(job_id = %id, kind = %kind, "could not record failure: {store_err}")
                }
            }
        }
        Err(join_err) => {
            error!(job_id = %id, kind = %kind, "job body panicked: {join_err}");
            if let Err(e) = queue.fail(&id, token, "job body panicked", false).await {
                error!(job_id = %id, kind = %kind, "could not record failure: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{ChatId, TaskId, UserId},
        jobs::{JobOptions, JobPayload, JobState, ProcessingMode, TextJob},
        store::MemoryStore,
        Error,
    };
    use std::sync::Mutex;

    fn payload() -> JobPayload {
        JobPayload::Text(TextJob {
            task_id: TaskId::from("t1"),
            chat_id: ChatId(1),
            user_id: UserId(1),
            text: "x".into(),
            mode: ProcessingMode::Optimize,
        })
    }

    /// Fails the first `fail_times` calls, then succeeds.
    struct Flaky {
        fail_times: u32,
        calls: Mutex<u32>,
        error: fn() -> Error,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _job: Job) -> Result<Option<String>> {
            let n = {
                let mut c = self.calls.lock().unwrap();
                *c += 1;
                *c
            };
            if n <= self.fail_times {
                return Err((self.error)());
            }
            Ok(Some(format!("done after {n}")))
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn handle(&self, _job: Job) -> Result<Option<String>> {
            panic!("handler blew up");
        }
    }

    async fn wait_terminal(q: &JobQueue, id: &crate::jobs::JobId) -> Job {
        for _ in 0..200 {
            if let Some(job) = q.job(id).await.unwrap() {
                if job.state.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("job never reached a terminal state");
    }

    fn cfg() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            lease: Duration::from_secs(30),
            poll_interval: Duration::from_millis(50),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_to_success() {
        let q = Arc::new(JobQueue::new(Arc::new(MemoryStore::new()), JobKind::Text));
        let handler = Arc::new(Flaky {
            fail_times: 2,
            calls: Mutex::new(0),
            error: || Error::External("timeout".into()),
        });
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(q.clone(), handler.clone(), cfg(), cancel.clone());

        let h = q.enqueue(payload(), JobOptions::default()).await.unwrap();
        let job = wait_terminal(&q, &h.id).await;
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 3);
        assert_eq!(job.return_value.as_deref(), Some("done after 3"));
        assert_eq!(*handler.calls.lock().unwrap(), 3);

        cancel.cancel();
        pool.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let q = Arc::new(JobQueue::new(Arc::new(MemoryStore::new()), JobKind::Text));
        let handler = Arc::new(Flaky {
            fail_times: 10,
            calls: Mutex::new(0),
            error: || Error::InvalidPayload("bad".into()),
        });
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(q.clone(), handler.clone(), cfg(), cancel.clone());

        let h = q.enqueue(payload(), JobOptions::default()).await.unwrap();
        let job = wait_terminal(&q, &h.id).await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(*handler.calls.lock().unwrap(), 1);

        cancel.cancel();
        pool.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_body_counts_as_failed_attempt() {
        let q = Arc::new(JobQueue::new(Arc::new(MemoryStore::new()), JobKind::Text));
        let cancel = CancellationToken::new();
        let pool = WorkerPool::spawn(q.clone(), Arc::new(Panics), cfg(), cancel.clone());

        let h = q.enqueue(payload(), JobOptions::default()).await.unwrap();
        let job = wait_terminal(&q, &h.id).await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 3);

        cancel.cancel();
        pool.join().await;
    }
}
