use std::fmt::Write as _;

use chrono::Utc;

use crate::{
    busy::{BusyRecord, BusyTracker},
    domain::UserId,
    jobs::{JobCounts, JobKind, JobQueues},
    Result,
};

/// Snapshot shown by `/status`.
#[derive(Clone, Debug)]
pub struct StatusReport {
    pub busy: Option<BusyRecord>,
    pub queues: Vec<(JobKind, JobCounts)>,
}

impl StatusReport {
    pub async fn collect(busy: &BusyTracker, queues: &JobQueues, user_id: UserId) -> Result<Self> {
        Ok(Self {
            busy: busy.status(user_id).await?,
            queues: queues.overview().await?,
        })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        match &self.busy {
            Some(r) => {
                let secs = (Utc::now().timestamp_millis() - r.started_at).max(0) / 1000;
                let _ = writeln!(out, "Your status: busy ({})", r.phase);
                let _ = writeln!(out, "Task: {} (running {secs}s)", r.task_id);
            }
            None => {
                let _ = writeln!(out, "Your status: idle");
            }
        }
        out.push('\n');
        for (kind, c) in &self.queues {
            let _ = writeln!(
                out,
                "{:<10} → waiting {}, active {}, delayed {}, failed {}, completed {}",
                kind.as_str(),
                c.waiting,
                c.active,
                c.delayed,
                c.failed,
                c.completed
            );
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        busy::{BusyConfig, Phase},
        domain::{ChatId, TaskId},
        jobs::{JobOptions, JobPayload, TextJob, ProcessingMode},
        store::MemoryStore,
    };
    use std::sync::Arc;

    #[tokio::test]
    async fn reports_user_state_and_queue_counts() {
        let store = Arc::new(MemoryStore::new());
        let busy = BusyTracker::new(store.clone(), BusyConfig::default());
        let queues = JobQueues::new(store, JobOptions::default());
        queues
            .submit(JobPayload::Text(TextJob {
                task_id: TaskId::from("t1"),
                chat_id: ChatId(1),
                user_id: UserId(1),
                text: "x".into(),
                mode: ProcessingMode::Process,
            }))
            .await
            .unwrap();

        let idle = StatusReport::collect(&busy, &queues, UserId(1)).await.unwrap();
        let text = idle.render();
        assert!(text.starts_with("Your status: idle"));
        assert!(text.contains("text       → waiting 1, active 0"));
        assert!(text.contains("web-link"));

        let guard = busy
            .acquire(UserId(1), &TaskId::from("t9"), Phase::WebFetch)
            .await
            .unwrap();
        let report = StatusReport::collect(&busy, &queues, UserId(1)).await.unwrap();
        let text = report.render();
        assert!(text.contains("busy (WEB_FETCH)"));
        assert!(text.contains("Task: t9"));
        guard.release().await.unwrap();
    }
}
