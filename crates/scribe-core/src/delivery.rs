//! Chunked, retried delivery of a finished result.

use std::{sync::Arc, time::Duration};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    domain::{ChatId, TaskId},
    ledger::save_keyboard,
    messaging::{InlineKeyboard, MessagingPort},
    store::{keys, KeyValueStore},
    Result,
};

pub const FAILURE_NOTICE: &str =
    "Sorry, something went wrong while sending the result. Please try again later.";

#[derive(Clone, Copy, Debug)]
pub struct DeliveryConfig {
    /// Max UTF-16 code units per message, the unit Telegram's 4096 cap is counted in.
    pub chunk_limit: usize,
    pub chunk_pause: Duration,
    pub send_attempts: u32,
    pub fallback_attempts: u32,
    /// Retry `n` waits `retry_base * 2^n`.
    pub retry_base: Duration,
    pub result_ttl: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            chunk_limit: 3500,
            chunk_pause: Duration::from_millis(500),
            send_attempts: 3,
            fallback_attempts: 2,
            retry_base: Duration::from_secs(1),
            result_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Length in UTF-16 code units.
pub fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

/// Byte offset just past the longest prefix of `s` that fits in `max_units`,
/// or `None` when all of `s` fits. Never cuts inside a char and always keeps
/// at least one.
fn fit_prefix(s: &str, max_units: usize) -> Option<usize> {
    let mut units = 0;
    for (i, c) in s.char_indices() {
        units += c.len_utf16();
        if units > max_units {
            return Some(if i == 0 { c.len_utf8() } else { i });
        }
    }
    None
}

/// Split `text` into pieces of at most `max_units` UTF-16 code units.
///
/// Concatenating the pieces gives back `text` exactly. A piece ends after the
/// last newline, else after the last whitespace, provided the break lies at or
/// beyond 60% of the limit; otherwise it is cut at the limit.
pub fn split_into_chunks(text: &str, max_units: usize) -> Vec<String> {
    let max_units = max_units.max(1);
    let min_break = (max_units * 3).div_ceil(5);
    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let Some(cut) = fit_prefix(rest, max_units) else {
            chunks.push(rest.to_string());
            break;
        };
        let window = &rest[..cut];
        let late_enough = |i: usize| utf16_len(&window[..i]) >= min_break;

        let at_newline = window
            .rfind('\n')
            .filter(|&i| late_enough(i))
            .map(|i| i + 1);
        let at_space = || {
            window
                .char_indices()
                .rev()
                .find(|(_, c)| c.is_whitespace())
                .filter(|&(i, _)| late_enough(i))
                .map(|(i, c)| i + c.len_utf8())
        };
        let split = at_newline.or_else(at_space).unwrap_or(cut);

        chunks.push(rest[..split].to_string());
        rest = &rest[split..];
    }
    chunks
}

pub struct ResultDelivery {
    messenger: Arc<dyn MessagingPort>,
    store: Arc<dyn KeyValueStore>,
    cfg: DeliveryConfig,
}

impl ResultDelivery {
    pub fn new(
        messenger: Arc<dyn MessagingPort>,
        store: Arc<dyn KeyValueStore>,
        cfg: DeliveryConfig,
    ) -> Self {
        Self {
            messenger,
            store,
            cfg,
        }
    }

    /// Cache `text` for the save callbacks, then send it in chunks with the
    /// save keyboard on the last one.
    ///
    /// A send failure is returned as is; the cached copy lets a retry resend
    /// without redoing the work. Whitespace-only chunks are skipped, so the
    /// caller must not pass blank text.
    pub async fn deliver(&self, chat_id: ChatId, task_id: &TaskId, text: &str) -> Result<()> {
        let chunks: Vec<String> = split_into_chunks(text, self.cfg.chunk_limit)
            .into_iter()
            .filter(|c| !c.trim().is_empty())
            .collect();
        debug!(task_id = %task_id, chunks = chunks.len(), units = utf16_len(text), "delivering result");

        self.cache(task_id, text).await?;
        self.send_chunks(chat_id, task_id, &chunks).await?;

        info!(task_id = %task_id, chunks = chunks.len(), "result delivered");
        Ok(())
    }

    async fn send_chunks(&self, chat_id: ChatId, task_id: &TaskId, chunks: &[String]) -> Result<()> {
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.iter().enumerate() {
            let keyboard = if i == last {
                Some(save_keyboard(task_id, &[])?)
            } else {
                None
            };
            self.send_with_retry(chat_id, chunk, keyboard, self.cfg.send_attempts)
                .await?;
            if i < last {
                sleep(self.cfg.chunk_pause).await;
            }
        }
        Ok(())
    }

    /// Best-effort apology. Errors are logged, never returned.
    pub async fn notify_failure(&self, chat_id: ChatId) {
        if let Err(e) = self
            .send_with_retry(chat_id, FAILURE_NOTICE, None, self.cfg.fallback_attempts)
            .await
        {
            warn!(chat_id = chat_id.0, "failure notice not delivered: {e}");
        }
    }

    /// Send a short message with the same retry policy as result chunks.
    pub async fn send_notice(&self, chat_id: ChatId, text: &str) -> Result<()> {
        self.send_with_retry(chat_id, text, None, self.cfg.send_attempts)
            .await
    }

    async fn send_with_retry(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<InlineKeyboard>,
        attempts: u32,
    ) -> Result<()> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .messenger
                .send_text(chat_id, text, keyboard.clone())
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if attempt < attempts => {
                    let wait = self.cfg.retry_base.saturating_mul(1 << attempt.min(16));
                    warn!(
                        chat_id = chat_id.0,
                        attempt,
                        attempts,
                        wait_ms = wait.as_millis() as u64,
                        "send failed, retrying: {e}"
                    );
                    sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn cache(&self, task_id: &TaskId, text: &str) -> Result<()> {
        self.store
            .set(&keys::result(task_id), text, Some(self.cfg.result_ttl))
            .await
    }

    pub async fn cached(&self, task_id: &TaskId) -> Result<Option<String>> {
        self.store.get(&keys::result(task_id)).await
    }
}
