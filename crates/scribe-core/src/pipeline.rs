//! External processing steps shared by the task runner: rewriting, OCR and
//! web fetch, each behind its collaborator port and rate limiter.

use std::sync::Arc;

use reqwest::Url;
use tracing::debug;

use crate::{
    busy::BusyGuard,
    jobs::ProcessingMode,
    ports::{FileSource, ImageRecognizer, TextRewriter, WebFetcher},
    rate_limit::RateLimiter,
    utils::truncate_text,
    Error, Result,
};

/// Max characters of fetched page text handed to the rewriter.
pub const WEB_RAW_LIMIT: usize = 8000;
pub const WEB_TRUNCATION_MARKER: &str = "\n\n... (content truncated)";

/// Normalize user text before it is sent downstream.
pub fn preprocess_text(text: &str) -> String {
    text.replace('\u{00A0}', " ").trim().to_string()
}

/// Absolute http(s) URL or an `InvalidPayload` error.
pub fn validate_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::InvalidPayload(format!("invalid url {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(Error::InvalidPayload(format!("unsupported url {raw:?}"))),
    }
}

pub struct Pipelines {
    rewriter: Arc<dyn TextRewriter>,
    recognizer: Arc<dyn ImageRecognizer>,
    fetcher: Arc<dyn WebFetcher>,
    files: Arc<dyn FileSource>,
    ocr_limiter: RateLimiter,
    llm_limiter: RateLimiter,
}

impl Pipelines {
    pub fn new(
        rewriter: Arc<dyn TextRewriter>,
        recognizer: Arc<dyn ImageRecognizer>,
        fetcher: Arc<dyn WebFetcher>,
        files: Arc<dyn FileSource>,
        ocr_limiter: RateLimiter,
        llm_limiter: RateLimiter,
    ) -> Self {
        Self {
            rewriter,
            recognizer,
            fetcher,
            files,
            ocr_limiter,
            llm_limiter,
        }
    }

    /// Preprocess, then rewrite under the LLM rate limit.
    pub async fn rewrite(&self, text: &str, mode: ProcessingMode) -> Result<String> {
        let clean = preprocess_text(text);
        self.llm_limiter.wait().await;
        debug!(chars = clean.chars().count(), ?mode, "rewriting text");
        self.rewriter.rewrite_text(&clean, mode).await
    }

    /// OCR each file in order and join the texts with blank lines.
    ///
    /// Heartbeats after every image so long albums keep the busy record alive.
    pub async fn recognize(&self, file_ids: &[String], guard: &BusyGuard) -> Result<String> {
        let mut texts = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            let image = self.files.download(file_id).await?;
            self.ocr_limiter.wait().await;
            debug!(file_id, bytes = image.len(), "recognizing image");
            let text = self.recognizer.recognize_image(image).await?;
            texts.push(text);
            guard.heartbeat().await?;
        }
        Ok(texts.join("\n\n"))
    }

    /// Fetch readable page text, truncated before rewriting.
    pub async fn fetch(&self, url: &str) -> Result<String> {
        let url = validate_url(url)?;
        let raw = self.fetcher.fetch_webpage(url.as_str()).await?;
        debug!(url = %url, chars = raw.chars().count(), "page fetched");
        Ok(truncate_text(&raw, WEB_RAW_LIMIT, WEB_TRUNCATION_MARKER))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_replaces_nbsp_and_trims() {
        assert_eq!(preprocess_text("  hello world  "), "hello world");
        assert_eq!(preprocess_text("\u{00A0}a\u{00A0}b\u{00A0}"), "a b");
        assert_eq!(preprocess_text("   "), "");
    }

    #[test]
    fn url_validation() {
        assert!(validate_url("https://example.com/a?b=c").is_ok());
        assert!(validate_url("http://example.com").is_ok());
        for bad in ["ftp://example.com", "example.com", "https://", "javascript:alert(1)"] {
            let err = validate_url(bad).unwrap_err();
            assert!(err.is_permanent(), "{bad}");
        }
    }
}
