//! DeepSeek chat-completions rewriter (OpenAI-compatible wire format).

use std::time::Duration;

use async_trait::async_trait;
use scribe_core::{errors::Error, jobs::ProcessingMode, ports::TextRewriter, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::client;

const OPTIMIZE_PROMPT: &str = "You are a careful copy editor. Fix spelling, grammar and \
punctuation in the user's text, repair broken lines and obvious OCR mistakes, and keep the \
original language, wording and structure. Output only the corrected text, without any \
explanation and without wrapping it in a code block.";

const PROCESS_PROMPT: &str = "You are a document assistant that turns chat messages and OCR \
output into clean, structured Markdown for a knowledge base. First remove OCR noise (headers, \
footers, page numbers, watermarks, duplicated lines) and repair broken words and sentences. \
Then correct spelling and grammar without changing facts. Split long sentences and keep \
paragraphs short for reading on a phone. Start with a single H1 title (create a concise one \
if missing) and add H2/H3 headings only where the content needs them. Use lists for parallel \
items, tables of at most five columns for tabular data and fenced code blocks for code. Turn \
bare links into Markdown links. Keep the original language. When readability and fidelity \
conflict, fidelity wins. Output only the final Markdown, never wrapped in a code block.";

fn system_prompt(mode: ProcessingMode) -> &'static str {
    match mode {
        ProcessingMode::Optimize => OPTIMIZE_PROMPT,
        ProcessingMode::Process => PROCESS_PROMPT,
    }
}

#[derive(Clone, Debug)]
pub struct DeepSeekClient {
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

impl DeepSeekClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http: client::build("deepseek", Duration::from_secs(120))?,
        })
    }

    fn request_body(&self, text: &str, mode: ProcessingMode) -> Value {
        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt(mode) },
                { "role": "user", "content": text },
            ],
            "temperature": 0.7,
        })
    }
}

fn reply_content(v: &Value) -> Result<String> {
    let content = v
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim();
    if content.is_empty() {
        return Err(Error::External(
            "deepseek returned an empty completion".to_string(),
        ));
    }
    Ok(content.to_string())
}

#[async_trait]
impl TextRewriter for DeepSeekClient {
    async fn rewrite_text(&self, text: &str, mode: ProcessingMode) -> Result<String> {
        let key = client::require("deepseek", "DEEPSEEK_API_KEY", &self.api_key)?;
        debug!(chars = text.chars().count(), ?mode, "deepseek request");

        let resp = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&self.request_body(text, mode))
            .send()
            .await
            .map_err(|e| Error::External(format!("deepseek request error: {e}")))?;
        let resp = client::ensure_success("deepseek", resp).await?;

        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("deepseek json error: {e}")))?;
        reply_content(&v)
    }
}
