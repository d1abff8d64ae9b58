//! Metaso reader: fetches the readable text of a page.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use scribe_core::{errors::Error, ports::WebFetcher, Result};
use serde_json::{json, Value};
use tracing::debug;

use crate::client;

const READER_URL: &str = "https://metaso.cn/api/v1/reader";

#[derive(Clone, Debug)]
pub struct MetasoClient {
    api_key: String,
    http: reqwest::Client,
}

impl MetasoClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            api_key: api_key.into(),
            http: client::build("metaso", Duration::from_secs(60))?,
        })
    }
}

/// The reader answers in plain text; a JSON body is unwrapped from
/// `content` or `text` when present.
fn page_text(body: String) -> String {
    match serde_json::from_str::<Value>(&body) {
        Ok(Value::Object(map)) => ["content", "text"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or(body),
        Ok(Value::String(s)) => s,
        _ => body,
    }
}

#[async_trait]
impl WebFetcher for MetasoClient {
    async fn fetch_webpage(&self, url: &str) -> Result<String> {
        let key = client::require("metaso", "METASO_API_KEY", &self.api_key)?;
        debug!(url, "metaso reader request");

        let resp = self
            .http
            .post(READER_URL)
            .bearer_auth(key)
            .header(ACCEPT, "text/plain")
            .json(&json!({ "url": url }))
            .send()
            .await
            .map_err(|e| Error::External(format!("metaso request error: {e}")))?;
        let resp = client::ensure_success("metaso", resp).await?;

        let body = resp
            .text()
            .await
            .map_err(|e| Error::External(format!("metaso body error: {e}")))?;
        Ok(page_text(body))
    }
}
