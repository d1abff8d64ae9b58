//! Flomo incoming-webhook sink.

use std::time::Duration;

use async_trait::async_trait;
use scribe_core::{domain::UserId, errors::Error, ports::NoteSink, Result};
use serde_json::json;
use tracing::info;

use crate::client;

#[derive(Clone, Debug)]
pub struct FlomoClient {
    webhook: String,
    http: reqwest::Client,
}

impl FlomoClient {
    pub fn new(webhook: impl Into<String>) -> Result<Self> {
        Ok(Self {
            webhook: webhook.into(),
            http: client::build("flomo", Duration::from_secs(15))?,
        })
    }
}

#[async_trait]
impl NoteSink for FlomoClient {
    async fn save(&self, text: &str, user_id: UserId) -> Result<()> {
        let webhook = client::require("flomo", "FLOMO_WEBHOOK", &self.webhook)?;

        let resp = self
            .http
            .post(webhook)
            .json(&json!({ "content": text }))
            .send()
            .await
            .map_err(|e| Error::External(format!("flomo request error: {e}")))?;
        client::ensure_success("flomo", resp).await?;

        info!(user_id = %user_id, chars = text.chars().count(), "saved to flomo");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_webhook_is_a_config_error() {
        let c = FlomoClient::new("  ").unwrap();
        let err = c.save("note", UserId(1)).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
