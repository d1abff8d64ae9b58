use std::time::Duration;

use scribe_core::{errors::Error, Result};

pub(crate) fn build(service: &str, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::External(format!("{service} client build error: {e}")))
}

/// Turns a non-2xx response into an error carrying the start of the body.
pub(crate) async fn ensure_success(
    service: &str,
    resp: reqwest::Response,
) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(Error::External(format!(
        "{service} request failed: {status} {}",
        body.chars().take(200).collect::<String>()
    )))
}

pub(crate) fn require<'a>(service: &str, name: &str, value: &'a str) -> Result<&'a str> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{service}: {name} is not configured")));
    }
    Ok(value)
}
