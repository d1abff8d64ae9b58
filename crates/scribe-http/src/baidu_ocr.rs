//! Baidu picture-translation endpoint used as a plain OCR service
//! (source and target language are both `zh`).

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use scribe_core::{errors::Error, ports::ImageRecognizer, Result};
use serde_json::Value;
use tracing::debug;

use crate::client;

const OCR_URL: &str = "https://fanyi-api.baidu.com/api/trans/sdk/picture";
const CUID: &str = "telegram_bot";
const MAC: &str = "00:00:00:00:00:00";

#[derive(Clone, Debug)]
pub struct BaiduOcrClient {
    appid: String,
    secret: String,
    http: reqwest::Client,
}

/// `md5(appid + md5(image) + salt + cuid + mac + secret)`, lowercase hex.
pub fn sign(appid: &str, secret: &str, image: &[u8], salt: &str) -> String {
    let image_md5 = format!("{:x}", md5::compute(image));
    let raw = format!("{appid}{image_md5}{salt}{CUID}{MAC}{secret}");
    format!("{:x}", md5::compute(raw.as_bytes()))
}

fn recognized_text(v: &Value) -> Result<String> {
    let Some(segments) = v.pointer("/data/content").and_then(Value::as_array) else {
        let code = v.get("error_code").map(ToString::to_string).unwrap_or_default();
        return Err(Error::External(format!(
            "baidu ocr returned no content (error_code {code})"
        )));
    };
    Ok(segments
        .iter()
        .filter_map(|s| s.get("src").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n"))
}

impl BaiduOcrClient {
    pub fn new(appid: impl Into<String>, secret: impl Into<String>) -> Result<Self> {
        Ok(Self {
            appid: appid.into(),
            secret: secret.into(),
            http: client::build("baidu ocr", Duration::from_secs(30))?,
        })
    }
}

#[async_trait]
impl ImageRecognizer for BaiduOcrClient {
    async fn recognize_image(&self, image: Vec<u8>) -> Result<String> {
        let appid = client::require("baidu ocr", "BAIDU_APPID", &self.appid)?;
        let secret = client::require("baidu ocr", "BAIDU_SECRET", &self.secret)?;

        let salt = Utc::now().timestamp_millis().to_string();
        let sign = sign(appid, secret, &image, &salt);
        debug!(bytes = image.len(), "baidu ocr request");

        let part = Part::bytes(image)
            .file_name("image.jpg")
            .mime_str("image/jpeg")
            .map_err(|e| Error::External(format!("baidu ocr multipart error: {e}")))?;
        let form = Form::new()
            .part("image", part)
            .text("from", "zh")
            .text("to", "zh")
            .text("appid", appid.to_string())
            .text("salt", salt)
            .text("cuid", CUID)
            .text("mac", MAC)
            .text("version", "3")
            .text("sign", sign);

        let resp = self
            .http
            .post(OCR_URL)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::External(format!("baidu ocr request error: {e}")))?;
        let resp = client::ensure_success("baidu ocr", resp).await?;

        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("baidu ocr json error: {e}")))?;
        recognized_text(&v)
    }
}
