use std::{env, fs, path::Path, time::Duration};

use crate::{
    busy::BusyConfig,
    delivery::DeliveryConfig,
    errors::Error,
    jobs::{BackoffPolicy, JobOptions, WorkerConfig},
    media_group::MediaGroupConfig,
    Result,
};

/// Typed configuration, read from the environment (plus an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Transport
    pub telegram_bot_token: String,

    // Store
    pub redis_url: Option<String>,

    // Collaborators
    pub deepseek_api_key: Option<String>,
    pub deepseek_base_url: String,
    pub deepseek_model: String,
    pub baidu_appid: Option<String>,
    pub baidu_secret: Option<String>,
    pub metaso_api_key: Option<String>,
    pub flomo_webhook: Option<String>,
    pub notion_api_key: Option<String>,
    pub notion_page_id: Option<String>,

    // Albums
    pub media_group_timeout: Duration,

    // Jobs
    pub job_attempts: u32,
    pub job_backoff: Duration,
    pub worker_concurrency: usize,
    pub job_lease: Duration,

    // Busy / results
    pub busy_ttl: Duration,
    pub result_ttl: Duration,

    // Delivery
    /// UTF-16 code units per message.
    pub chunk_limit: usize,
    pub chunk_pause: Duration,

    // Rate limits
    pub ocr_rate_requests: u32,
    pub ocr_rate_window: Duration,
    pub llm_rate_requests: u32,
    pub llm_rate_window: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }

        let chunk_limit = env_usize("CHUNK_LIMIT").unwrap_or(3500);
        if chunk_limit == 0 || chunk_limit > 4096 {
            return Err(Error::Config(format!(
                "CHUNK_LIMIT must be between 1 and 4096, got {chunk_limit}"
            )));
        }

        Ok(Self {
            telegram_bot_token,
            redis_url: env_str("REDIS_URL").and_then(non_empty),
            deepseek_api_key: env_str("DEEPSEEK_API_KEY").and_then(non_empty),
            deepseek_base_url: env_str("DEEPSEEK_BASE_URL")
                .and_then(non_empty)
                .unwrap_or_else(|| "https://api.deepseek.com".to_string()),
            deepseek_model: env_str("DEEPSEEK_MODEL")
                .and_then(non_empty)
                .unwrap_or_else(|| "deepseek-chat".to_string()),
            baidu_appid: env_str("BAIDU_APPID").and_then(non_empty),
            baidu_secret: env_str("BAIDU_SECRET").and_then(non_empty),
            metaso_api_key: env_str("METASO_API_KEY").and_then(non_empty),
            flomo_webhook: env_str("FLOMO_WEBHOOK").and_then(non_empty),
            notion_api_key: env_str("NOTION_API_KEY").and_then(non_empty),
            notion_page_id: env_str("NOTION_PAGE_ID").and_then(non_empty),
            media_group_timeout: Duration::from_millis(
                env_u64("MEDIA_GROUP_TIMEOUT_MS").unwrap_or(2500),
            ),
            job_attempts: env_u32("JOB_ATTEMPTS").unwrap_or(3).max(1),
            job_backoff: Duration::from_millis(env_u64("JOB_BACKOFF_MS").unwrap_or(2000)),
            worker_concurrency: env_usize("WORKER_CONCURRENCY").unwrap_or(1).max(1),
            job_lease: Duration::from_millis(env_u64("JOB_LEASE_MS").unwrap_or(300_000)),
            busy_ttl: Duration::from_secs(env_u64("BUSY_TTL_SECS").unwrap_or(600)),
            result_ttl: Duration::from_secs(env_u64("RESULT_TTL_SECS").unwrap_or(86_400)),
            chunk_limit,
            chunk_pause: Duration::from_millis(env_u64("CHUNK_PAUSE_MS").unwrap_or(500)),
            ocr_rate_requests: env_u32("OCR_RATE_REQUESTS").unwrap_or(2),
            ocr_rate_window: Duration::from_millis(env_u64("OCR_RATE_WINDOW_MS").unwrap_or(1000)),
            llm_rate_requests: env_u32("LLM_RATE_REQUESTS").unwrap_or(1),
            llm_rate_window: Duration::from_millis(env_u64("LLM_RATE_WINDOW_MS").unwrap_or(1000)),
        })
    }

    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            max_attempts: self.job_attempts,
            backoff: BackoffPolicy::Exponential {
                base: self.job_backoff,
            },
            ..JobOptions::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.worker_concurrency,
            lease: self.job_lease,
            ..WorkerConfig::default()
        }
    }

    pub fn busy_config(&self) -> BusyConfig {
        BusyConfig {
            ttl: self.busy_ttl,
            ..BusyConfig::default()
        }
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            chunk_limit: self.chunk_limit,
            chunk_pause: self.chunk_pause,
            result_ttl: self.result_ttl,
            ..DeliveryConfig::default()
        }
    }

    pub fn media_group_config(&self) -> MediaGroupConfig {
        MediaGroupConfig {
            window: self.media_group_timeout,
            ..MediaGroupConfig::default()
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim().trim_start_matches("export ").trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }
        out.push((key.to_string(), val));
    }
    out
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotenv_parsing() {
        let parsed = parse_dotenv(
            "# comment\n\nTELEGRAM_BOT_TOKEN=\"123:abc\"\nexport REDIS_URL=redis://localhost\nBROKEN\nEMPTY=\nQUOTED='x y'\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("TELEGRAM_BOT_TOKEN".to_string(), "123:abc".to_string()),
                ("REDIS_URL".to_string(), "redis://localhost".to_string()),
                ("EMPTY".to_string(), String::new()),
                ("QUOTED".to_string(), "x y".to_string()),
            ]
        );
    }

    #[test]
    fn non_empty_filters_blank() {
        assert_eq!(non_empty("  ".to_string()), None);
        assert_eq!(non_empty("k".to_string()), Some("k".to_string()));
    }
}
