use std::sync::Arc;

use anyhow::Context;
use teloxide::Bot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scribe_core::{
    busy::BusyTracker,
    callback::SaveCallbackHandler,
    config::Config,
    delivery::ResultDelivery,
    jobs::{JobHandler, JobKind, JobQueues, WorkerPool},
    ledger::SaveLedger,
    media_group::MediaGroupAggregator,
    messaging::{
        throttled::{ThrottleConfig, ThrottledMessenger},
        MessagingPort,
    },
    pipeline::Pipelines,
    rate_limit::RateLimiter,
    receiver::MessageReceiver,
    runner::TaskRunner,
    store::{KeyValueStore, MemoryStore},
};
use scribe_http::{BaiduOcrClient, DeepSeekClient, FlomoClient, MetasoClient, NotionClient};
use scribe_telegram::{
    router::{self, AppState},
    TelegramFiles, TelegramMessenger,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    scribe_core::logging::init("scribe")?;

    let cfg = Config::load().context("loading configuration")?;
    log_missing_collaborators(&cfg);

    let store = open_store(&cfg).await?;
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    // 429 RetryAfter is still retried inside the Telegram adapter.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let pipelines = Arc::new(Pipelines::new(
        Arc::new(DeepSeekClient::new(
            cfg.deepseek_api_key.clone().unwrap_or_default(),
            cfg.deepseek_base_url.clone(),
            cfg.deepseek_model.clone(),
        )?),
        Arc::new(BaiduOcrClient::new(
            cfg.baidu_appid.clone().unwrap_or_default(),
            cfg.baidu_secret.clone().unwrap_or_default(),
        )?),
        Arc::new(MetasoClient::new(
            cfg.metaso_api_key.clone().unwrap_or_default(),
        )?),
        Arc::new(TelegramFiles::new(bot.clone())),
        RateLimiter::new(cfg.ocr_rate_requests, cfg.ocr_rate_window),
        RateLimiter::new(cfg.llm_rate_requests, cfg.llm_rate_window),
    ));

    let queues = Arc::new(JobQueues::new(store.clone(), cfg.job_options()));
    let busy = Arc::new(BusyTracker::new(store.clone(), cfg.busy_config()));
    let delivery = Arc::new(ResultDelivery::new(
        messenger.clone(),
        store.clone(),
        cfg.delivery_config(),
    ));
    let ledger = Arc::new(SaveLedger::new(store.clone(), cfg.result_ttl));

    let runner: Arc<dyn JobHandler> =
        Arc::new(TaskRunner::new(busy.clone(), pipelines, delivery));
    let shutdown = CancellationToken::new();
    let pools: Vec<WorkerPool> = JobKind::ALL
        .iter()
        .map(|kind| {
            WorkerPool::spawn(
                queues.queue(*kind),
                runner.clone(),
                cfg.worker_config(),
                shutdown.child_token(),
            )
        })
        .collect();

    let albums = Arc::new(MediaGroupAggregator::new(
        store.clone(),
        queues.clone(),
        cfg.media_group_config(),
    ));
    let state = Arc::new(AppState {
        receiver: Arc::new(MessageReceiver::new(
            queues.clone(),
            busy.clone(),
            albums,
            messenger.clone(),
        )),
        saves: Arc::new(SaveCallbackHandler::new(
            store,
            ledger,
            messenger.clone(),
            Arc::new(FlomoClient::new(cfg.flomo_webhook.clone().unwrap_or_default())?),
            Arc::new(NotionClient::new(
                cfg.notion_api_key.clone().unwrap_or_default(),
                cfg.notion_page_id.clone().unwrap_or_default(),
            )?),
        )),
        busy,
        queues,
        messenger,
    });

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested"),
                Err(e) => warn!("ctrl-c handler failed: {e}"),
            }
            shutdown.cancel();
        });
    }

    let polled = router::run_polling(bot, state, shutdown.clone()).await;
    shutdown.cancel();
    for pool in pools {
        pool.join().await;
    }
    polled.context("telegram polling failed")
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn KeyValueStore>> {
    #[cfg(feature = "redis")]
    if let Some(url) = &cfg.redis_url {
        let store = scribe_core::store::redis::RedisStore::connect(url)
            .await
            .context("connecting to redis")?;
        info!("using redis store");
        return Ok(Arc::new(store));
    }

    if cfg.redis_url.is_some() && !cfg!(feature = "redis") {
        warn!("REDIS_URL is set but this build has no redis support; using in-memory store");
    }
    Ok(Arc::new(MemoryStore::new()))
}

fn log_missing_collaborators(cfg: &Config) {
    let checks = [
        ("DEEPSEEK_API_KEY", cfg.deepseek_api_key.is_some()),
        ("BAIDU_APPID", cfg.baidu_appid.is_some()),
        ("BAIDU_SECRET", cfg.baidu_secret.is_some()),
        ("METASO_API_KEY", cfg.metaso_api_key.is_some()),
        ("FLOMO_WEBHOOK", cfg.flomo_webhook.is_some()),
        ("NOTION_API_KEY", cfg.notion_api_key.is_some()),
        ("NOTION_PAGE_ID", cfg.notion_page_id.is_some()),
    ];
    for (name, set) in checks {
        if !set {
            warn!(var = name, "not configured; the matching feature will fail at use");
        }
    }
}
