use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scribe_core::{
    busy::BusyTracker, callback::SaveCallbackHandler, jobs::JobQueues,
    messaging::MessagingPort, receiver::MessageReceiver,
};

use crate::handlers;

/// Shared dependencies injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub receiver: Arc<MessageReceiver>,
    pub saves: Arc<SaveCallbackHandler>,
    pub busy: Arc<BusyTracker>,
    pub queues: Arc<JobQueues>,
    pub messenger: Arc<dyn MessagingPort>,
}

/// Long-polls Telegram until `shutdown` is cancelled.
pub async fn run_polling(
    bot: Bot,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    match bot.get_me().await {
        Ok(me) => info!(username = %me.username(), "bot started"),
        Err(e) => warn!("get_me failed: {e}"),
    }

    let handler = dptree::entry()
        .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|_| async {})
        .build();

    let stop = dispatcher.shutdown_token();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        match stop.shutdown() {
            Ok(done) => done.await,
            Err(e) => warn!("dispatcher was not running: {e}"),
        }
    });

    dispatcher.dispatch().await;
    info!("dispatcher stopped");
    Ok(())
}
