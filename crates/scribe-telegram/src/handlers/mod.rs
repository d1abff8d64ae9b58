//! Telegram update handlers.
//!
//! Each handler converts a teloxide update into its core counterpart and
//! hands it to the matching core service.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message},
};
use tracing::debug;

use crate::router::AppState;

mod callback;
mod commands;
mod message;

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    callback::handle_callback(bot, q, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if let Some(text) = msg.text() {
        match commands::route(text) {
            commands::Route::Command(cmd) => {
                return commands::handle_command(bot, msg, cmd, state).await;
            }
            commands::Route::UnknownCommand => {
                debug!(chat_id = msg.chat.id.0, "ignoring unknown command {text:?}");
                return Ok(());
            }
            commands::Route::Content => {}
        }
    }
    message::handle_message(bot, msg, state).await
}
