use std::sync::Arc;

use teloxide::prelude::*;
use tracing::error;

use scribe_core::{
    domain::{ChatId, UserId},
    receiver::InboundMessage,
};

use crate::router::AppState;

const GENERIC_FAILURE: &str = "Sorry, something went wrong. Please try again later.";

pub(super) fn to_inbound(msg: &Message) -> Option<InboundMessage> {
    let user = msg.from()?;
    Some(InboundMessage {
        chat_id: ChatId(msg.chat.id.0),
        user_id: UserId(user.id.0 as i64),
        text: msg.text().map(str::to_string),
        // Telegram lists sizes smallest first.
        photo_file_id: msg.photo().and_then(|p| p.last()).map(|p| p.file.id.clone()),
        media_group_id: msg.media_group_id().map(str::to_string),
    })
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(inbound) = to_inbound(&msg) else {
        return Ok(());
    };

    if let Err(e) = state.receiver.handle(&inbound).await {
        error!(chat_id = inbound.chat_id.0, user_id = %inbound.user_id, "message handling failed: {e}");
        let _ = bot.send_message(msg.chat.id, GENERIC_FAILURE).await;
    }
    Ok(())
}
