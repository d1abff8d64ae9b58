use std::sync::Arc;

use teloxide::prelude::*;
use tracing::{debug, error};

use scribe_core::{
    callback::SaveClick,
    domain::{ChatId, MessageId, MessageRef, UserId},
};

use crate::router::AppState;

fn to_click(q: &CallbackQuery) -> SaveClick {
    let message = q.message.as_ref().map(|m| MessageRef {
        chat_id: ChatId(m.chat.id.0),
        message_id: MessageId(m.id.0),
    });
    SaveClick {
        callback_id: q.id.clone(),
        user_id: UserId(q.from.id.0 as i64),
        chat_id: message.map(|m| m.chat_id),
        message,
        data: q.data.clone().unwrap_or_default(),
    }
}

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let click = to_click(&q);

    match state.saves.handle(&click).await {
        Ok(outcome) => debug!(user_id = %click.user_id, ?outcome, "callback handled"),
        Err(e) => {
            error!(user_id = %click.user_id, "callback failed: {e}");
            // Always answer so the client stops its spinner.
            let _ = bot.answer_callback_query(q.id).await;
        }
    }
    Ok(())
}
