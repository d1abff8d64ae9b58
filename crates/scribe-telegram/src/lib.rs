//! Telegram adapter (teloxide).
//!
//! Implements the core `MessagingPort` and `FileSource` over the Bot API and
//! hosts the update dispatcher.

use std::time::Duration;

use async_trait::async_trait;

use teloxide::{
    net::Download,
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup},
};

use tokio::time::sleep;
use tracing::warn;

pub mod handlers;
pub mod router;

use scribe_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{ChatAction, InlineKeyboard, MessagingPort},
    ports::FileSource,
    Result,
};

const MAX_RETRIES: usize = 1;

fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
    teloxide::types::ChatId(chat_id.0)
}

fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
    teloxide::types::MessageId(message_id.0)
}

fn map_err(e: teloxide::RequestError) -> Error {
    Error::External(format!("telegram error: {e}"))
}

/// Retries once after a 429, honouring the server's `retry_after`.
async fn with_retry<T, Fut>(mut op: impl FnMut() -> Fut) -> Result<T>
where
    Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
    Fut::IntoFuture: Send,
{
    let mut attempts = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(teloxide::RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                attempts += 1;
                warn!(retry_after_secs = d.as_secs(), "telegram rate limited");
                sleep(d).await;
            }
            Err(other) => return Err(map_err(other)),
        }
    }
}

pub fn to_markup(keyboard: &InlineKeyboard) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| InlineKeyboardButton::callback(b.label.clone(), b.callback_data.clone()))
                .collect()
        })
        .collect();
    InlineKeyboardMarkup::new(rows)
}

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<MessageRef> {
        let markup = keyboard.as_ref().map(to_markup);
        let msg = with_retry(|| {
            let req = self.bot.send_message(tg_chat(chat_id), text.to_string());
            match markup.clone() {
                Some(m) => req.reply_markup(m),
                None => req,
            }
        })
        .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn edit_keyboard(&self, msg: MessageRef, keyboard: InlineKeyboard) -> Result<()> {
        let markup = to_markup(&keyboard);
        with_retry(|| {
            self.bot
                .edit_message_reply_markup(tg_chat(msg.chat_id), tg_msg_id(msg.message_id))
                .reply_markup(markup.clone())
        })
        .await?;
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        let tg_action = match action {
            ChatAction::Typing => teloxide::types::ChatAction::Typing,
        };
        with_retry(|| self.bot.send_chat_action(tg_chat(chat_id), tg_action)).await?;
        Ok(())
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        with_retry(|| {
            let mut req = self.bot.answer_callback_query(callback_id.to_string());
            if let Some(t) = text {
                req = req.text(t.to_string());
            }
            req
        })
        .await?;
        Ok(())
    }
}

/// Downloads Telegram files (photos) into memory.
#[derive(Clone)]
pub struct TelegramFiles {
    bot: Bot,
    timeout: Duration,
}

impl TelegramFiles {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl FileSource for TelegramFiles {
    async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        let file = with_retry(|| self.bot.get_file(file_id.to_string())).await?;
        if file.path.is_empty() {
            return Err(Error::External(format!("telegram file {file_id} has no path")));
        }

        let mut buf = Vec::new();
        tokio::time::timeout(self.timeout, self.bot.download_file(&file.path, &mut buf))
            .await
            .map_err(|_| Error::External(format!("telegram download of {file_id} timed out")))?
            .map_err(|e| Error::External(format!("telegram download failed: {e}")))?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::messaging::InlineButton;
    use teloxide::types::InlineKeyboardButtonKind;

    #[test]
    fn keyboard_rows_are_preserved() {
        let kb = InlineKeyboard {
            rows: vec![vec![
                InlineButton {
                    label: "📝 Save to Flomo".into(),
                    callback_data: r#"{"a":"save"}"#.into(),
                },
                InlineButton {
                    label: "📘 Save to Notion".into(),
                    callback_data: "n".into(),
                },
            ]],
        };
        let markup = to_markup(&kb);
        assert_eq!(markup.inline_keyboard.len(), 1);
        assert_eq!(markup.inline_keyboard[0].len(), 2);
        assert_eq!(markup.inline_keyboard[0][0].text, "📝 Save to Flomo");
        assert!(matches!(
            &markup.inline_keyboard[0][1].kind,
            InlineKeyboardButtonKind::CallbackData(d) if d == "n"
        ));
    }
}
