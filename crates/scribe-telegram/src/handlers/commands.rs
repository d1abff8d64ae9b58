use std::sync::Arc;

use teloxide::prelude::*;
use tracing::warn;

use scribe_core::{domain::UserId, status::StatusReport};

use crate::router::AppState;

const GREETING: &str = "Welcome! Send me text, a link or photos to get started. \
Send an album in one go so its photos are read together.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Start,
    Status,
}

impl Command {
    /// Telegram may send `/cmd@botname arg1 ...`.
    pub fn parse(text: &str) -> Option<Self> {
        let first = text.trim().split(char::is_whitespace).next()?;
        let name = first.strip_prefix('/')?.split('@').next()?.to_lowercase();
        match name.as_str() {
            "start" | "help" => Some(Self::Start),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

/// What to do with an incoming text message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Command(Command),
    /// Slash-prefixed but not a command we know; dropped.
    UnknownCommand,
    /// Anything else goes to the processing pipeline.
    Content,
}

pub fn route(text: &str) -> Route {
    if !text.trim_start().starts_with('/') {
        return Route::Content;
    }
    match Command::parse(text) {
        Some(cmd) => Route::Command(cmd),
        None => Route::UnknownCommand,
    }
}

pub async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let reply = match cmd {
        Command::Start => GREETING.to_string(),
        Command::Status => match msg.from() {
            None => "Could not identify the user.".to_string(),
            Some(user) => {
                let user_id = UserId(user.id.0 as i64);
                match StatusReport::collect(&state.busy, &state.queues, user_id).await {
                    Ok(report) => report.render(),
                    Err(e) => {
                        warn!(user_id = %user_id, "status lookup failed: {e}");
                        "Status is unavailable right now.".to_string()
                    }
                }
            }
        },
    };

    bot.send_message(msg.chat.id, reply)
        .disable_notification(cmd == Command::Start)
        .await?;
    Ok(())
}
