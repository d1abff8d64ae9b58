//! Outbound messaging abstractions (Telegram is the only transport today).

pub mod port;
pub mod throttled;
pub mod types;

pub use port::MessagingPort;
pub use types::{ChatAction, InlineButton, InlineKeyboard};
