use chrono::Utc;
use uuid::Uuid;

use crate::domain::TaskId;

/// `<epoch-ms>-<6 hex chars>`.
///
/// Task ids travel inside callback data, which Telegram caps at 64 bytes.
pub fn new_task_id() -> TaskId {
    let rand = Uuid::new_v4().simple().to_string();
    TaskId(format!("{}-{}", Utc::now().timestamp_millis(), &rand[..6]))
}

/// Keep at most `max_chars` characters, appending `suffix` when something was cut.
pub fn truncate_text(s: &str, max_chars: usize, suffix: &str) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((byte_idx, _)) => format!("{}{}", &s[..byte_idx], suffix),
    }
}
