//! Inbound message classification and routing onto the job queues.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    busy::BusyTracker,
    domain::{ChatId, UserId},
    jobs::{
        JobHandle, JobPayload, JobQueues, OcrSingleJob, ProcessingMode, TextJob, WebLinkJob,
    },
    media_group::{AlbumPart, MediaGroupAggregator},
    messaging::{ChatAction, MessagingPort},
    utils::new_task_id,
    Result,
};

/// Transport-neutral view of an incoming chat message.
#[derive(Clone, Debug, Default)]
pub struct InboundMessage {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub text: Option<String>,
    /// Largest size of the attached photo.
    pub photo_file_id: Option<String>,
    pub media_group_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Text,
    WebLink,
    SinglePhoto,
    MediaGroup,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Routed {
    Enqueued(JobHandle),
    /// Album part buffered; `scheduled` is true for the part that armed the flush.
    Buffered { scheduled: bool },
    Ignored,
}

fn url_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://\S+").ok()).as_ref()
}

/// First http(s) URL in `text`, if any.
pub fn find_url(text: &str) -> Option<&str> {
    url_regex()?.find(text).map(|m| m.as_str())
}

pub fn classify(msg: &InboundMessage) -> MessageType {
    if let Some(text) = msg.text.as_deref().filter(|t| !t.trim().is_empty()) {
        return if find_url(text).is_some() {
            MessageType::WebLink
        } else {
            MessageType::Text
        };
    }
    match (&msg.photo_file_id, &msg.media_group_id) {
        (Some(_), Some(_)) => MessageType::MediaGroup,
        (Some(_), None) => MessageType::SinglePhoto,
        _ => MessageType::Unknown,
    }
}

pub struct MessageReceiver {
    queues: Arc<JobQueues>,
    busy: Arc<BusyTracker>,
    albums: Arc<MediaGroupAggregator>,
    messenger: Arc<dyn MessagingPort>,
}

impl MessageReceiver {
    pub fn new(
        queues: Arc<JobQueues>,
        busy: Arc<BusyTracker>,
        albums: Arc<MediaGroupAggregator>,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        Self {
            queues,
            busy,
            albums,
            messenger,
        }
    }

    pub async fn handle(&self, msg: &InboundMessage) -> Result<Routed> {
        let kind = classify(msg);
        debug!(chat_id = msg.chat_id.0, user_id = %msg.user_id, ?kind, "message classified");

        match kind {
            MessageType::Unknown => Ok(Routed::Ignored),
            MessageType::MediaGroup => self.buffer_album_part(msg).await,
            _ => {
                self.notice_if_busy(msg).await;
                let Some(payload) = self.payload_for(kind, msg) else {
                    return Ok(Routed::Ignored);
                };
                let mut opts = self.queues.defaults().clone();
                opts.job_id = Some(payload.task_id().to_string());
                let task_id = payload.task_id().clone();
                let handle = self
                    .queues
                    .queue(payload.kind())
                    .enqueue(payload, opts)
                    .await?;
                info!(task_id = %task_id, kind = %handle.kind, user_id = %msg.user_id, "task accepted");
                self.say(msg.chat_id, ack_text(kind)).await;
                Ok(Routed::Enqueued(handle))
            }
        }
    }

    fn payload_for(&self, kind: MessageType, msg: &InboundMessage) -> Option<JobPayload> {
        let (chat_id, user_id, task_id) = (msg.chat_id, msg.user_id, new_task_id());
        Some(match kind {
            MessageType::Text => JobPayload::Text(TextJob {
                task_id,
                chat_id,
                user_id,
                text: msg.text.clone()?,
                mode: ProcessingMode::Process,
            }),
            MessageType::WebLink => JobPayload::WebLink(WebLinkJob {
                task_id,
                chat_id,
                user_id,
                url: find_url(msg.text.as_deref()?)?.to_string(),
            }),
            MessageType::SinglePhoto => JobPayload::OcrSingle(OcrSingleJob {
                task_id,
                chat_id,
                user_id,
                file_id: msg.photo_file_id.clone()?,
            }),
            MessageType::MediaGroup | MessageType::Unknown => return None,
        })
    }

    async fn buffer_album_part(&self, msg: &InboundMessage) -> Result<Routed> {
        let (Some(file_id), Some(group_id)) = (&msg.photo_file_id, &msg.media_group_id) else {
            return Ok(Routed::Ignored);
        };
        if let Err(e) = self
            .messenger
            .send_chat_action(msg.chat_id, ChatAction::Typing)
            .await
        {
            debug!(chat_id = msg.chat_id.0, "chat action failed: {e}");
        }

        let scheduled = self
            .albums
            .add_part(AlbumPart {
                chat_id: msg.chat_id,
                user_id: msg.user_id,
                group_id: group_id.clone(),
                file_id: file_id.clone(),
            })
            .await?;
        if scheduled {
            self.notice_if_busy(msg).await;
            self.say(msg.chat_id, ack_text(MessageType::MediaGroup))
                .await;
        }
        Ok(Routed::Buffered { scheduled })
    }

    async fn notice_if_busy(&self, msg: &InboundMessage) {
        match self.busy.status(msg.user_id).await {
            Ok(Some(record)) => {
                let text = format!(
                    "Your previous task ({}) is still running; this one has been queued.",
                    record.phase
                );
                self.say(msg.chat_id, &text).await;
            }
            Ok(None) => {}
            Err(e) => warn!(user_id = %msg.user_id, "busy lookup failed: {e}"),
        }
    }

    async fn say(&self, chat_id: ChatId, text: &str) {
        if let Err(e) = self.messenger.send_text(chat_id, text, None).await {
            warn!(chat_id = chat_id.0, "acknowledgement not sent: {e}");
        }
    }
}

fn ack_text(kind: MessageType) -> &'static str {
    match kind {
        MessageType::Text => "Got your text, processing…",
        MessageType::WebLink => "Got the link, reading the page…",
        MessageType::SinglePhoto => "Got the photo, recognizing text…",
        MessageType::MediaGroup => "Got your album, collecting the photos…",
        MessageType::Unknown => "",
    }
}
