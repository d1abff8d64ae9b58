//! Hand-written fakes of the ports, shared by unit tests.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageId, MessageRef, UserId},
    jobs::ProcessingMode,
    messaging::{ChatAction, InlineKeyboard, MessagingPort},
    ports::{FileSource, ImageRecognizer, NoteSink, TextRewriter, WebFetcher},
    Error, Result,
};

/// Records sent messages; fails the first `fail_first` sends.
#[derive(Default)]
pub struct FakeMessenger {
    pub sent: Mutex<Vec<(ChatId, String, Option<InlineKeyboard>)>>,
    pub edits: Mutex<Vec<(MessageRef, InlineKeyboard)>>,
    pub answers: Mutex<Vec<(String, Option<String>)>>,
    pub actions: Mutex<Vec<(ChatId, ChatAction)>>,
    pub fail_first: Mutex<usize>,
    pub fail_always: bool,
}

impl FakeMessenger {
    pub fn texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t, _)| t.clone())
            .collect()
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    async fn send_text(
        &self,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<MessageRef> {
        {
            let mut f = self.fail_first.lock().unwrap();
            if self.fail_always || *f > 0 {
                *f = f.saturating_sub(1);
                return Err(Error::External("telegram unavailable".into()));
            }
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((chat_id, text.to_string(), keyboard));
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(sent.len() as i32),
        })
    }

    async fn edit_keyboard(&self, msg: MessageRef, keyboard: InlineKeyboard) -> Result<()> {
        self.edits.lock().unwrap().push((msg, keyboard));
        Ok(())
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        self.actions.lock().unwrap().push((chat_id, action));
        Ok(())
    }

    async fn answer_callback_query(&self, callback_id: &str, text: Option<&str>) -> Result<()> {
        self.answers
            .lock()
            .unwrap()
            .push((callback_id.to_string(), text.map(str::to_string)));
        Ok(())
    }
}

/// Echoes `rewritten: <text>`, or fails when `fail` is set.
#[derive(Default)]
pub struct FakeRewriter {
    pub calls: Mutex<Vec<(String, ProcessingMode)>>,
    pub fail: bool,
}

#[async_trait]
impl TextRewriter for FakeRewriter {
    async fn rewrite_text(&self, text: &str, mode: ProcessingMode) -> Result<String> {
        self.calls.lock().unwrap().push((text.to_string(), mode));
        if self.fail {
            return Err(Error::External("llm unavailable".into()));
        }
        Ok(format!("rewritten: {text}"))
    }
}

/// Image bytes are the file id; recognized text is looked up by it.
#[derive(Default)]
pub struct FakeOcr {
    pub texts: HashMap<String, String>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeOcr {
    pub fn with(pairs: &[(&str, &str)]) -> Self {
        Self {
            texts: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ImageRecognizer for FakeOcr {
    async fn recognize_image(&self, image: Vec<u8>) -> Result<String> {
        let key = String::from_utf8_lossy(&image).to_string();
        self.calls.lock().unwrap().push(key.clone());
        Ok(self.texts.get(&key).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl FileSource for FakeOcr {
    async fn download(&self, file_id: &str) -> Result<Vec<u8>> {
        Ok(file_id.as_bytes().to_vec())
    }
}

#[derive(Default)]
pub struct FakeFetcher {
    pub body: String,
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl WebFetcher for FakeFetcher {
    async fn fetch_webpage(&self, url: &str) -> Result<String> {
        self.calls.lock().unwrap().push(url.to_string());
        Ok(self.body.clone())
    }
}

#[derive(Default)]
pub struct FakeSink {
    pub saved: Mutex<Vec<(String, UserId)>>,
    pub fail: bool,
}

#[async_trait]
impl NoteSink for FakeSink {
    async fn save(&self, text: &str, user_id: UserId) -> Result<()> {
        if self.fail {
            return Err(Error::External("sink down".into()));
        }
        self.saved.lock().unwrap().push((text.to_string(), user_id));
        Ok(())
    }
}
