//! Collaborator ports. Adapter crates implement these; the core only sees traits.

use async_trait::async_trait;

use crate::{domain::UserId, jobs::ProcessingMode, Result};

/// Optical text recognition over raw image bytes.
#[async_trait]
pub trait ImageRecognizer: Send + Sync {
    async fn recognize_image(&self, image: Vec<u8>) -> Result<String>;
}

/// Language-model rewriting.
#[async_trait]
pub trait TextRewriter: Send + Sync {
    async fn rewrite_text(&self, text: &str, mode: ProcessingMode) -> Result<String>;
}

/// Readable text of a web page.
#[async_trait]
pub trait WebFetcher: Send + Sync {
    async fn fetch_webpage(&self, url: &str) -> Result<String>;
}

/// Downloads a transport file id (e.g. a Telegram photo) into memory.
#[async_trait]
pub trait FileSource: Send + Sync {
    async fn download(&self, file_id: &str) -> Result<Vec<u8>>;
}

/// External note service reached by a save action.
#[async_trait]
pub trait NoteSink: Send + Sync {
    async fn save(&self, text: &str, user_id: UserId) -> Result<()>;
}
