//! HTTP collaborators: rewriting, OCR, web reading and note sinks.
//!
//! Every client implements one of the `scribe_core::ports` traits and maps
//! transport failures into `Error::External`.

mod client;

pub mod baidu_ocr;
pub mod deepseek;
pub mod flomo;
pub mod metaso;
pub mod notion;

pub use baidu_ocr::BaiduOcrClient;
pub use deepseek::DeepSeekClient;
pub use flomo::FlomoClient;
pub use metaso::MetasoClient;
pub use notion::NotionClient;
