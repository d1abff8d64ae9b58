//! Core task orchestration for the scribe bot.
//!
//! Framework-agnostic: Telegram and the HTTP collaborators (OCR, LLM, web
//! reader, note services) live behind ports implemented in adapter crates.

pub mod busy;
pub mod callback;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod errors;
pub mod jobs;
pub mod ledger;
pub mod logging;
pub mod media_group;
pub mod messaging;
pub mod pipeline;
pub mod ports;
pub mod rate_limit;
pub mod receiver;
pub mod runner;
pub mod status;
pub mod store;
pub mod utils;

#[cfg(test)]
mod testing;

pub use errors::{Error, Result};
