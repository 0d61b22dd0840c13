//! Model client module for AI inference.

mod client;

pub use client::{
    extract_json, LanguageModel, MessageBuilder, ModelClient, ModelConfig, ModelError,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_SECS,
};
