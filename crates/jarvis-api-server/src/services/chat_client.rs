use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use std::pin::Pin;

use crate::models::chat::{ChatCompletion, ChatRequest};
use crate::utils::error::CoreError;

/// Text deltas of a streamed completion
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, CoreError>> + Send>>;

/// Upstream chat and speech-to-text API.
///
/// The gateway only sees this trait, so tests swap in a mock and the
/// production binary plugs in [`LlmService`](super::LlmService).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatCompletion, CoreError>;

    async fn chat_stream(&self, request: ChatRequest) -> Result<TextStream, CoreError>;

    /// Transcribe an uploaded audio file to text
    async fn transcribe(&self, audio: Bytes, file_name: String) -> Result<String, CoreError>;
}
