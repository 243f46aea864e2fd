//! # Language Model Interface
//!
//! Backends stream [`LlmChunk`]s: plain text deltas and tool-call requests.
//! The dialogue loop consumes the stream and checks its abort handle between
//! chunks, so dropping the stream is the cancellation mechanism.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::core::dialogue::{DialogueTurn, ToolCallRequest};

#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Provider error: {0}")]
    ProviderError(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Request timed out")]
    Timeout,
}

pub type LlmResult<T> = Result<T, LlmError>;

/// One element of a streamed model reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmChunk {
    Text(String),
    ToolCalls(Vec<ToolCallRequest>),
}

pub type LlmStream = BoxStream<'static, LlmResult<LlmChunk>>;

/// Function schema offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Stream a reply for `messages`, optionally offering `functions`.
    async fn chat(&self, messages: Vec<DialogueTurn>, functions: Vec<FunctionSpec>) -> LlmResult<LlmStream>;

    /// One-shot completion used for short utterances.
    async fn complete(&self, prompt: &str) -> LlmResult<String> {
        let mut stream = self
            .chat(vec![DialogueTurn::user(prompt)], Vec::new())
            .await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            if let LlmChunk::Text(delta) = chunk? {
                text.push_str(&delta);
            }
        }
        Ok(text)
    }

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    struct Scripted;

    #[async_trait]
    impl LanguageModel for Scripted {
        async fn chat(&self, messages: Vec<DialogueTurn>, _: Vec<FunctionSpec>) -> LlmResult<LlmStream> {
            let text = messages.last().map(|m| m.text.clone()).unwrap_or_default();
            Ok(stream::iter(vec![
                Ok(LlmChunk::Text("re: ".into())),
                Ok(LlmChunk::Text(text)),
            ])
            .boxed())
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn test_complete_concatenates_text() {
        assert_eq!(Scripted.complete("hi").await.unwrap(), "re: hi");
    }
}
