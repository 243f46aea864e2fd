//! Short-term memory backend interface.

use async_trait::async_trait;

use crate::core::dialogue::DialogueTurn;

#[derive(Debug, Clone, thiserror::Error)]
pub enum MemoryError {
    #[error("Memory backend unavailable: {0}")]
    Unavailable(String),
    #[error("Memory backend error: {0}")]
    Backend(String),
}

pub type MemoryResult<T> = Result<T, MemoryError>;

#[async_trait]
pub trait Memory: Send + Sync {
    /// Persist the finished conversation of a device.
    async fn save(&self, device_id: &str, history: &[DialogueTurn]) -> MemoryResult<()>;

    /// Return a summary relevant to `text`; empty when nothing is known.
    async fn query(&self, device_id: &str, text: &str) -> MemoryResult<String>;

    fn name(&self) -> &'static str;
}

/// Memory that remembers nothing.
pub struct NoopMemory;

#[async_trait]
impl Memory for NoopMemory {
    async fn save(&self, _device_id: &str, _history: &[DialogueTurn]) -> MemoryResult<()> {
        Ok(())
    }

    async fn query(&self, _device_id: &str, _text: &str) -> MemoryResult<String> {
        Ok(String::new())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
