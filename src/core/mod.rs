//! The per-connection streaming dialogue engine and the services it is
//! built from.
//!
//! ```text
//! device → codec → ingress/VAD → ASR → dialogue (LLM + tools) → TTS → queue → egress → device
//! ```

pub mod asr;
pub mod codec;
pub mod dialogue;
pub mod ingress;
pub mod interruption;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod providers;
pub mod session;
pub mod state;
pub mod tools;
pub mod transition;
pub mod tts;
pub mod types;
pub mod worker_pool;

// Re-export commonly used types for convenience
pub use dialogue::{DialogueState, DialogueStateMachine};
pub use providers::{ProviderRegistry, SelectedModules};
pub use session::{Session, SessionError, SessionResult};
pub use types::SessionId;

// Re-export CoreState for external use
pub use state::CoreState;
