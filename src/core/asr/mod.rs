//! # ASR Session
//!
//! Recognizers come in two flavours, see [`AsrMode`]. [`AsrSession`] hides
//! the difference behind `transcribe(segment)`.

mod base;
mod session;

pub use base::{
    AsrError, AsrMode, AsrResult, AsrStream, Recognition, SpeechRecognizer, TranscriptEvent,
    TranscriptKind,
};
pub use session::AsrSession;
