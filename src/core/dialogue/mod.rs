//! Dialogue phase tracking and conversation history.

mod history;
mod state;

pub use history::{DialogueHistory, DialogueTurn, Role, ToolCallRequest};
pub use state::{
    DialogueState, DialogueStateMachine, IllegalTransition, StateChange, TRANSITIONS, is_legal,
    legal_targets,
};
