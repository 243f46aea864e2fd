//! Dialogue state machine.
//!
//! The legal edges live in a single table, [`TRANSITIONS`]; [`is_legal`] is
//! the only gate. Transitions are serialized per session through a
//! re-entrant lock so compound operations can nest `transition` calls.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::core::types::SessionId;

const TRANSITION_LOG_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DialogueState {
    Idle,
    ProcessingIntent,
    PlayingTransition,
    ExecutingTools,
    GeneratingResponse,
    Speaking,
    Interrupted,
    Backchanneling,
    Error,
}

impl DialogueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::ProcessingIntent => "PROCESSING_INTENT",
            Self::PlayingTransition => "PLAYING_TRANSITION",
            Self::ExecutingTools => "EXECUTING_TOOLS",
            Self::GeneratingResponse => "GENERATING_RESPONSE",
            Self::Speaking => "SPEAKING",
            Self::Interrupted => "INTERRUPTED",
            Self::Backchanneling => "BACKCHANNELING",
            Self::Error => "ERROR",
        }
    }

    /// States in which the assistant holds the floor.
    pub fn is_active_output(&self) -> bool {
        matches!(
            self,
            Self::PlayingTransition | Self::ExecutingTools | Self::GeneratingResponse | Self::Speaking
        )
    }

    /// No audio may reach the client in these states.
    pub fn blocks_audio(&self) -> bool {
        matches!(self, Self::Idle | Self::Error)
    }
}

impl fmt::Display for DialogueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use DialogueState::*;

/// Legal edges, indexed by source state.
pub const TRANSITIONS: &[(DialogueState, &[DialogueState])] = &[
    (Idle, &[ProcessingIntent, Error]),
    (
        ProcessingIntent,
        &[PlayingTransition, ExecutingTools, GeneratingResponse, Speaking, Idle, Interrupted, Error],
    ),
    (
        PlayingTransition,
        &[ExecutingTools, GeneratingResponse, Speaking, Idle, Interrupted, Error],
    ),
    (
        ExecutingTools,
        &[GeneratingResponse, Speaking, ProcessingIntent, Idle, Interrupted, Error],
    ),
    (
        GeneratingResponse,
        &[Speaking, ProcessingIntent, PlayingTransition, ExecutingTools, Idle, Interrupted, Error],
    ),
    (Speaking, &[ProcessingIntent, Idle, Interrupted, Error]),
    (Interrupted, &[ProcessingIntent, Idle, Error]),
    (Backchanneling, &[Speaking, ProcessingIntent, Idle, Interrupted, Error]),
    (Error, &[Idle, ProcessingIntent]),
];

pub fn legal_targets(from: DialogueState) -> &'static [DialogueState] {
    TRANSITIONS
        .iter()
        .find(|(state, _)| *state == from)
        .map(|(_, targets)| *targets)
        .unwrap_or(&[])
}

pub fn is_legal(from: DialogueState, to: DialogueState) -> bool {
    legal_targets(from).contains(&to)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Illegal state transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: DialogueState,
    pub to: DialogueState,
}

/// One applied transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub from: DialogueState,
    pub to: DialogueState,
    pub reason: &'static str,
    pub time_in_previous: Duration,
}

struct Inner {
    state: DialogueState,
    entered_at: Instant,
    log: VecDeque<StateChange>,
    rejected: u64,
}

pub struct DialogueStateMachine {
    session_id: SessionId,
    inner: ReentrantMutex<RefCell<Inner>>,
    tx: watch::Sender<DialogueState>,
}

impl DialogueStateMachine {
    pub fn new(session_id: SessionId) -> Self {
        let (tx, _) = watch::channel(Idle);
        Self {
            session_id,
            inner: ReentrantMutex::new(RefCell::new(Inner {
                state: Idle,
                entered_at: Instant::now(),
                log: VecDeque::with_capacity(TRANSITION_LOG_LEN),
                rejected: 0,
            })),
            tx,
        }
    }

    pub fn current(&self) -> DialogueState {
        let guard = self.inner.lock();
        let state = guard.borrow().state;
        state
    }

    pub fn subscribe(&self) -> watch::Receiver<DialogueState> {
        self.tx.subscribe()
    }

    pub fn time_in_state(&self) -> Duration {
        let guard = self.inner.lock();
        let elapsed = guard.borrow().entered_at.elapsed();
        elapsed
    }

    /// Attempt `current → to`. Illegal edges are logged and leave the state untouched.
    pub fn transition(
        &self,
        to: DialogueState,
        reason: &'static str,
    ) -> Result<StateChange, IllegalTransition> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let from = inner.state;

        if !is_legal(from, to) {
            inner.rejected += 1;
            warn!(
                session_id = %self.session_id,
                "Rejected state transition {} -> {} ({})", from, to, reason
            );
            return Err(IllegalTransition { from, to });
        }

        let now = Instant::now();
        let change = StateChange {
            from,
            to,
            reason,
            time_in_previous: now.duration_since(inner.entered_at),
        };
        inner.state = to;
        inner.entered_at = now;
        if inner.log.len() == TRANSITION_LOG_LEN {
            inner.log.pop_front();
        }
        inner.log.push_back(change.clone());
        drop(inner);

        debug!(
            session_id = %self.session_id,
            "State {} -> {} after {:?} ({})", from, to, change.time_in_previous, reason
        );
        self.tx.send_replace(to);
        Ok(change)
    }

    /// Transition only when the current state is one of `from`.
    ///
    /// Returns `Ok(None)` when the current state is not in `from`.
    pub fn transition_from(
        &self,
        from: &[DialogueState],
        to: DialogueState,
        reason: &'static str,
    ) -> Result<Option<StateChange>, IllegalTransition> {
        let _guard = self.inner.lock();
        if !from.contains(&self.current()) {
            return Ok(None);
        }
        self.transition(to, reason).map(Some)
    }

    /// Run `f` while holding the transition lock.
    ///
    /// Nested `transition` calls inside `f` are allowed.
    pub fn atomically<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        let _guard = self.inner.lock();
        f(self)
    }

    /// Recent transitions, oldest first.
    pub fn transition_log(&self) -> Vec<StateChange> {
        let guard = self.inner.lock();
        let log = guard.borrow().log.iter().cloned().collect();
        log
    }

    pub fn rejected_count(&self) -> u64 {
        let guard = self.inner.lock();
        let rejected = guard.borrow().rejected;
        rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> DialogueStateMachine {
        DialogueStateMachine::new(SessionId::new())
    }

    #[test]
    fn test_every_state_has_a_row() {
        let all = [
            Idle,
            ProcessingIntent,
            PlayingTransition,
            ExecutingTools,
            GeneratingResponse,
            Speaking,
            Interrupted,
            Backchanneling,
            Error,
        ];
        for state in all {
            assert!(!legal_targets(state).is_empty(), "{} has no edges", state);
            assert!(is_legal(state, Error) || state == Error);
        }
    }

    #[test]
    fn test_legal_path() {
        let sm = machine();
        sm.transition(ProcessingIntent, "asr").unwrap();
        sm.transition(GeneratingResponse, "llm").unwrap();
        let change = sm.transition(Speaking, "audio").unwrap();
        assert_eq!(change.from, GeneratingResponse);
        assert_eq!(sm.current(), Speaking);
        assert_eq!(sm.transition_log().len(), 3);
    }

    #[test]
    fn test_illegal_transition_does_not_mutate() {
        let sm = machine();
        let err = sm.transition(Speaking, "skip").unwrap_err();
        assert_eq!(err, IllegalTransition { from: Idle, to: Speaking });
        assert_eq!(sm.current(), Idle);
        assert_eq!(sm.rejected_count(), 1);
        assert!(sm.transition_log().is_empty());

        sm.transition(ProcessingIntent, "asr").unwrap();
        sm.transition(Interrupted, "barge-in").unwrap();
        assert!(sm.transition(Speaking, "resume").is_err());
        assert_eq!(sm.current(), Interrupted);
    }

    #[test]
    fn test_transition_from_guards_source() {
        let sm = machine();
        assert_eq!(sm.transition_from(&[Speaking], Idle, "done").unwrap(), None);
        sm.transition(ProcessingIntent, "asr").unwrap();
        assert!(sm.transition_from(&[ProcessingIntent], Speaking, "audio").unwrap().is_some());
        assert_eq!(sm.current(), Speaking);
    }

    #[test]
    fn test_atomically_allows_nested_transitions() {
        let sm = machine();
        sm.atomically(|sm| {
            sm.transition(ProcessingIntent, "a").unwrap();
            sm.transition(Idle, "b").unwrap();
        });
        assert_eq!(sm.current(), Idle);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let sm = machine();
        let mut rx = sm.subscribe();
        sm.transition(ProcessingIntent, "asr").unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ProcessingIntent);
    }
}
