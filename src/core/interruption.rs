//! # Smart Interruption Controller
//!
//! Decides whether user speech arriving while the assistant holds the floor
//! should cut it off. Transcripts are classified against three keyword
//! tables in order: explicit, implicit, backchannel. Anything else spoken
//! over the assistant interrupts as well.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::dialogue::DialogueState;
use crate::core::ingress::VadEventKind;

const EXPLICIT_KEYWORDS: &[&str] = &[
    "停", "停止", "停下", "等等", "等一下", "别说了", "不要说了", "闭嘴", "取消", "暂停", "stop",
    "wait", "cancel", "hold on", "shut up", "pause",
];

const IMPLICIT_KEYWORDS: &[&str] = &[
    "我想问", "我想知道", "帮我", "请问", "我要", "不对", "换一个", "i want to ask", "help me",
    "can you", "actually", "what about",
];

const BACKCHANNEL_KEYWORDS: &[&str] = &[
    "嗯", "嗯嗯", "嗯哼", "哦", "噢", "啊", "好", "好的", "对", "对对", "是的", "继续", "uh-huh",
    "uh huh", "mm-hm", "mhm", "ok", "okay", "yeah", "yes", "right", "continue", "go on",
];

const RECENT_EVENTS: usize = 32;

/// Characters allowed after an explicit keyword ("停一下吧")
const EXPLICIT_TAIL_CHARS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenMode {
    #[default]
    Auto,
    Manual,
    Realtime,
}

impl ListenMode {
    pub fn from_str_lossy(mode: &str) -> Self {
        match mode {
            "manual" => Self::Manual,
            "realtime" => Self::Realtime,
            _ => Self::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptionKind {
    Explicit,
    Implicit,
    Backchannel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptDecision {
    Continue,
    /// Wait for the transcript before deciding
    Defer,
    Interrupt {
        kind: InterruptionKind,
        /// Text to process as the next user turn
        requeue_text: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptionConfig {
    pub smart: bool,
    pub skip_backchannel: bool,
    pub debounce_ms: u64,
    /// Play a short acknowledgement after interrupting
    pub acknowledge: bool,
}

impl Default for InterruptionConfig {
    fn default() -> Self {
        Self {
            smart: true,
            skip_backchannel: true,
            debounce_ms: 200,
            acknowledge: true,
        }
    }
}

/// What the controller is asked to judge.
#[derive(Debug, Clone, Copy)]
pub enum InterruptionInput<'a> {
    Vad(VadEventKind),
    Transcript(&'a str),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterruptionEvent {
    pub kind: InterruptionKind,
    pub trigger_text: String,
    pub timestamp_ms: u64,
    pub response_latency_ms: Option<u64>,
    pub handled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InterruptionStats {
    pub total_interruptions: u64,
    pub explicit: u64,
    pub implicit: u64,
    pub backchannel_interrupts: u64,
    pub skipped_backchannels: u64,
    pub deferred: u64,
    pub debounced: u64,
    pub avg_response_latency_ms: f64,
}

struct Inner {
    last_interrupt: Option<Instant>,
    stats: InterruptionStats,
    latency_samples: u64,
    recent: VecDeque<InterruptionEvent>,
}

pub struct InterruptionController {
    config: InterruptionConfig,
    inner: Mutex<Inner>,
}

/// Lowercase and strip whitespace and punctuation.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace() && !c.is_ascii_punctuation() && !is_cjk_punctuation(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

fn is_cjk_punctuation(c: char) -> bool {
    matches!(
        c,
        '，' | '。' | '！' | '？' | '、' | '；' | '：' | '…' | '～' | '“' | '”' | '‘' | '’' | '（' | '）'
    )
}

fn matches_any(normalized: &str, table: &[&str], exact: bool) -> bool {
    table.iter().any(|keyword| {
        let keyword = normalize(keyword);
        if exact {
            normalized == keyword
        } else {
            normalized.contains(&keyword)
        }
    })
}

/// Classify a transcript against the keyword tables.
pub fn classify(text: &str) -> Option<InterruptionKind> {
    let normalized = normalize(text);
    if normalized.is_empty() {
        return None;
    }
    // Explicit keywords must lead a short utterance; "停车场在哪里" is a question
    let length = normalized.chars().count();
    if EXPLICIT_KEYWORDS.iter().any(|k| {
        let k = normalize(k);
        normalized.starts_with(&k) && length <= k.chars().count() + EXPLICIT_TAIL_CHARS
    }) {
        return Some(InterruptionKind::Explicit);
    }
    if matches_any(&normalized, IMPLICIT_KEYWORDS, false) {
        return Some(InterruptionKind::Implicit);
    }
    if matches_any(&normalized, BACKCHANNEL_KEYWORDS, true) {
        return Some(InterruptionKind::Backchannel);
    }
    None
}

impl InterruptionController {
    pub fn new(config: InterruptionConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                last_interrupt: None,
                stats: InterruptionStats::default(),
                latency_samples: 0,
                recent: VecDeque::with_capacity(RECENT_EVENTS),
            }),
        }
    }

    pub fn config(&self) -> &InterruptionConfig {
        &self.config
    }

    /// Judge `input` given the current dialogue state and listen mode.
    pub fn decide(
        &self,
        state: DialogueState,
        mode: ListenMode,
        input: InterruptionInput<'_>,
        smart_enabled: bool,
    ) -> InterruptDecision {
        if !state.is_active_output() || mode == ListenMode::Manual {
            return InterruptDecision::Continue;
        }
        let smart = self.config.smart && smart_enabled;

        let decision = match input {
            InterruptionInput::Vad(VadEventKind::VoiceStart) => {
                if smart {
                    self.inner.lock().stats.deferred += 1;
                    return InterruptDecision::Defer;
                }
                InterruptDecision::Interrupt {
                    kind: InterruptionKind::Explicit,
                    requeue_text: None,
                }
            }
            InterruptionInput::Vad(_) => return InterruptDecision::Continue,
            InterruptionInput::Transcript(text) => match self.classify_transcript(text, smart) {
                Some(decision) => decision,
                None => return InterruptDecision::Continue,
            },
        };

        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(last) = inner.last_interrupt
            && now.duration_since(last) < Duration::from_millis(self.config.debounce_ms)
        {
            inner.stats.debounced += 1;
            debug!("Interruption debounced");
            return InterruptDecision::Continue;
        }
        inner.last_interrupt = Some(now);
        if let InterruptDecision::Interrupt { kind, .. } = &decision {
            inner.stats.total_interruptions += 1;
            match kind {
                InterruptionKind::Explicit => inner.stats.explicit += 1,
                InterruptionKind::Implicit => inner.stats.implicit += 1,
                InterruptionKind::Backchannel => inner.stats.backchannel_interrupts += 1,
            }
        }
        decision
    }

    fn classify_transcript(&self, text: &str, smart: bool) -> Option<InterruptDecision> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        if !smart {
            return Some(InterruptDecision::Interrupt {
                kind: InterruptionKind::Implicit,
                requeue_text: Some(trimmed.to_string()),
            });
        }
        let decision = match classify(trimmed) {
            Some(InterruptionKind::Explicit) => InterruptDecision::Interrupt {
                kind: InterruptionKind::Explicit,
                requeue_text: None,
            },
            Some(InterruptionKind::Backchannel) if self.config.skip_backchannel => {
                self.inner.lock().stats.skipped_backchannels += 1;
                info!("Skipping backchannel '{}'", trimmed);
                return None;
            }
            Some(InterruptionKind::Backchannel) => InterruptDecision::Interrupt {
                kind: InterruptionKind::Backchannel,
                requeue_text: None,
            },
            Some(InterruptionKind::Implicit) | None => InterruptDecision::Interrupt {
                kind: InterruptionKind::Implicit,
                requeue_text: Some(trimmed.to_string()),
            },
        };
        Some(decision)
    }

    /// Short utterance played right after an interruption.
    pub fn acknowledgement(&self, kind: InterruptionKind) -> Option<&'static str> {
        if !self.config.acknowledge {
            return None;
        }
        match kind {
            InterruptionKind::Explicit => Some("好的，您说"),
            InterruptionKind::Implicit => Some("我在听"),
            InterruptionKind::Backchannel => None,
        }
    }

    /// Record a handled interruption and its latency.
    pub fn record(&self, event: InterruptionEvent) {
        let mut inner = self.inner.lock();
        if let Some(latency) = event.response_latency_ms {
            let n = inner.latency_samples as f64;
            inner.stats.avg_response_latency_ms =
                (inner.stats.avg_response_latency_ms * n + latency as f64) / (n + 1.0);
            inner.latency_samples += 1;
        }
        if inner.recent.len() == RECENT_EVENTS {
            inner.recent.pop_front();
        }
        inner.recent.push_back(event);
    }

    pub fn stats(&self) -> InterruptionStats {
        self.inner.lock().stats.clone()
    }

    pub fn recent_events(&self) -> Vec<InterruptionEvent> {
        self.inner.lock().recent.iter().cloned().collect()
    }
}
