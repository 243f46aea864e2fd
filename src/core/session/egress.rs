//! Priority queue → device. Frames of a stale generation are dropped, and
//! nothing is sent while the dialogue is IDLE or ERROR.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::SessionShared;
use super::protocol::{Outbound, ServerMessage, TtsState};
use crate::core::codec::FRAME_DURATION_MS;
use crate::core::observability::Phase;
use crate::core::tts::{QueuedAudio, SentenceType};

/// Releases frames at playback speed after an initial burst.
pub(crate) struct Pacer {
    enabled: bool,
    prebuffer: usize,
    frame: Duration,
    sent: usize,
    deadline: Instant,
}

impl Pacer {
    pub fn new(enabled: bool, prebuffer: usize, frame: Duration) -> Self {
        Self {
            enabled,
            prebuffer,
            frame,
            sent: 0,
            deadline: Instant::now(),
        }
    }

    /// Start a new burst.
    pub fn reset(&mut self) {
        self.sent = 0;
    }

    /// Wait until the next frame may go out. Returns false when the frame's
    /// generation was aborted or the session stopped while waiting.
    pub async fn wait(
        &mut self,
        generation: &mut watch::Receiver<u64>,
        frame_generation: u64,
        stop: &CancellationToken,
    ) -> bool {
        if !self.enabled {
            return true;
        }
        self.sent += 1;
        if self.sent <= self.prebuffer {
            self.deadline = Instant::now();
            return true;
        }
        let deadline = (self.deadline + self.frame).max(Instant::now());
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                self.deadline = deadline;
                true
            }
            _ = stop.cancelled() => false,
            _ = generation.wait_for(|current| *current > frame_generation) => false,
        }
    }
}

/// FIRST marker times of sentences still playing.
#[derive(Default)]
struct PlaybackClock {
    open: Vec<(u64, u64, Instant)>,
}

impl PlaybackClock {
    fn begin(&mut self, sentence_id: u64, generation: u64) {
        // sentences of older generations were aborted and will never see LAST
        self.open.retain(|(_, g, _)| *g >= generation);
        self.open.push((sentence_id, generation, Instant::now()));
    }

    fn end(&mut self, sentence_id: u64) -> Option<Duration> {
        let position = self.open.iter().position(|(id, _, _)| *id == sentence_id)?;
        let (_, _, started) = self.open.swap_remove(position);
        Some(started.elapsed())
    }
}

pub(crate) async fn egress_task(shared: Arc<SessionShared>) {
    let audio = &shared.core.config.audio;
    let mut pacer = Pacer::new(
        audio.pace_output,
        audio.prebuffer_frames,
        Duration::from_millis(FRAME_DURATION_MS as u64),
    );
    let mut generation = shared.tts.subscribe_generation();
    let mut playback = PlaybackClock::default();

    loop {
        let item = tokio::select! {
            _ = shared.stop.cancelled() => break,
            item = shared.queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        let current = *generation.borrow_and_update();
        if item.audio.generation < current {
            debug!(
                session_id = %shared.id,
                "Dropping sentence {} of stale generation {}",
                item.audio.sentence_id,
                item.audio.generation
            );
            continue;
        }
        if !deliver(&shared, &mut pacer, &mut playback, &mut generation, item).await {
            break;
        }
    }
    debug!(session_id = %shared.id, "Egress stopped");
}

/// Returns false once the connection is gone.
async fn deliver(
    shared: &SessionShared,
    pacer: &mut Pacer,
    playback: &mut PlaybackClock,
    generation: &mut watch::Receiver<u64>,
    item: QueuedAudio,
) -> bool {
    let audio = item.audio;
    match audio.sentence_type {
        SentenceType::First => {
            pacer.reset();
            playback.begin(audio.sentence_id, audio.generation);
            shared.send(ServerMessage::tts(shared.id, TtsState::Start, None)).await;
        }
        SentenceType::Middle => {
            if shared.state.current().blocks_audio() {
                debug!(session_id = %shared.id, "Dropping audio while {}", shared.state.current());
                return true;
            }
            if let Some(text) = audio.text {
                shared
                    .send(ServerMessage::tts(shared.id, TtsState::SentenceStart, Some(text)))
                    .await;
            }
            for frame in audio.frames {
                if !pacer.wait(generation, audio.generation, &shared.stop).await {
                    break;
                }
                if *generation.borrow() > audio.generation || shared.state.current().blocks_audio() {
                    break;
                }
                let started = shared.turn_started.lock().take();
                if let Some(started) = started {
                    shared.core.tracer.record_ttfr(shared.id, started.elapsed());
                }
                if shared.outbound.send(Outbound::Audio(frame.data)).await.is_err() {
                    return false;
                }
            }
        }
        SentenceType::Last => {
            if let Some(elapsed) = playback.end(audio.sentence_id) {
                shared.core.tracer.record(shared.id, Phase::AudioPlayback, elapsed);
            }
            shared.send(ServerMessage::tts(shared.id, TtsState::Stop, None)).await;
            shared.played.send_modify(|played| *played = (*played).max(audio.sentence_id));
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_playback_clock_spans_first_to_last() {
        let mut clock = PlaybackClock::default();
        clock.begin(1, 0);
        tokio::time::advance(Duration::from_millis(300)).await;
        clock.begin(2, 0);
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(clock.end(1), Some(Duration::from_millis(400)));
        assert_eq!(clock.end(1), None);

        // an aborted generation is forgotten once a newer sentence starts
        clock.begin(3, 1);
        assert_eq!(clock.end(2), None);
        assert_eq!(clock.end(3), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_bursts_then_paces() {
        let (_tx, mut rx) = watch::channel(0u64);
        let stop = CancellationToken::new();
        let mut pacer = Pacer::new(true, 2, Duration::from_millis(60));

        let start = Instant::now();
        assert!(pacer.wait(&mut rx, 0, &stop).await);
        assert!(pacer.wait(&mut rx, 0, &stop).await);
        assert_eq!(start.elapsed(), Duration::ZERO);

        assert!(pacer.wait(&mut rx, 0, &stop).await);
        assert!(pacer.wait(&mut rx, 0, &stop).await);
        assert_eq!(start.elapsed(), Duration::from_millis(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_stops_on_abort() {
        let (tx, mut rx) = watch::channel(0u64);
        let stop = CancellationToken::new();
        let mut pacer = Pacer::new(true, 0, Duration::from_millis(60));

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send_replace(1);
        });
        assert!(!pacer.wait(&mut rx, 0, &stop).await);
    }

    #[tokio::test]
    async fn test_pacer_disabled_never_waits() {
        let (_tx, mut rx) = watch::channel(0u64);
        let stop = CancellationToken::new();
        stop.cancel();
        let mut pacer = Pacer::new(false, 0, Duration::from_millis(60));
        assert!(pacer.wait(&mut rx, 0, &stop).await);
    }
}
