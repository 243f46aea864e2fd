use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::base::{AsrError, AsrMode, AsrResult, AsrStream, Recognition, SpeechRecognizer, TranscriptEvent};
use crate::core::ingress::SpeechSegment;
use crate::core::observability::{DegradationManager, RequestOutcome};
use crate::core::types::{SessionClock, SessionId};

/// Extra time granted on top of min-silence before a segment is abandoned
const SEGMENT_TIMEOUT_SLACK_MS: u64 = 5000;

/// Per-session front end of a recognizer.
pub struct AsrSession {
    session_id: SessionId,
    clock: SessionClock,
    recognizer: Arc<dyn SpeechRecognizer>,
    sample_rate: u32,
    timeout: Duration,
    stream: Option<Box<dyn AsrStream>>,
    partial_tx: Option<mpsc::Sender<TranscriptEvent>>,
    degradation: Option<Arc<DegradationManager>>,
}

impl AsrSession {
    pub fn new(
        session_id: SessionId,
        clock: SessionClock,
        recognizer: Arc<dyn SpeechRecognizer>,
        sample_rate: u32,
        min_silence_ms: u64,
    ) -> Self {
        Self {
            session_id,
            clock,
            recognizer,
            sample_rate,
            timeout: Duration::from_millis(min_silence_ms + SEGMENT_TIMEOUT_SLACK_MS),
            stream: None,
            partial_tx: None,
            degradation: None,
        }
    }

    /// Forward partial transcripts of streaming recognizers to `tx`.
    pub fn with_partials(mut self, tx: mpsc::Sender<TranscriptEvent>) -> Self {
        self.partial_tx = Some(tx);
        self
    }

    /// Report every recognition outcome to the degradation manager.
    pub fn with_degradation(mut self, degradation: Arc<DegradationManager>) -> Self {
        self.degradation = Some(degradation);
        self
    }

    pub fn mode(&self) -> AsrMode {
        self.recognizer.mode()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open the remote stream when the user starts talking.
    pub async fn begin_utterance(&mut self) {
        if self.recognizer.mode() != AsrMode::RemoteStreaming {
            return;
        }
        match self.open_stream().await {
            Ok(stream) => self.stream = Some(stream),
            Err(e) => warn!(session_id = %self.session_id, "Failed to open ASR stream: {}", e),
        }
    }

    /// Feed PCM of the utterance in progress.
    pub async fn push_speech(&mut self, pcm: &[i16]) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };
        if let Err(e) = stream.push(pcm).await {
            warn!(session_id = %self.session_id, "ASR stream push failed: {}", e);
            self.stream = None;
        }
    }

    /// Produce the final transcript for a finished segment.
    ///
    /// Failures never propagate: they become a final event with empty text
    /// and `error` set.
    pub async fn transcribe(&mut self, segment: SpeechSegment) -> Vec<TranscriptEvent> {
        let started = self.clock.now_ms();
        let result = tokio::time::timeout(self.timeout, self.recognize_segment(segment)).await;
        let now = self.clock.now_ms();
        let latency = Duration::from_millis(now.saturating_sub(started));

        let (event, outcome) = match result {
            Ok(Ok(recognition)) => {
                info!(
                    session_id = %self.session_id,
                    "ASR result in {}ms: {}",
                    now.saturating_sub(started),
                    recognition.text
                );
                (
                    TranscriptEvent::final_text(recognition.text.trim(), recognition.confidence, now),
                    RequestOutcome::success(latency),
                )
            }
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, "ASR failed: {}", e);
                let outcome = match e {
                    AsrError::Timeout(_) => RequestOutcome::timeout(latency),
                    _ => RequestOutcome::failure(latency),
                };
                (TranscriptEvent::failed(e.to_string(), now), outcome)
            }
            Err(_) => {
                self.stream = None;
                let e = AsrError::Timeout(self.timeout.as_millis() as u64);
                warn!(session_id = %self.session_id, "ASR failed: {}", e);
                (TranscriptEvent::failed(e.to_string(), now), RequestOutcome::timeout(latency))
            }
        };
        if let Some(degradation) = self.degradation.as_ref() {
            degradation.observe(outcome);
        }
        vec![event]
    }

    async fn recognize_segment(&mut self, segment: SpeechSegment) -> AsrResult<Recognition> {
        match self.recognizer.mode() {
            AsrMode::Local => {
                let samples = segment.samples();
                debug!(
                    session_id = %self.session_id,
                    "Recognizing {}ms segment locally",
                    segment.duration_ms()
                );
                self.recognizer.recognize(&samples, self.sample_rate).await
            }
            AsrMode::RemoteStreaming => {
                let stream = match self.stream.take() {
                    Some(stream) => stream,
                    None => {
                        // Segment ended without a live stream (forced end or reopen failure)
                        let mut stream = self.open_stream().await?;
                        stream.push(&segment.samples()).await?;
                        stream
                    }
                };
                stream.finish().await
            }
        }
    }

    async fn open_stream(&self) -> AsrResult<Box<dyn AsrStream>> {
        let (tx, mut rx) = mpsc::channel::<Recognition>(16);
        let stream = self.recognizer.open_stream(self.sample_rate, tx).await?;

        let forward = self.partial_tx.clone();
        let clock = self.clock;
        tokio::spawn(async move {
            while let Some(partial) = rx.recv().await {
                if let Some(forward) = forward.as_ref() {
                    let _ = forward
                        .send(TranscriptEvent::partial(partial.text, clock.now_ms()))
                        .await;
                }
            }
        });
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct FixedRecognizer {
        text: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl SpeechRecognizer for FixedRecognizer {
        fn mode(&self) -> AsrMode {
            AsrMode::Local
        }

        async fn recognize(&self, _pcm: &[i16], _rate: u32) -> AsrResult<Recognition> {
            tokio::time::sleep(self.delay).await;
            Ok(Recognition::new(self.text))
        }

        fn name(&self) -> &'static str {
            "fixed"
        }
    }

    struct CollectingStream {
        pushed: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl AsrStream for CollectingStream {
        async fn push(&mut self, pcm: &[i16]) -> AsrResult<()> {
            *self.pushed.lock() += pcm.len();
            Ok(())
        }

        async fn finish(self: Box<Self>) -> AsrResult<Recognition> {
            Ok(Recognition::new(format!("{} samples", *self.pushed.lock())))
        }
    }

    struct StreamingRecognizer {
        pushed: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl SpeechRecognizer for StreamingRecognizer {
        fn mode(&self) -> AsrMode {
            AsrMode::RemoteStreaming
        }

        async fn recognize(&self, _pcm: &[i16], _rate: u32) -> AsrResult<Recognition> {
            Err(AsrError::Unsupported("stream only".into()))
        }

        async fn open_stream(
            &self,
            _rate: u32,
            partials: mpsc::Sender<Recognition>,
        ) -> AsrResult<Box<dyn AsrStream>> {
            let _ = partials.send(Recognition::new("partial")).await;
            Ok(Box::new(CollectingStream {
                pushed: self.pushed.clone(),
            }))
        }

        fn name(&self) -> &'static str {
            "streaming"
        }
    }

    fn segment() -> SpeechSegment {
        SpeechSegment {
            frames: vec![vec![0; 160], vec![0; 160]],
            sample_rate: 16000,
            started_at_ms: 0,
            ended_at_ms: 20,
        }
    }

    #[tokio::test]
    async fn test_local_transcribe() {
        let recognizer = Arc::new(FixedRecognizer {
            text: " 你好 ",
            delay: Duration::ZERO,
        });
        let mut asr = AsrSession::new(SessionId::new(), SessionClock::new(), recognizer, 16000, 1000);
        let events = asr.transcribe(segment()).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_final());
        assert_eq!(events[0].text, "你好");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_becomes_error_transcript() {
        let recognizer = Arc::new(FixedRecognizer {
            text: "late",
            delay: Duration::from_secs(60),
        });
        let mut asr = AsrSession::new(SessionId::new(), SessionClock::new(), recognizer, 16000, 1000);
        assert_eq!(asr.timeout(), Duration::from_millis(6000));
        let events = asr.transcribe(segment()).await;
        assert!(events[0].is_error());
        assert!(events[0].text.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_reach_degradation() {
        let flags = Arc::new(crate::core::observability::FeatureFlags::all_enabled());
        let degradation = Arc::new(DegradationManager::new(Default::default(), flags));
        let recognizer = Arc::new(FixedRecognizer {
            text: "late",
            delay: Duration::from_secs(60),
        });
        let mut asr = AsrSession::new(SessionId::new(), SessionClock::new(), recognizer, 16000, 1000)
            .with_degradation(degradation.clone());
        asr.transcribe(segment()).await;

        let metrics = degradation.metrics();
        assert_eq!(metrics.samples, 1);
        assert_eq!(metrics.timeout_rate, 1.0);
    }

    #[tokio::test]
    async fn test_streaming_session_pushes_speech() {
        let pushed = Arc::new(Mutex::new(0));
        let recognizer = Arc::new(StreamingRecognizer {
            pushed: pushed.clone(),
        });
        let (tx, mut rx) = mpsc::channel(4);
        let mut asr = AsrSession::new(SessionId::new(), SessionClock::new(), recognizer, 16000, 1000)
            .with_partials(tx);

        asr.begin_utterance().await;
        asr.push_speech(&[0; 320]).await;
        asr.push_speech(&[0; 320]).await;
        let events = asr.transcribe(segment()).await;
        assert_eq!(events[0].text, "640 samples");

        let partial = rx.recv().await.unwrap();
        assert_eq!(partial.text, "partial");
    }

    #[tokio::test]
    async fn test_streaming_transcription_on_spawned_task() {
        let pushed = Arc::new(Mutex::new(0));
        let recognizer = Arc::new(StreamingRecognizer {
            pushed: pushed.clone(),
        });
        let mut asr = AsrSession::new(SessionId::new(), SessionClock::new(), recognizer, 16000, 1000);

        let events = tokio::spawn(async move {
            asr.begin_utterance().await;
            asr.push_speech(&[0; 160]).await;
            asr.transcribe(segment()).await
        })
        .await
        .unwrap();
        assert_eq!(events[0].text, "160 samples");
    }
}
