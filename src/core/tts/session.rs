//! Per-session TTS pipeline.
//!
//! A single worker task consumes [`TtsMessage`]s in order, segments text at
//! sentence punctuation, synthesizes each segment with the provider, encodes
//! it to the device codec on the worker pool and pushes [`TtsAudio`] into the
//! priority queue. Every message carries the abort generation it was
//! produced under; anything older than the current generation is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::base::{DuplexControl, DuplexEvent, DuplexParams, TextToSpeech, TtsError, TtsMode, TtsResult};
use super::messages::{AudioPriority, SentenceType, TtsAudio, TtsMessage, TtsPayload};
use super::priority_queue::AudioPriorityQueue;
use crate::core::codec::{AudioFrame, CodecAdapter, CodecError};
use crate::core::observability::{DegradationManager, Phase, PerformanceTracer, RequestOutcome};
use crate::core::types::SessionId;
use crate::core::worker_pool::WorkerPool;

const CHANNEL_CAPACITY: usize = 16;

/// Sentence terminators.
const TERMINAL_PUNCTUATION: &[char] = &['。', '？', '！', '；', '：', '.', '?', '!', ';', ':', '\n'];

/// Used for the first segment of a reply so audio starts sooner.
const FIRST_SEGMENT_PUNCTUATION: &[char] = &[
    '。', '？', '！', '；', '：', '.', '?', '!', ';', ':', '\n', '，', ',', '~', '～', '、',
];

#[derive(Debug, Clone)]
pub struct TtsSessionConfig {
    pub voice: Option<String>,
    /// Attempts per segment for non-stream providers
    pub max_attempts: u32,
    /// Outer bound on one segment's synthesis, retries included
    pub timeout: Duration,
}

impl Default for TtsSessionConfig {
    fn default() -> Self {
        Self {
            voice: None,
            max_attempts: 5,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct Counters {
    segments: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    dropped_messages: AtomicU64,
}

/// Where the worker reports synthesis timings and outcomes.
#[derive(Clone, Default)]
pub struct TtsObservers {
    pub tracer: Option<Arc<PerformanceTracer>>,
    pub degradation: Option<Arc<DegradationManager>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TtsStats {
    pub segments: u64,
    pub failures: u64,
    pub retries: u64,
    pub dropped_messages: u64,
}

/// Handle to the session's TTS worker.
pub struct TtsSession {
    session_id: SessionId,
    mode: TtsMode,
    tx: mpsc::Sender<TtsMessage>,
    generation: watch::Sender<u64>,
    sentence_ids: AtomicU64,
    queue: Arc<AudioPriorityQueue>,
    stop: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl TtsSession {
    pub fn spawn(
        session_id: SessionId,
        provider: Arc<dyn TextToSpeech>,
        codec: CodecAdapter,
        pool: WorkerPool,
        queue: Arc<AudioPriorityQueue>,
        config: TtsSessionConfig,
        observers: TtsObservers,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (generation, generation_rx) = watch::channel(0u64);
        let stop = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let mode = provider.mode();

        let worker = TtsWorker {
            session_id,
            provider,
            codec: Arc::new(Mutex::new(codec)),
            pool,
            queue: queue.clone(),
            config,
            generation: generation_rx.clone(),
            counters: counters.clone(),
            observers,
            turn: None,
            duplex: None,
        };
        let handle = tokio::spawn(worker.run(rx, generation_rx, stop.clone()));

        Self {
            session_id,
            mode,
            tx,
            generation,
            sentence_ids: AtomicU64::new(1),
            queue,
            stop,
            worker: Mutex::new(Some(handle)),
            counters,
        }
    }

    pub fn mode(&self) -> TtsMode {
        self.mode
    }

    pub fn queue(&self) -> &Arc<AudioPriorityQueue> {
        &self.queue
    }

    /// Current abort generation.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    pub fn subscribe_generation(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn next_sentence_id(&self) -> u64 {
        self.sentence_ids.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn send(&self, message: TtsMessage) -> TtsResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TtsError::ProviderError("TTS worker stopped".to_string()))
    }

    /// Start a sentence; the FIRST marker is sent immediately.
    pub async fn begin(&self, priority: AudioPriority) -> TtsResult<SentenceWriter> {
        let writer = SentenceWriter {
            tx: self.tx.clone(),
            sentence_id: self.next_sentence_id(),
            priority,
            generation: self.generation(),
        };
        writer.send(TtsMessage::first(writer.sentence_id, priority, writer.generation)).await?;
        Ok(writer)
    }

    /// Speak one complete utterance as its own sentence.
    pub async fn speak(&self, text: &str, priority: AudioPriority) -> TtsResult<u64> {
        let writer = self.begin(priority).await?;
        writer.text(text).await?;
        writer.finish().await
    }

    /// Invalidate everything in flight; the worker stops duplex channels and
    /// drops partial sentences. Returns the new generation.
    pub fn abort(&self) -> u64 {
        self.generation.send_modify(|g| *g += 1);
        let generation = self.generation();
        debug!(session_id = %self.session_id, "TTS aborted, generation {}", generation);
        generation
    }

    pub fn stats(&self) -> TtsStats {
        TtsStats {
            segments: self.counters.segments.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            dropped_messages: self.counters.dropped_messages.load(Ordering::Relaxed),
        }
    }

    /// Stop the worker and wait for it, bounded by `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop.cancel();
        let handle = self.worker.lock().take();
        if let Some(mut handle) = handle
            && tokio::time::timeout(grace, &mut handle).await.is_err()
        {
            warn!(session_id = %self.session_id, "TTS worker did not stop in time");
            handle.abort();
        }
    }
}

impl Drop for TtsSession {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Writes the messages of one sentence.
#[derive(Clone)]
pub struct SentenceWriter {
    tx: mpsc::Sender<TtsMessage>,
    sentence_id: u64,
    priority: AudioPriority,
    generation: u64,
}

impl SentenceWriter {
    pub fn sentence_id(&self) -> u64 {
        self.sentence_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    async fn send(&self, message: TtsMessage) -> TtsResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TtsError::ProviderError("TTS worker stopped".to_string()))
    }

    pub async fn text(&self, text: &str) -> TtsResult<()> {
        if text.is_empty() {
            return Ok(());
        }
        self.send(TtsMessage::text(self.sentence_id, text, self.priority, self.generation))
            .await
    }

    pub async fn file(&self, pcm: Bytes, sample_rate: u32) -> TtsResult<()> {
        self.send(TtsMessage::file(self.sentence_id, pcm, sample_rate, self.priority, self.generation))
            .await
    }

    pub async fn finish(self) -> TtsResult<u64> {
        self.send(TtsMessage::last(self.sentence_id, self.priority, self.generation))
            .await?;
        Ok(self.sentence_id)
    }
}

/// In-progress sentence.
struct Turn {
    sentence_id: u64,
    priority: AudioPriority,
    generation: u64,
    buffer: String,
    processed_chars: usize,
    first_segment: bool,
    pending_files: Vec<TtsAudio>,
    forwarder: Option<JoinHandle<Option<mpsc::Receiver<DuplexEvent>>>>,
}

impl Turn {
    /// Next segment ending in punctuation, advancing the cursor past it.
    fn next_segment(&mut self) -> Option<String> {
        let marks = if self.first_segment {
            FIRST_SEGMENT_PUNCTUATION
        } else {
            TERMINAL_PUNCTUATION
        };
        let pending: Vec<char> = self.buffer.chars().skip(self.processed_chars).collect();
        let end = pending.iter().position(|c| marks.contains(c))?;
        self.processed_chars += end + 1;
        self.first_segment = false;
        Some(pending[..=end].iter().collect())
    }

    fn remainder(&mut self) -> String {
        let rest: String = self.buffer.chars().skip(self.processed_chars).collect();
        self.processed_chars = self.buffer.chars().count();
        rest
    }
}

struct Duplex {
    control: Box<dyn DuplexControl>,
    events: Option<mpsc::Receiver<DuplexEvent>>,
}

struct TtsWorker {
    session_id: SessionId,
    provider: Arc<dyn TextToSpeech>,
    codec: Arc<Mutex<CodecAdapter>>,
    pool: WorkerPool,
    queue: Arc<AudioPriorityQueue>,
    config: TtsSessionConfig,
    generation: watch::Receiver<u64>,
    counters: Arc<Counters>,
    observers: TtsObservers,
    turn: Option<Turn>,
    duplex: Option<Duplex>,
}

/// True when a segment holds something worth speaking.
fn is_speakable(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}

async fn encode_pcm(
    codec: Arc<Mutex<CodecAdapter>>,
    pool: &WorkerPool,
    pcm: Bytes,
    sample_rate: u32,
    end_of_stream: bool,
) -> TtsResult<Vec<AudioFrame>> {
    pool.run(move || {
        let mut codec = codec.lock();
        codec.set_input_rate(sample_rate)?;
        let mut frames = Vec::new();
        codec.encode_pcm_stream(&pcm, end_of_stream, |frame| frames.push(frame))?;
        Ok::<_, CodecError>(frames)
    })
    .await
    .map_err(|e| TtsError::Codec(e.to_string()))?
    .map_err(|e| TtsError::Codec(e.to_string()))
}

/// Resolves once the generation moves past `generation`.
async fn aborted(mut rx: watch::Receiver<u64>, generation: u64) {
    if rx.wait_for(|current| *current > generation).await.is_err() {
        std::future::pending::<()>().await;
    }
}

impl TtsWorker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<TtsMessage>,
        mut generation: watch::Receiver<u64>,
        stop: CancellationToken,
    ) {
        info!(session_id = %self.session_id, "TTS worker started ({})", self.provider.name());
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                changed = generation.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.on_abort().await;
                }
                message = rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
            }
        }
        self.on_abort().await;
        debug!(session_id = %self.session_id, "TTS worker stopped");
    }

    fn current_generation(&self) -> u64 {
        *self.generation.borrow()
    }

    async fn handle(&mut self, message: TtsMessage) {
        if message.generation < self.current_generation() {
            self.counters.dropped_messages.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match message.sentence_type {
            SentenceType::First => self.on_first(&message).await,
            SentenceType::Middle => match message.payload {
                TtsPayload::Text(text) => self.on_text(message.sentence_id, &text).await,
                TtsPayload::Audio { pcm, sample_rate } => {
                    self.on_file(message.sentence_id, pcm, sample_rate).await
                }
                TtsPayload::None => {}
            },
            SentenceType::Last => self.on_last(message.sentence_id).await,
        }
    }

    async fn on_abort(&mut self) {
        if let Some(turn) = self.turn.take()
            && let Some(forwarder) = turn.forwarder
        {
            forwarder.abort();
        }
        if let Some(mut duplex) = self.duplex.take()
            && let Err(e) = duplex.control.stop().await
        {
            debug!(session_id = %self.session_id, "Duplex stop failed: {}", e);
        }
        self.codec.lock().reset_encoder();
    }

    async fn on_first(&mut self, message: &TtsMessage) {
        if let Some(turn) = self.turn.as_ref() {
            warn!(
                session_id = %self.session_id,
                "Sentence {} started before {} finished",
                message.sentence_id,
                turn.sentence_id
            );
            let previous = turn.sentence_id;
            self.on_last(previous).await;
        }
        self.codec.lock().reset_encoder();

        let mut turn = Turn {
            sentence_id: message.sentence_id,
            priority: message.priority,
            generation: message.generation,
            buffer: String::new(),
            processed_chars: 0,
            first_segment: true,
            pending_files: Vec::new(),
            forwarder: None,
        };

        if self.provider.mode() == TtsMode::DualStream {
            turn.forwarder = self.start_forwarder(&turn).await;
        }

        self.push(TtsAudio::marker(
            SentenceType::First,
            turn.sentence_id,
            turn.priority,
            turn.generation,
        ))
        .await;
        self.turn = Some(turn);
    }

    async fn on_text(&mut self, sentence_id: u64, text: &str) {
        let Some(turn) = self.turn.as_mut().filter(|t| t.sentence_id == sentence_id) else {
            debug!(session_id = %self.session_id, "Text for inactive sentence {} dropped", sentence_id);
            return;
        };
        turn.buffer.push_str(text);
        let mut segments = Vec::new();
        while let Some(segment) = turn.next_segment() {
            segments.push(segment);
        }
        let (priority, generation) = (turn.priority, turn.generation);
        for segment in segments {
            self.synthesize_segment(sentence_id, priority, generation, segment).await;
        }
    }

    async fn on_file(&mut self, sentence_id: u64, pcm: Bytes, sample_rate: u32) {
        let Some(turn) = self.turn.as_mut().filter(|t| t.sentence_id == sentence_id) else {
            return;
        };
        let pending = turn.remainder();
        let (priority, generation) = (turn.priority, turn.generation);
        self.synthesize_segment(sentence_id, priority, generation, pending).await;

        match encode_pcm(self.codec.clone(), &self.pool, pcm, sample_rate, true).await {
            Ok(frames) => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.pending_files
                        .push(TtsAudio::middle(sentence_id, frames, None, priority, generation));
                }
            }
            Err(e) => warn!(session_id = %self.session_id, "Failed to encode file audio: {}", e),
        }
    }

    async fn on_last(&mut self, sentence_id: u64) {
        let Some(mut turn) = self.turn.take().filter(|t| t.sentence_id == sentence_id) else {
            debug!(session_id = %self.session_id, "LAST for inactive sentence {} ignored", sentence_id);
            return;
        };
        let rest = turn.remainder();
        self.synthesize_segment(turn.sentence_id, turn.priority, turn.generation, rest)
            .await;

        if let Some(forwarder) = turn.forwarder.take() {
            self.finish_duplex(forwarder, turn.generation).await;
        }

        if turn.generation < self.current_generation() {
            return;
        }
        for file in turn.pending_files.drain(..) {
            self.push(file).await;
        }
        self.push(TtsAudio::marker(
            SentenceType::Last,
            turn.sentence_id,
            turn.priority,
            turn.generation,
        ))
        .await;
    }

    async fn push(&self, audio: TtsAudio) {
        if audio.generation < self.current_generation() {
            return;
        }
        if let Err(e) = self.queue.put(audio).await {
            debug!(session_id = %self.session_id, "Audio not queued: {}", e);
        }
    }

    async fn synthesize_segment(&mut self, sentence_id: u64, priority: AudioPriority, generation: u64, text: String) {
        let text = text.trim();
        if !is_speakable(text) {
            return;
        }
        self.counters.segments.fetch_add(1, Ordering::Relaxed);

        let started = Instant::now();
        let result = match self.provider.mode() {
            TtsMode::NonStream => self.synthesize_whole(sentence_id, priority, generation, text).await,
            TtsMode::SingleStream => self.synthesize_streaming(sentence_id, priority, generation, text).await,
            TtsMode::DualStream => self.send_duplex_text(text).await,
        };

        let latency = started.elapsed();
        let outcome = match result {
            // duplex audio arrives asynchronously, so only whole-segment modes are timed
            Ok(()) if self.provider.mode() == TtsMode::DualStream => None,
            Ok(()) => {
                if let Some(tracer) = self.observers.tracer.as_ref() {
                    tracer.record(self.session_id, Phase::TtsSynthesis, latency);
                }
                Some(RequestOutcome::success(latency))
            }
            Err(TtsError::Aborted) => {
                debug!(session_id = %self.session_id, "Segment synthesis aborted");
                None
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                error!(session_id = %self.session_id, "TTS failed for \"{}\": {}", text, e);
                Some(match e {
                    TtsError::Timeout(_) => RequestOutcome::timeout(latency),
                    _ => RequestOutcome::failure(latency),
                })
            }
        };
        if let (Some(outcome), Some(degradation)) = (outcome, self.observers.degradation.as_ref()) {
            degradation.observe(outcome);
        }
    }

    async fn synthesize_whole(
        &self,
        sentence_id: u64,
        priority: AudioPriority,
        generation: u64,
        text: &str,
    ) -> TtsResult<()> {
        let attempts = async {
            let mut last_error = TtsError::AudioGenerationFailed("no attempt made".to_string());
            for attempt in 1..=self.config.max_attempts.max(1) {
                match self.provider.synthesize(text).await {
                    Ok(pcm) => return Ok(pcm),
                    Err(e) => {
                        warn!(
                            session_id = %self.session_id,
                            "TTS attempt {}/{} failed: {}",
                            attempt,
                            self.config.max_attempts,
                            e
                        );
                        if attempt < self.config.max_attempts {
                            self.counters.retries.fetch_add(1, Ordering::Relaxed);
                        }
                        last_error = e;
                    }
                }
            }
            Err(last_error)
        };

        let pcm = tokio::select! {
            _ = aborted(self.generation.clone(), generation) => return Err(TtsError::Aborted),
            result = tokio::time::timeout(self.config.timeout, attempts) => match result {
                Ok(pcm) => pcm?,
                Err(_) => return Err(TtsError::Timeout(format!("synthesis exceeded {:?}", self.config.timeout))),
            },
        };

        let frames = encode_pcm(self.codec.clone(), &self.pool, pcm, self.provider.sample_rate(), true).await?;
        self.push(TtsAudio::middle(
            sentence_id,
            frames,
            Some(text.to_string()),
            priority,
            generation,
        ))
        .await;
        Ok(())
    }

    async fn synthesize_streaming(
        &self,
        sentence_id: u64,
        priority: AudioPriority,
        generation: u64,
        text: &str,
    ) -> TtsResult<()> {
        let rate = self.provider.sample_rate();
        let work = async {
            let mut stream = self.provider.synthesize_stream(text).await?;
            let mut label = Some(text.to_string());
            while let Some(chunk) = stream.next().await {
                let frames = encode_pcm(self.codec.clone(), &self.pool, chunk?, rate, false).await?;
                if !frames.is_empty() {
                    self.push(TtsAudio::middle(sentence_id, frames, label.take(), priority, generation))
                        .await;
                }
            }
            let tail = encode_pcm(self.codec.clone(), &self.pool, Bytes::new(), rate, true).await?;
            if !tail.is_empty() {
                self.push(TtsAudio::middle(sentence_id, tail, label.take(), priority, generation))
                    .await;
            }
            Ok(())
        };

        tokio::select! {
            _ = aborted(self.generation.clone(), generation) => Err(TtsError::Aborted),
            result = tokio::time::timeout(self.config.timeout, work) => match result {
                Ok(result) => result,
                Err(_) => Err(TtsError::Timeout(format!("stream exceeded {:?}", self.config.timeout))),
            },
        }
    }

    async fn ensure_duplex(&mut self) -> TtsResult<()> {
        if self.duplex.is_some() {
            return Ok(());
        }
        let params = DuplexParams {
            voice: self.config.voice.clone(),
            sample_rate: self.provider.sample_rate(),
            format: "pcm16",
        };
        let handle = self.provider.open_duplex(params).await?;
        self.duplex = Some(Duplex {
            control: handle.control,
            events: Some(handle.events),
        });
        Ok(())
    }

    /// Open (or reuse) the duplex channel and forward its audio for this turn.
    async fn start_forwarder(
        &mut self,
        turn: &Turn,
    ) -> Option<JoinHandle<Option<mpsc::Receiver<DuplexEvent>>>> {
        if let Err(e) = self.ensure_duplex().await {
            error!(session_id = %self.session_id, "Failed to open duplex TTS channel: {}", e);
            return None;
        }
        let mut events = self.duplex.as_mut()?.events.take()?;
        let codec = self.codec.clone();
        let pool = self.pool.clone();
        let queue = self.queue.clone();
        let rate = self.provider.sample_rate();
        let (sentence_id, priority, generation) = (turn.sentence_id, turn.priority, turn.generation);
        let session_id = self.session_id;

        Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    DuplexEvent::Audio(pcm) => match encode_pcm(codec.clone(), &pool, pcm, rate, false).await {
                        Ok(frames) if !frames.is_empty() => {
                            let _ = queue
                                .put(TtsAudio::middle(sentence_id, frames, None, priority, generation))
                                .await;
                        }
                        Ok(_) => {}
                        Err(e) => warn!(session_id = %session_id, "Duplex audio dropped: {}", e),
                    },
                    DuplexEvent::Finished => {
                        if let Ok(tail) = encode_pcm(codec.clone(), &pool, Bytes::new(), rate, true).await
                            && !tail.is_empty()
                        {
                            let _ = queue
                                .put(TtsAudio::middle(sentence_id, tail, None, priority, generation))
                                .await;
                        }
                        return Some(events);
                    }
                    DuplexEvent::Error(message) => {
                        warn!(session_id = %session_id, "Duplex TTS error: {}", message);
                    }
                }
            }
            None
        }))
    }

    async fn send_duplex_text(&mut self, text: &str) -> TtsResult<()> {
        let duplex = self
            .duplex
            .as_mut()
            .ok_or_else(|| TtsError::ConnectionFailed("duplex channel not open".to_string()))?;
        duplex.control.send_text(text).await
    }

    /// Flush the duplex channel and wait for the provider's finish signal.
    async fn finish_duplex(
        &mut self,
        mut forwarder: JoinHandle<Option<mpsc::Receiver<DuplexEvent>>>,
        generation: u64,
    ) {
        if let Some(duplex) = self.duplex.as_mut()
            && let Err(e) = duplex.control.flush().await
        {
            warn!(session_id = %self.session_id, "Duplex flush failed: {}", e);
        }

        let outcome = tokio::select! {
            _ = aborted(self.generation.clone(), generation) => {
                forwarder.abort();
                return;
            }
            result = tokio::time::timeout(self.config.timeout, &mut forwarder) => result,
        };

        match outcome {
            Ok(Ok(Some(events))) => {
                if let Some(duplex) = self.duplex.as_mut() {
                    duplex.events = Some(events);
                }
            }
            Ok(Ok(None)) => {
                debug!(session_id = %self.session_id, "Duplex channel closed by provider");
                self.duplex = None;
            }
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, "Duplex forwarder failed: {}", e);
                self.duplex = None;
            }
            Err(_) => {
                warn!(session_id = %self.session_id, "Duplex finish signal timed out");
                forwarder.abort();
                self.duplex = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::codec::{Pcm16Decoder, Pcm16Encoder};
    use crate::core::tts::base::DuplexHandle;
    use crate::core::tts::priority_queue::QueuedAudio;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// 20 ms of silence per character at 16 kHz.
    struct Recorder {
        mode: TtsMode,
        texts: Mutex<Vec<String>>,
        failures_left: AtomicUsize,
    }

    impl Recorder {
        fn new(mode: TtsMode) -> Arc<Self> {
            Arc::new(Self {
                mode,
                texts: Mutex::new(Vec::new()),
                failures_left: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TextToSpeech for Recorder {
        fn mode(&self) -> TtsMode {
            self.mode
        }

        fn sample_rate(&self) -> u32 {
            16000
        }

        async fn synthesize(&self, text: &str) -> TtsResult<Bytes> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(TtsError::ProviderError("flaky".into()));
            }
            self.texts.lock().push(text.to_string());
            Ok(Bytes::from(vec![0u8; text.chars().count() * 640]))
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    fn session(provider: Arc<dyn TextToSpeech>) -> TtsSession {
        observed_session(provider, TtsObservers::default())
    }

    fn observed_session(provider: Arc<dyn TextToSpeech>, observers: TtsObservers) -> TtsSession {
        let codec = CodecAdapter::new(Box::new(Pcm16Decoder::new(1)), Box::new(Pcm16Encoder::new(16000)));
        TtsSession::spawn(
            SessionId::new(),
            provider,
            codec,
            WorkerPool::new(2),
            Arc::new(AudioPriorityQueue::new()),
            TtsSessionConfig::default(),
            observers,
        )
    }

    async fn drain_until_last(queue: &AudioPriorityQueue) -> Vec<QueuedAudio> {
        let mut items = Vec::new();
        loop {
            let item = tokio::time::timeout(Duration::from_secs(5), queue.recv())
                .await
                .unwrap()
                .unwrap();
            let last = item.audio.sentence_type == SentenceType::Last;
            items.push(item);
            if last {
                return items;
            }
        }
    }

    #[tokio::test]
    async fn test_first_middle_last_order() {
        let provider = Recorder::new(TtsMode::NonStream);
        let tts = session(provider.clone());
        let writer = tts.begin(AudioPriority::Normal).await.unwrap();
        writer.text("你好，我是").await.unwrap();
        writer.text("语音助手。很高兴").await.unwrap();
        writer.text("认识你").await.unwrap();
        writer.finish().await.unwrap();

        let items = drain_until_last(tts.queue()).await;
        let types: Vec<SentenceType> = items.iter().map(|i| i.audio.sentence_type).collect();
        assert_eq!(types.first(), Some(&SentenceType::First));
        assert_eq!(types.last(), Some(&SentenceType::Last));
        assert!(types[1..types.len() - 1].iter().all(|t| *t == SentenceType::Middle));

        // wide punctuation only for the first segment
        assert_eq!(*provider.texts.lock(), vec!["你好，", "我是语音助手。", "很高兴认识你"]);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let provider = Recorder::new(TtsMode::NonStream);
        provider.failures_left.store(2, Ordering::SeqCst);
        let tts = session(provider.clone());
        tts.speak("稍等。", AudioPriority::Transition).await.unwrap();

        let items = drain_until_last(tts.queue()).await;
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| i.priority == AudioPriority::Transition));
        assert_eq!(items[1].audio.text.as_deref(), Some("稍等。"));
        assert_eq!(tts.stats().retries, 2);
    }

    #[tokio::test]
    async fn test_synthesis_outcomes_reach_degradation() {
        let flags = Arc::new(crate::core::observability::FeatureFlags::all_enabled());
        let degradation = Arc::new(DegradationManager::new(Default::default(), flags));
        let provider = Recorder::new(TtsMode::NonStream);
        provider.failures_left.store(100, Ordering::SeqCst);
        let tts = observed_session(
            provider.clone(),
            TtsObservers {
                tracer: None,
                degradation: Some(degradation.clone()),
            },
        );
        tts.speak("稍等。", AudioPriority::Normal).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while degradation.metrics().samples == 0 {
            assert!(Instant::now() < deadline, "no outcome observed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let metrics = degradation.metrics();
        assert_eq!(metrics.samples, 1);
        assert_eq!(metrics.error_rate, 1.0);
        assert_eq!(tts.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_file_audio_played_before_last() {
        let provider = Recorder::new(TtsMode::NonStream);
        let tts = session(provider);
        let writer = tts.begin(AudioPriority::Normal).await.unwrap();
        writer.file(Bytes::from(vec![0u8; 1920]), 16000).await.unwrap();
        writer.text("好的").await.unwrap();
        writer.finish().await.unwrap();

        let items = drain_until_last(tts.queue()).await;
        let middles: Vec<Option<&str>> = items
            .iter()
            .filter(|i| i.audio.sentence_type == SentenceType::Middle)
            .map(|i| i.audio.text.as_deref())
            .collect();
        assert_eq!(middles, vec![Some("好的"), None]);
    }

    #[tokio::test]
    async fn test_stale_generation_is_dropped() {
        let provider = Recorder::new(TtsMode::NonStream);
        let tts = session(provider.clone());
        let writer = tts.begin(AudioPriority::Normal).await.unwrap();
        tts.abort();
        writer.text("不会被合成。").await.unwrap();
        writer.finish().await.unwrap();

        tts.speak("新的回答。", AudioPriority::Normal).await.unwrap();
        let items = drain_until_last(tts.queue()).await;
        assert!(items.iter().all(|i| i.audio.generation == 1));
        assert_eq!(*provider.texts.lock(), vec!["新的回答。"]);
    }

    /// Dual-stream provider answering every text with audio and every
    /// flush with the finish signal.
    struct LoopbackDuplex {
        texts: Arc<Mutex<Vec<String>>>,
    }

    struct LoopbackControl {
        events: mpsc::Sender<DuplexEvent>,
        texts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl DuplexControl for LoopbackControl {
        async fn send_text(&mut self, text: &str) -> TtsResult<()> {
            self.texts.lock().push(text.to_string());
            self.events
                .send(DuplexEvent::Audio(Bytes::from(vec![0u8; 3840])))
                .await
                .map_err(|e| TtsError::ConnectionFailed(e.to_string()))
        }

        async fn flush(&mut self) -> TtsResult<()> {
            self.events
                .send(DuplexEvent::Finished)
                .await
                .map_err(|e| TtsError::ConnectionFailed(e.to_string()))
        }

        async fn stop(&mut self) -> TtsResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl TextToSpeech for LoopbackDuplex {
        fn mode(&self) -> TtsMode {
            TtsMode::DualStream
        }

        fn sample_rate(&self) -> u32 {
            16000
        }

        async fn synthesize(&self, _text: &str) -> TtsResult<Bytes> {
            Err(TtsError::Unsupported("duplex only".into()))
        }

        async fn open_duplex(&self, _params: DuplexParams) -> TtsResult<DuplexHandle> {
            let (tx, rx) = mpsc::channel(16);
            Ok(DuplexHandle {
                control: Box::new(LoopbackControl {
                    events: tx,
                    texts: self.texts.clone(),
                }),
                events: rx,
            })
        }

        fn name(&self) -> &'static str {
            "loopback"
        }
    }

    #[tokio::test]
    async fn test_dual_stream_turn_runs_on_worker_task() {
        let texts = Arc::new(Mutex::new(Vec::new()));
        let tts = session(Arc::new(LoopbackDuplex { texts: texts.clone() }));
        tts.speak("你好。今天天气不错。", AudioPriority::Normal).await.unwrap();

        let items = drain_until_last(tts.queue()).await;
        assert_eq!(items.first().map(|i| i.audio.sentence_type), Some(SentenceType::First));
        assert!(items.iter().any(|i| i.audio.sentence_type == SentenceType::Middle));
        assert_eq!(*texts.lock(), vec!["你好。", "今天天气不错。"]);
    }

    #[test]
    fn test_segmentation_cursor() {
        let mut turn = Turn {
            sentence_id: 1,
            priority: AudioPriority::Normal,
            generation: 0,
            buffer: "第一句，第二句，第三句。尾巴".to_string(),
            processed_chars: 0,
            first_segment: true,
            pending_files: Vec::new(),
            forwarder: None,
        };
        assert_eq!(turn.next_segment().as_deref(), Some("第一句，"));
        assert_eq!(turn.next_segment().as_deref(), Some("第二句，第三句。"));
        assert_eq!(turn.next_segment(), None);
        assert_eq!(turn.remainder(), "尾巴");
        assert_eq!(turn.remainder(), "");
    }
}
