//! Inbound half of the session: audio to VAD events, VAD segments to
//! transcripts, transcripts to turns or interruptions.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::protocol::ServerMessage;
use super::{Interrupt, SessionShared};
use crate::core::asr::AsrSession;
use crate::core::codec::AudioDecoder;
use crate::core::ingress::{AudioIngress, IngressEvent, VadEventKind};
use crate::core::interruption::{InterruptDecision, InterruptionInput};
use crate::core::observability::Feature;

pub(crate) enum IngressCommand {
    Audio(Bytes),
    /// New inbound decoder after `hello`
    Configure(Box<dyn AudioDecoder>),
    /// `listen stop`: close the utterance now
    EndUtterance,
    Reset,
}

pub(crate) async fn ingress_task(
    shared: Arc<SessionShared>,
    mut ingress: AudioIngress,
    mut commands: mpsc::Receiver<IngressCommand>,
    events: mpsc::Sender<IngressEvent>,
) {
    loop {
        let command = tokio::select! {
            _ = shared.stop.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        let produced = match command {
            IngressCommand::Audio(data) => ingress.process(data).await,
            IngressCommand::Configure(decoder) => {
                ingress.set_decoder(decoder);
                continue;
            }
            IngressCommand::EndUtterance => {
                let mut produced = ingress.flush().await;
                produced.extend(ingress.force_end());
                produced
            }
            IngressCommand::Reset => {
                ingress.reset();
                continue;
            }
        };
        for event in produced {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
    debug!(
        session_id = %shared.id,
        "Ingress stopped: {} codec errors, {} packets dropped",
        ingress.codec_errors(),
        ingress.dropped_packets()
    );
}

pub(crate) async fn listen_task(
    shared: Arc<SessionShared>,
    mut asr: AsrSession,
    mut events: mpsc::Receiver<IngressEvent>,
) {
    loop {
        let event = tokio::select! {
            _ = shared.stop.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            IngressEvent::Vad(vad) => match vad.kind {
                VadEventKind::VoiceStart => {
                    shared.touch();
                    asr.begin_utterance().await;
                    on_voice_start(&shared).await;
                }
                VadEventKind::VoiceContinue => shared.touch(),
                VadEventKind::VoiceEnd => {}
                VadEventKind::SilenceTimeout => {
                    shared.request_close("silence timeout").await;
                    break;
                }
            },
            IngressEvent::Speech(pcm) => asr.push_speech(&pcm).await,
            IngressEvent::Segment(segment) => {
                for transcript in asr.transcribe(segment).await {
                    if transcript.is_final() && !transcript.is_error() {
                        on_transcript(&shared, transcript.text).await;
                    }
                }
            }
        }
    }
}

fn smart_enabled(shared: &SessionShared) -> bool {
    shared.core.flags.is_enabled(Feature::SmartInterruption)
}

async fn on_voice_start(shared: &Arc<SessionShared>) {
    // the user is answering a confirmation prompt, not barging in
    if shared.pending_confirmation.lock().is_some() {
        return;
    }
    let decision = shared.interruption.decide(
        shared.state.current(),
        shared.listen_mode(),
        InterruptionInput::Vad(VadEventKind::VoiceStart),
        smart_enabled(shared),
    );
    if let InterruptDecision::Interrupt { kind, requeue_text } = decision {
        shared
            .interrupt(Interrupt {
                kind,
                trigger: String::new(),
                requeue: requeue_text,
                acknowledge: true,
            })
            .await;
    }
}

/// Route a final transcript: confirmation answer, interruption, or new turn.
pub(crate) async fn on_transcript(shared: &Arc<SessionShared>, text: String) {
    let text = text.trim().to_string();
    if text.is_empty() {
        return;
    }
    shared.touch();
    shared
        .send(ServerMessage::Stt {
            session_id: shared.id,
            text: text.clone(),
        })
        .await;

    let pending = shared.pending_confirmation.lock().take();
    if let Some(reply) = pending {
        let _ = reply.send(text);
        return;
    }

    let state = shared.state.current();
    if !state.is_active_output() {
        shared.submit_user_text(text).await;
        return;
    }

    let decision = shared.interruption.decide(
        state,
        shared.listen_mode(),
        InterruptionInput::Transcript(&text),
        smart_enabled(shared),
    );
    match decision {
        InterruptDecision::Interrupt { kind, requeue_text } => {
            let handled = shared
                .interrupt(Interrupt {
                    kind,
                    trigger: text.clone(),
                    requeue: requeue_text.clone(),
                    acknowledge: true,
                })
                .await;
            // output finished on its own in the meantime
            if !handled && let Some(requeue) = requeue_text {
                shared.submit_user_text(requeue).await;
            }
        }
        InterruptDecision::Continue | InterruptDecision::Defer => {
            info!(session_id = %shared.id, "Ignoring '{}' while {}", text, state);
        }
    }
}
