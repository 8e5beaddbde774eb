//! Conversation flow controller
//!
//! Owns the conversation state, the timing policy, and the turn-taking
//! protocol between speech input and speech output. Every mutation happens
//! on the task that owns the controller; timers and response requests
//! report back over channels drained by [`FlowController::run`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, FlowConfig, FlowConfigUpdate};
use crate::events::FlowEvent;
use crate::providers::{
    AmbientAudio, GeneratorError, ResponseGenerator, AMBIENT_VOLUME, DUCKED_VOLUME,
};

use super::handle::{FlowCommand, FlowOp};
use super::timer::{AbortOnDrop, TimerFired, TimerKind, Timers};

/// The five states of a spoken conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// No flow active, or pausing during a max-listen cooldown
    #[default]
    Idle,
    /// Waiting for or receiving user speech
    Listening,
    /// Utterance accepted, waiting out the silence threshold or the response
    Processing,
    /// Response is being spoken
    Responding,
    /// Short hold after a response before listening resumes
    Harmonizing,
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationState::Idle => write!(f, "Idle"),
            ConversationState::Listening => write!(f, "Listening"),
            ConversationState::Processing => write!(f, "Processing"),
            ConversationState::Responding => write!(f, "Responding"),
            ConversationState::Harmonizing => write!(f, "Harmonizing"),
        }
    }
}

/// Snapshot of the controller published to handles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStatus {
    pub state: ConversationState,
    pub active: bool,
    pub pending_timers: usize,
    pub config: FlowConfig,
}

/// Result of a response request, tagged with the request it belongs to
#[derive(Debug)]
struct ResponseOutcome {
    seq: u64,
    result: Result<String, GeneratorError>,
}

#[derive(Debug)]
enum Wakeup {
    Timer(TimerFired),
    Response(ResponseOutcome),
}

/// The conversation flow controller
pub struct FlowController {
    state: ConversationState,
    config: FlowConfig,
    active: bool,
    /// When the current utterance started, if one is in progress
    speech_started_at: Option<Instant>,
    /// Accepted transcript waiting for the silence timer
    pending_transcript: Option<String>,
    timers: Timers,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
    generator: Arc<dyn ResponseGenerator>,
    response_task: Option<AbortOnDrop>,
    /// Bumped on every request and cancellation; older outcomes are stale
    response_seq: u64,
    response_tx: mpsc::UnboundedSender<ResponseOutcome>,
    response_rx: mpsc::UnboundedReceiver<ResponseOutcome>,
    ambience: Box<dyn AmbientAudio>,
    ambience_playing: bool,
    event_tx: broadcast::Sender<FlowEvent>,
    status_tx: watch::Sender<FlowStatus>,
}

impl FlowController {
    /// Create an idle controller
    pub fn new(
        config: FlowConfig,
        generator: Arc<dyn ResponseGenerator>,
        ambience: Box<dyn AmbientAudio>,
        event_tx: broadcast::Sender<FlowEvent>,
    ) -> Self {
        let (timers, timer_rx) = Timers::new();
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(FlowStatus {
            state: ConversationState::Idle,
            active: false,
            pending_timers: 0,
            config: config.clone(),
        });

        Self {
            state: ConversationState::Idle,
            config,
            active: false,
            speech_started_at: None,
            pending_transcript: None,
            timers,
            timer_rx,
            generator,
            response_task: None,
            response_seq: 0,
            response_tx,
            response_rx,
            ambience,
            ambience_playing: false,
            event_tx,
            status_tx,
        }
    }

    /// Get the current state
    pub fn current_state(&self) -> ConversationState {
        self.state
    }

    pub fn is_flow_active(&self) -> bool {
        self.active
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn status(&self) -> FlowStatus {
        FlowStatus {
            state: self.state,
            active: self.active,
            pending_timers: self.timers.pending_count(),
            config: self.config.clone(),
        }
    }

    /// Watch channel that tracks [`FlowStatus`] while the controller runs
    pub fn subscribe_status(&self) -> watch::Receiver<FlowStatus> {
        self.status_tx.subscribe()
    }

    /// Run the controller, processing commands until every sender is gone
    pub async fn run(mut self, mut commands: mpsc::Receiver<FlowCommand>) {
        info!("flow controller started in Idle state");
        self.publish_status();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.dispatch(command),
                    None => break,
                },
                wakeup = next_wakeup(&mut self.timer_rx, &mut self.response_rx) => {
                    self.handle_wakeup(wakeup);
                    self.publish_status();
                }
            }
        }

        self.stop_flow();
        info!("flow controller stopped");
    }

    fn dispatch(&mut self, command: FlowCommand) {
        let FlowCommand { op, reply } = command;
        let result = self.apply(op).map(|()| self.status());
        self.publish_status();
        let _ = reply.send(result);
    }

    /// Apply a single host operation
    pub fn apply(&mut self, op: FlowOp) -> Result<(), ConfigError> {
        match op {
            FlowOp::Start => self.start_flow(),
            FlowOp::Stop => self.stop_flow(),
            FlowOp::EmergencyStop => self.emergency_stop(),
            FlowOp::SpeechStart => self.on_speech_start(),
            FlowOp::SpeechEnd { transcript } => self.on_speech_end(&transcript),
            FlowOp::ResponseComplete => self.on_ai_response_complete(),
            FlowOp::UpdateConfig(update) => return self.update_config(&update),
        }
        Ok(())
    }

    /// Begin a fresh session in Listening
    pub fn start_flow(&mut self) {
        if self.active {
            debug!("flow already active, ignoring start");
            return;
        }

        info!("starting conversation flow");
        self.active = true;
        self.speech_started_at = None;
        self.pending_transcript = None;

        if self.config.ambient_music_enabled {
            self.ambience.play(AMBIENT_VOLUME);
            self.ambience_playing = true;
        }

        self.resume_listening();
    }

    /// End the session; safe to call from any state, any number of times
    pub fn stop_flow(&mut self) {
        let was_active = self.active;
        self.halt();

        if was_active {
            info!("conversation flow stopped");
        } else {
            debug!("stop requested while inactive");
        }
    }

    /// Halt immediately and tell the host to silence everything
    pub fn emergency_stop(&mut self) {
        warn!(state = %self.state, "emergency stop");
        self.halt();
        self.emit(FlowEvent::EmergencyStop);
    }

    fn halt(&mut self) {
        // Timers go first so nothing can fire into a half-stopped session
        self.timers.cancel_all();
        self.cancel_response();
        self.active = false;
        self.speech_started_at = None;
        self.pending_transcript = None;

        if std::mem::take(&mut self.ambience_playing) {
            self.ambience.pause();
        }

        self.transition_to(ConversationState::Idle);
    }

    /// The user began an utterance
    ///
    /// Interrupts anything in progress: a pending silence timer, a pending
    /// response request, response playback, or a transitional pause.
    pub fn on_speech_start(&mut self) {
        if !self.active {
            return;
        }

        debug!(state = %self.state, "user started speaking");
        self.timers.cancel(TimerKind::Silence);
        self.timers.cancel(TimerKind::Transition);
        self.timers.cancel(TimerKind::Response);
        self.cancel_response();

        self.speech_started_at = Some(Instant::now());
        self.transition_to(ConversationState::Listening);
        self.timers
            .schedule(TimerKind::MaxListen, self.config.max_listen_time());
        self.emit(FlowEvent::UserSpeechStart);
        self.set_ambience_volume(DUCKED_VOLUME);
    }

    /// The user finished an utterance with the given final transcript
    pub fn on_speech_end(&mut self, transcript: &str) {
        if !self.active {
            return;
        }

        self.set_ambience_volume(AMBIENT_VOLUME);

        let Some(started_at) = self.speech_started_at.take() else {
            debug!("speech end without a matching start, ignoring");
            return;
        };

        let duration = started_at.elapsed();
        let duration_ms = duration.as_millis() as u64;
        self.timers.cancel(TimerKind::Transition);

        if duration >= self.config.minimum_speak_time() && !transcript.trim().is_empty() {
            info!(duration_ms, "utterance accepted");
            self.timers.cancel(TimerKind::MaxListen);
            self.transition_to(ConversationState::Processing);
            self.pending_transcript = Some(transcript.to_string());
            self.emit(FlowEvent::UserSpeechEnd {
                transcript: transcript.to_string(),
            });
            self.timers
                .schedule(TimerKind::Silence, self.config.silence_threshold());
        } else {
            debug!(duration_ms, "utterance too short or empty, continuing to listen");
            self.emit(FlowEvent::UtteranceDiscarded { duration_ms });
            self.resume_listening();
        }
    }

    /// Response playback finished (or was given up on by the host)
    pub fn on_ai_response_complete(&mut self) {
        if !self.active {
            return;
        }
        if self.state != ConversationState::Responding {
            debug!(state = %self.state, "response completion outside Responding, ignoring");
            return;
        }

        info!("response complete, resuming listening");
        self.timers.cancel(TimerKind::Response);
        self.emit(FlowEvent::AiResponseEnd);

        if self.config.voice_harmony_enabled {
            self.transition_to(ConversationState::Harmonizing);
            self.timers
                .schedule(TimerKind::Transition, self.config.harmony_pause());
        } else {
            self.resume_listening();
        }
    }

    /// Merge a partial config; applies from the next scheduled timer on
    pub fn update_config(&mut self, update: &FlowConfigUpdate) -> Result<(), ConfigError> {
        let merged = self.config.merged(update)?;
        info!(config = ?merged, "flow config updated");
        self.config = merged;
        Ok(())
    }

    fn handle_wakeup(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Timer(fired) => self.on_timer(fired),
            Wakeup::Response(outcome) => self.on_response(outcome),
        }
    }

    fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.claim(fired) || !self.active {
            return;
        }

        match (fired.kind, self.state) {
            (TimerKind::Silence, ConversationState::Processing) => {
                if let Some(transcript) = self.pending_transcript.take() {
                    self.request_response(transcript);
                }
            }
            (TimerKind::MaxListen, ConversationState::Listening) => {
                // An utterance in progress survives the cooldown and is
                // still judged when it ends
                info!("maximum listen time reached, taking a break");
                self.transition_to(ConversationState::Idle);
                self.timers
                    .schedule(TimerKind::Transition, self.config.cooldown_pause());
            }
            (
                TimerKind::Transition,
                ConversationState::Harmonizing | ConversationState::Idle,
            ) => {
                self.resume_listening();
            }
            (TimerKind::Response, ConversationState::Processing) => {
                warn!("response generation timed out");
                self.cancel_response();
                self.emit(FlowEvent::ResponseFailed {
                    message: "response timed out".to_string(),
                });
                self.resume_listening();
            }
            (TimerKind::Response, ConversationState::Responding) => {
                warn!("response playback never completed, moving on");
                self.on_ai_response_complete();
            }
            (kind, state) => {
                debug!(?kind, %state, "timer fired with nothing to do");
            }
        }
    }

    fn request_response(&mut self, transcript: String) {
        self.response_seq += 1;
        let seq = self.response_seq;
        let generator = Arc::clone(&self.generator);
        let response_tx = self.response_tx.clone();

        info!(seq, "requesting response");
        let handle = tokio::spawn(async move {
            let result = generator.generate(&transcript).await;
            let _ = response_tx.send(ResponseOutcome { seq, result });
        });

        self.response_task = Some(AbortOnDrop::new(handle));
        self.timers
            .schedule(TimerKind::Response, self.config.response_timeout());
    }

    fn cancel_response(&mut self) {
        if self.response_task.take().is_some() {
            debug!(seq = self.response_seq, "in-flight response cancelled");
        }
        self.response_seq += 1;
    }

    fn on_response(&mut self, outcome: ResponseOutcome) {
        if !self.active
            || outcome.seq != self.response_seq
            || self.state != ConversationState::Processing
        {
            debug!(seq = outcome.seq, "discarding stale response");
            return;
        }

        self.response_task = None;

        match outcome.result {
            Ok(text) => {
                self.transition_to(ConversationState::Responding);
                self.emit(FlowEvent::AiResponseStart { text });
                self.timers
                    .schedule(TimerKind::Response, self.config.response_timeout());
            }
            Err(e) => {
                warn!(error = %e, "response generation failed");
                self.timers.cancel(TimerKind::Response);
                self.emit(FlowEvent::ResponseFailed {
                    message: e.to_string(),
                });
                self.resume_listening();
            }
        }
    }

    /// Enter Listening with a fresh max-listen timer
    fn resume_listening(&mut self) {
        self.transition_to(ConversationState::Listening);
        self.timers
            .schedule(TimerKind::MaxListen, self.config.max_listen_time());
    }

    fn set_ambience_volume(&mut self, volume: f32) {
        if self.ambience_playing {
            self.ambience.set_volume(volume);
        }
    }

    /// Perform a state transition
    fn transition_to(&mut self, new_state: ConversationState) {
        let old_state = self.state;
        if old_state == new_state {
            return;
        }

        info!(from = %old_state, to = %new_state, "flow state transition");
        self.state = new_state;
        self.emit(FlowEvent::ConversationFlow { state: new_state });
    }

    fn emit(&self, event: FlowEvent) {
        debug!(%event, "emitting flow event");
        let _ = self.event_tx.send(event);
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }

    /// Handle exactly one timer fire or response outcome
    #[cfg(test)]
    async fn pump(&mut self) {
        let wakeup = next_wakeup(&mut self.timer_rx, &mut self.response_rx).await;
        self.handle_wakeup(wakeup);
    }
}

async fn next_wakeup(
    timer_rx: &mut mpsc::UnboundedReceiver<TimerFired>,
    response_rx: &mut mpsc::UnboundedReceiver<ResponseOutcome>,
) -> Wakeup {
    tokio::select! {
        Some(fired) = timer_rx.recv() => Wakeup::Timer(fired),
        Some(outcome) = response_rx.recv() => Wakeup::Response(outcome),
        else => std::future::pending().await,
    }
}
