//! Host-side wiring between flow events and speech output
//!
//! Plays each response through the [`SpeechOutput`] and always reports
//! completion back to the controller, even when playback fails, so the flow
//! cannot stay stuck in Responding. Playback only lives while the flow is
//! Responding; any other state stops it.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::FlowEvent;
use crate::providers::SpeechOutput;
use crate::state::{ConversationState, FlowHandle};

/// Speaks responses and reports their completion
pub struct ResponsePlayer {
    flow: FlowHandle,
    output: Arc<dyn SpeechOutput>,
    playback: Option<JoinHandle<()>>,
}

impl ResponsePlayer {
    pub fn new(flow: FlowHandle, output: Arc<dyn SpeechOutput>) -> Self {
        Self {
            flow,
            output,
            playback: None,
        }
    }

    /// Run until the event channel closes
    pub async fn run(mut self, mut events: broadcast::Receiver<FlowEvent>) {
        info!("response player started");

        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "response player lagged behind flow events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        self.stop_playback();
        info!("response player stopped");
    }

    fn handle_event(&mut self, event: FlowEvent) {
        match event {
            FlowEvent::AiResponseStart { text } => self.start_playback(text),
            FlowEvent::ConversationFlow { state } if state != ConversationState::Responding => {
                self.stop_playback();
            }
            FlowEvent::EmergencyStop => self.stop_playback(),
            _ => {}
        }
    }

    fn start_playback(&mut self, text: String) {
        self.stop_playback();

        let output = Arc::clone(&self.output);
        let flow = self.flow.clone();
        self.playback = Some(tokio::spawn(async move {
            if let Err(e) = output.speak(&text).await {
                warn!(error = %e, "speech output failed, completing response anyway");
            }
            if let Err(e) = flow.response_complete().await {
                debug!(error = %e, "could not report response completion");
            }
        }));
    }

    fn stop_playback(&mut self) {
        if let Some(task) = self.playback.take() {
            if !task.is_finished() {
                task.abort();
                self.output.stop();
            }
        }
    }
}
