//! Cloneable handle to a running flow controller
//!
//! The controller is confined to one task. Everything else talks to it by
//! sending [`FlowCommand`]s, each answered with the resulting status.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{ConfigError, FlowConfigUpdate};

use super::machine::{ConversationState, FlowController, FlowStatus};

/// Host operations accepted by the controller
#[derive(Debug, Clone)]
pub enum FlowOp {
    Start,
    Stop,
    EmergencyStop,
    SpeechStart,
    SpeechEnd { transcript: String },
    ResponseComplete,
    UpdateConfig(FlowConfigUpdate),
}

/// An operation plus the channel its result is returned on
#[derive(Debug)]
pub struct FlowCommand {
    pub op: FlowOp,
    pub reply: oneshot::Sender<Result<FlowStatus, ConfigError>>,
}

/// Errors returned through a [`FlowHandle`]
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("flow controller is not running")]
    ControllerStopped,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Handle used by the host to drive the controller
#[derive(Debug, Clone)]
pub struct FlowHandle {
    commands: mpsc::Sender<FlowCommand>,
    status: watch::Receiver<FlowStatus>,
}

/// Spawn the controller on its own task
pub fn spawn(controller: FlowController) -> (FlowHandle, JoinHandle<()>) {
    let (commands, command_rx) = mpsc::channel(32);
    let status = controller.subscribe_status();
    let task = tokio::spawn(controller.run(command_rx));
    (FlowHandle { commands, status }, task)
}

impl FlowHandle {
    async fn send(&self, op: FlowOp) -> Result<FlowStatus, FlowError> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(FlowCommand { op, reply })
            .await
            .map_err(|_| FlowError::ControllerStopped)?;

        let status = reply_rx.await.map_err(|_| FlowError::ControllerStopped)??;
        Ok(status)
    }

    pub async fn start_flow(&self) -> Result<FlowStatus, FlowError> {
        self.send(FlowOp::Start).await
    }

    pub async fn stop_flow(&self) -> Result<FlowStatus, FlowError> {
        self.send(FlowOp::Stop).await
    }

    pub async fn emergency_stop(&self) -> Result<FlowStatus, FlowError> {
        self.send(FlowOp::EmergencyStop).await
    }

    pub async fn speech_start(&self) -> Result<FlowStatus, FlowError> {
        self.send(FlowOp::SpeechStart).await
    }

    pub async fn speech_end(&self, transcript: impl Into<String>) -> Result<FlowStatus, FlowError> {
        self.send(FlowOp::SpeechEnd {
            transcript: transcript.into(),
        })
        .await
    }

    pub async fn response_complete(&self) -> Result<FlowStatus, FlowError> {
        self.send(FlowOp::ResponseComplete).await
    }

    pub async fn update_config(&self, update: FlowConfigUpdate) -> Result<FlowStatus, FlowError> {
        self.send(FlowOp::UpdateConfig(update)).await
    }

    /// Latest published status
    pub fn status(&self) -> FlowStatus {
        self.status.borrow().clone()
    }

    pub fn current_state(&self) -> ConversationState {
        self.status.borrow().state
    }

    pub fn is_flow_active(&self) -> bool {
        self.status.borrow().active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::broadcast;

    use crate::config::FlowConfig;
    use crate::events::FlowEvent;
    use crate::providers::{ContextualResponder, LoggedAmbience};

    fn spawn_controller() -> (FlowHandle, JoinHandle<()>, broadcast::Receiver<FlowEvent>) {
        let (event_tx, event_rx) = broadcast::channel(64);
        let controller = FlowController::new(
            FlowConfig {
                voice_harmony_enabled: false,
                ..FlowConfig::default()
            },
            Arc::new(ContextualResponder::new()),
            Box::new(LoggedAmbience::new()),
            event_tx,
        );
        let (handle, task) = spawn(controller);
        (handle, task, event_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_round_trip() {
        let (handle, _task, mut events) = spawn_controller();

        let status = handle.start_flow().await.unwrap();
        assert_eq!(status.state, ConversationState::Listening);
        assert!(handle.is_flow_active());

        handle.speech_start().await.unwrap();
        tokio::time::advance(Duration::from_millis(800)).await;
        let status = handle.speech_end("I feel anxious").await.unwrap();
        assert_eq!(status.state, ConversationState::Processing);

        // Wait for the response to be handed to the speech output
        let text = loop {
            match events.recv().await.unwrap() {
                FlowEvent::AiResponseStart { text } => break text,
                _ => continue,
            }
        };
        assert!(text.contains("quickened tempo"));
        assert_eq!(handle.current_state(), ConversationState::Responding);

        let status = handle.response_complete().await.unwrap();
        assert_eq!(status.state, ConversationState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_rejects_invalid_config() {
        let (handle, _task, _events) = spawn_controller();
        let err = handle
            .update_config(FlowConfigUpdate {
                max_listen_time_ms: Some(0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));

        let status = handle
            .update_config(FlowConfigUpdate {
                minimum_speak_time_ms: Some(250),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(status.config.minimum_speak_time_ms, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_stop_through_handle() {
        let (handle, _task, mut events) = spawn_controller();
        handle.start_flow().await.unwrap();

        let status = handle.emergency_stop().await.unwrap();
        assert_eq!(status.state, ConversationState::Idle);
        assert!(!status.active);
        assert_eq!(status.pending_timers, 0);

        let mut saw_stop = false;
        while let Ok(event) = events.try_recv() {
            saw_stop |= event == FlowEvent::EmergencyStop;
        }
        assert!(saw_stop);
    }

    #[tokio::test]
    async fn test_stopped_controller_reports_error() {
        let (handle, task, _events) = spawn_controller();
        task.abort();
        let _ = task.await;

        let err = handle.start_flow().await.unwrap_err();
        assert!(matches!(err, FlowError::ControllerStopped));
    }
}
