//! Events module for conversation flow notifications
//!
//! The controller broadcasts these to the host, which binds them to UI
//! updates and to the speech output sink.

use serde::{Deserialize, Serialize};

use crate::state::ConversationState;

/// Notifications emitted by the flow controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    /// The user started an utterance
    UserSpeechStart,

    /// A valid utterance ended and will be answered
    UserSpeechEnd {
        /// Final transcript of the utterance
        transcript: String,
    },

    /// An utterance was too short or blank and was dropped
    UtteranceDiscarded {
        /// Measured utterance length in milliseconds
        duration_ms: u64,
    },

    /// Response text is ready and should be spoken
    AiResponseStart {
        /// Text to hand to the speech output
        text: String,
    },

    /// Response playback finished
    AiResponseEnd,

    /// Response generation failed or timed out
    ResponseFailed {
        message: String,
    },

    /// The conversation state changed
    ConversationFlow {
        state: ConversationState,
    },

    /// The flow was halted by an emergency stop
    EmergencyStop,
}

impl std::fmt::Display for FlowEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowEvent::UserSpeechStart => write!(f, "USER_SPEECH_START"),
            FlowEvent::UserSpeechEnd { transcript } => {
                write!(f, "USER_SPEECH_END ({} chars)", transcript.chars().count())
            }
            FlowEvent::UtteranceDiscarded { duration_ms } => {
                write!(f, "UTTERANCE_DISCARDED ({}ms)", duration_ms)
            }
            FlowEvent::AiResponseStart { text } => {
                write!(f, "AI_RESPONSE_START ({} chars)", text.chars().count())
            }
            FlowEvent::AiResponseEnd => write!(f, "AI_RESPONSE_END"),
            FlowEvent::ResponseFailed { message } => write!(f, "RESPONSE_FAILED ({})", message),
            FlowEvent::ConversationFlow { state } => write!(f, "CONVERSATION_FLOW ({})", state),
            FlowEvent::EmergencyStop => write!(f, "EMERGENCY_STOP"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = FlowEvent::UserSpeechEnd {
            transcript: "hello".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("user_speech_end"));
        assert!(json.contains("hello"));
    }

    #[test]
    fn test_state_event_serialization() {
        let event = FlowEvent::ConversationFlow {
            state: ConversationState::Harmonizing,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"conversation_flow","state":"harmonizing"}"#);
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"emergency_stop"}"#;
        let event: FlowEvent = serde_json::from_str(json).unwrap();
        assert!(matches!(event, FlowEvent::EmergencyStop));
    }

    #[test]
    fn test_display_hides_transcript_text() {
        let event = FlowEvent::UserSpeechEnd {
            transcript: "private words".to_string(),
        };
        assert_eq!(event.to_string(), "USER_SPEECH_END (13 chars)");
    }
}
