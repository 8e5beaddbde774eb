//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::FlowConfigUpdate;
use crate::events::FlowEvent;
use crate::state::{ConversationState, FlowStatus};

/// Largest accepted message body
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Requests from UI to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Request current daemon status
    GetStatus,

    /// Ping to check connectivity
    Ping,

    /// Begin a continuous conversation
    StartFlow,

    /// End the conversation
    StopFlow,

    /// Halt everything immediately
    EmergencyStop,

    /// Speech input detected the start of an utterance
    SpeechStart,

    /// Speech input finished an utterance
    SpeechEnd { transcript: String },

    /// Speech output finished (or failed) playing the response
    ResponseComplete,

    /// Patch the flow timing policy
    UpdateConfig { config: FlowConfigUpdate },

    /// Subscribe to flow event notifications
    Subscribe,
}

/// Responses from daemon to UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current daemon status
    Status(DaemonStatus),

    /// Operation applied; state after applying it
    Ack {
        state: ConversationState,
        active: bool,
    },

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Error response
    Error { code: String, message: String },
}

/// Push notification from daemon to UI (for subscribed clients)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A flow event occurred
    Event { event: FlowEvent },
}

/// Full daemon status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    /// Daemon version
    pub version: String,

    /// Flow controller status
    pub flow: FlowStatus,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl DaemonStatus {
    pub fn new(flow: FlowStatus, uptime_secs: u64) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            flow,
            uptime_secs,
        }
    }
}

/// Errors reading a frame
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("message of {0} bytes exceeds the limit")]
    TooLarge(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Read one length-prefixed message body
///
/// Returns `Ok(None)` when the peer closed the connection between messages.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Encode a message as a length-prefixed JSON frame
pub fn encode_frame<T: Serialize>(msg: &T) -> serde_json::Result<Vec<u8>> {
    let body = serde_json::to_vec(msg)?;
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Send a length-prefixed JSON message
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlowConfig;

    #[test]
    fn test_request_serialization() {
        let req = Request::SpeechEnd {
            transcript: "hello".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"speech_end","transcript":"hello"}"#);
    }

    #[test]
    fn test_update_config_request_parses() {
        let json = r#"{"type":"update_config","config":{"silence_threshold_ms":1200}}"#;
        let req: Request = serde_json::from_str(json).unwrap();
        match req {
            Request::UpdateConfig { config } => {
                assert_eq!(config.silence_threshold_ms, Some(1200));
                assert_eq!(config.voice_harmony_enabled, None);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_response_serialization() {
        let resp = Response::Status(DaemonStatus::new(
            FlowStatus {
                state: ConversationState::Idle,
                active: false,
                pending_timers: 0,
                config: FlowConfig::default(),
            },
            3,
        ));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""state":"idle""#));
    }

    #[test]
    fn test_notification_keeps_event_tag() {
        let note = Notification::Event {
            event: FlowEvent::AiResponseEnd,
        };
        let json = serde_json::to_string(&note).unwrap();
        assert_eq!(json, r#"{"type":"event","event":{"type":"ai_response_end"}}"#);
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &Request::Ping).await.unwrap();
        drop(client);

        let body = read_frame(&mut server).await.unwrap().unwrap();
        let req: Request = serde_json::from_slice(&body).unwrap();
        assert!(matches!(req, Request::Ping));
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_LEN as u32 + 1).to_le_bytes();
        client.write_all(&len).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(_)));
    }
}
