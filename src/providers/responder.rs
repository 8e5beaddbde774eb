//! Response generators
//!
//! The controller forwards accepted transcripts to a [`ResponseGenerator`]
//! and speaks whatever text comes back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default timeout for chat endpoint requests in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Errors from response generation
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("generator returned an empty response")]
    Empty,
}

/// Produces response text for a user transcript
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, transcript: &str) -> Result<String, GeneratorError>;
}

const REFLECTIONS: [&str; 5] = [
    "I hear the melody in your words. Let's explore that feeling together.",
    "Your voice carries such harmony. Tell me more about what's on your heart.",
    "That sounds like a beautiful note in your life's symphony. How does it resonate with you?",
    "I'm listening to the rhythm of your thoughts. What comes next in this song?",
    "Your words create such lovely harmonies. Let's find the next verse together.",
];

/// Offline responder that matches a few emotional keywords
///
/// Falls back to a rotating set of general reflections.
#[derive(Debug, Default)]
pub struct ContextualResponder {
    next_reflection: AtomicUsize,
}

impl ContextualResponder {
    pub fn new() -> Self {
        Self::default()
    }

    fn respond(&self, transcript: &str) -> String {
        let lower = transcript.to_lowercase();
        let mentions = |words: [&str; 2]| words.iter().any(|w| lower.contains(w));

        if mentions(["sad", "hurt"]) {
            "I hear the minor chords in your voice. \
             Let's find some harmony in this moment together."
                .to_string()
        } else if mentions(["happy", "good"]) {
            "Your joy creates such beautiful music! \
             Tell me more about what's bringing this light to your day."
                .to_string()
        } else if mentions(["anxious", "worried"]) {
            "I can hear the quickened tempo in your thoughts. \
             Let's slow down the rhythm and find some calm together."
                .to_string()
        } else {
            let index = self.next_reflection.fetch_add(1, Ordering::Relaxed) % REFLECTIONS.len();
            REFLECTIONS[index].to_string()
        }
    }
}

#[async_trait]
impl ResponseGenerator for ContextualResponder {
    async fn generate(&self, transcript: &str) -> Result<String, GeneratorError> {
        Ok(self.respond(transcript))
    }
}

/// Prompt context sent with every voice transcript
const VOICE_CONTEXT: &str =
    "Voice conversation. The reply will be spoken aloud, so keep it short and conversational.";

/// Request body for the chat endpoint
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    message: &'a str,
    context: &'a str,
}

/// Response from the chat endpoint
#[derive(Debug, Deserialize)]
struct ChatResponse {
    response: String,
}

/// Generator backed by an HTTP chat endpoint
///
/// Posts `{"message": ..., "context": ...}` and reads `{"response": ...}`.
/// No retries here; a failure surfaces to the controller, which resumes
/// listening.
#[derive(Debug, Clone)]
pub struct ChatEndpointResponder {
    url: String,
    client: reqwest::Client,
}

impl ChatEndpointResponder {
    pub fn new(url: impl Into<String>) -> Result<Self, GeneratorError> {
        Self::with_timeout(url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self, GeneratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GeneratorError::Client(e.to_string()))?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ResponseGenerator for ChatEndpointResponder {
    async fn generate(&self, transcript: &str) -> Result<String, GeneratorError> {
        let body = ChatRequest {
            message: transcript,
            context: VOICE_CONTEXT,
        };

        debug!(url = %self.url, "requesting chat response");
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GeneratorError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "chat endpoint returned an error");
            return Err(GeneratorError::Server {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::Parse(e.to_string()))?;

        let text = parsed.response.trim();
        if text.is_empty() {
            return Err(GeneratorError::Empty);
        }
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keyword_responses() {
        let responder = ContextualResponder::new();
        let sad = responder.generate("I feel sad today").await.unwrap();
        assert!(sad.contains("minor chords"));

        let anxious = responder.generate("I'm WORRIED about tomorrow").await.unwrap();
        assert!(anxious.contains("quickened tempo"));

        let happy = responder.generate("it was a good day").await.unwrap();
        assert!(happy.contains("joy"));
    }

    #[tokio::test]
    async fn test_reflections_rotate() {
        let responder = ContextualResponder::new();
        let first = responder.generate("tell me something").await.unwrap();
        let second = responder.generate("tell me something").await.unwrap();
        assert_ne!(first, second);
        assert!(REFLECTIONS.contains(&first.as_str()));
    }

    #[test]
    fn test_chat_request_shape() {
        let body = ChatRequest {
            message: "hello",
            context: VOICE_CONTEXT,
        };
        let json: serde_json::Value = serde_json::to_value(&body).unwrap();
        assert_eq!(json["message"], "hello");
        assert_eq!(json["context"].as_str(), Some(VOICE_CONTEXT));
    }

    #[test]
    fn test_chat_response_parse() {
        let parsed: ChatResponse = serde_json::from_str(r#"{"response":"I'm here."}"#).unwrap();
        assert_eq!(parsed.response, "I'm here.");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_request_error() {
        let responder = ChatEndpointResponder::with_timeout(
            "http://127.0.0.1:9/api/ai/chat",
            Duration::from_secs(2),
        )
        .unwrap();
        let err = responder.generate("hello").await.unwrap_err();
        assert!(matches!(err, GeneratorError::Request(_)));
    }
}
