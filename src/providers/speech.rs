//! Speech output sinks

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

/// Pacing used by the simulated sink
const MS_PER_WORD: u64 = 60;
const MAX_PLAYBACK_MS: u64 = 20_000;

/// Errors from speech playback
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("speech output unavailable: {0}")]
    Unavailable(String),
}

/// Audible playback of response text
#[async_trait]
pub trait SpeechOutput: Send + Sync {
    /// Speak `text`, resolving once playback has finished
    async fn speak(&self, text: &str) -> Result<(), SpeechError>;

    /// Abort any playback in progress
    fn stop(&self);
}

/// Sink that logs the text and waits roughly as long as speaking it would take
#[derive(Debug, Default)]
pub struct SimulatedSpeech {
    speaking: AtomicBool,
}

impl SimulatedSpeech {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn playback_time(text: &str) -> Duration {
        let words = text.split_whitespace().count() as u64;
        Duration::from_millis((words * MS_PER_WORD).min(MAX_PLAYBACK_MS))
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechOutput for SimulatedSpeech {
    async fn speak(&self, text: &str) -> Result<(), SpeechError> {
        let duration = Self::playback_time(text);
        self.speaking.store(true, Ordering::SeqCst);
        info!(duration_ms = duration.as_millis() as u64, "speaking: {}", text);

        tokio::time::sleep(duration).await;

        self.speaking.store(false, Ordering::SeqCst);
        debug!("playback finished");
        Ok(())
    }

    fn stop(&self) {
        if self.speaking.swap(false, Ordering::SeqCst) {
            info!("playback stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playback_time_scales_with_words() {
        assert_eq!(SimulatedSpeech::playback_time(""), Duration::ZERO);
        assert_eq!(
            SimulatedSpeech::playback_time("one two three"),
            Duration::from_millis(180)
        );
        let long = "word ".repeat(10_000);
        assert_eq!(
            SimulatedSpeech::playback_time(&long),
            Duration::from_millis(MAX_PLAYBACK_MS)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_speak_completes() {
        let speech = SimulatedSpeech::new();
        speech.speak("hello there").await.unwrap();
        assert!(!speech.is_speaking());
    }

    #[test]
    fn test_stop_without_playback_is_noop() {
        let speech = SimulatedSpeech::new();
        speech.stop();
        tokio_test::block_on(async { speech.speak("").await.unwrap() });
        speech.stop();
        assert!(!speech.is_speaking());
    }
}
