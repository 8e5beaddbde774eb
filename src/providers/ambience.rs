//! Background ambience played while the flow is active

use tracing::{debug, info};

/// Volume while the flow is listening or responding
pub const AMBIENT_VOLUME: f32 = 0.3;

/// Volume while the user is speaking
pub const DUCKED_VOLUME: f32 = 0.1;

/// An ambience track owned by a single controller
pub trait AmbientAudio: Send {
    /// Start looping playback at `volume`
    fn play(&mut self, volume: f32);

    fn set_volume(&mut self, volume: f32);

    fn pause(&mut self);
}

/// Ambience sink that only records its transitions in the log
#[derive(Debug, Default)]
pub struct LoggedAmbience {
    volume: Option<f32>,
}

impl LoggedAmbience {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current volume, or `None` while paused
    pub fn volume(&self) -> Option<f32> {
        self.volume
    }
}

impl AmbientAudio for LoggedAmbience {
    fn play(&mut self, volume: f32) {
        self.volume = Some(volume);
        info!(volume, "ambience started");
    }

    fn set_volume(&mut self, volume: f32) {
        if self.volume.is_some() {
            self.volume = Some(volume);
            debug!(volume, "ambience volume changed");
        }
    }

    fn pause(&mut self) {
        if self.volume.take().is_some() {
            info!("ambience paused");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_changes_only_while_playing() {
        let mut ambience = LoggedAmbience::new();
        ambience.set_volume(DUCKED_VOLUME);
        assert_eq!(ambience.volume(), None);

        ambience.play(AMBIENT_VOLUME);
        ambience.set_volume(DUCKED_VOLUME);
        assert_eq!(ambience.volume(), Some(DUCKED_VOLUME));

        ambience.pause();
        assert_eq!(ambience.volume(), None);
    }
}
