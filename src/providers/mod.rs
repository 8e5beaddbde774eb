//! Capability providers consumed by the flow controller
//!
//! Response generation, speech output, and ambience are external to the
//! turn-taking logic; these traits are the seams, with one implementation
//! of each that runs without audio hardware.

mod ambience;
mod responder;
mod speech;

pub use ambience::{AmbientAudio, LoggedAmbience, AMBIENT_VOLUME, DUCKED_VOLUME};
pub use responder::{ChatEndpointResponder, ContextualResponder, GeneratorError, ResponseGenerator};
pub use speech::{SimulatedSpeech, SpeechError, SpeechOutput};
