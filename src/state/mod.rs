//! Conversation flow state machine
//!
//! Provides the flow controller with five states:
//! - Idle: no flow active, or a brief max-listen cooldown
//! - Listening: waiting for or receiving user speech
//! - Processing: utterance accepted, response pending
//! - Responding: response being spoken
//! - Harmonizing: short hold before listening resumes

mod handle;
mod machine;
mod timer;

pub use handle::{spawn, FlowError, FlowHandle};
pub use machine::{ConversationState, FlowController, FlowStatus};
