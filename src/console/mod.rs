//! Console relay for operator commands
//!
//! Reads lines from stdin on a dedicated thread and forwards them as
//! [`ConsoleCommand`]s. A blank line or `esc` is the emergency stop key.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Commands an operator can type at the console
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Halt the flow immediately
    EmergencyStop,
    /// Begin a conversation
    Start,
    /// End the conversation
    Stop,
    /// Log the current flow status
    Status,
}

impl ConsoleCommand {
    /// Parse one console line
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "" | "esc" | "escape" => Some(Self::EmergencyStop),
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

/// Errors that can occur starting the console relay
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("console relay is already running")]
    AlreadyRunning,

    #[error("failed to spawn console thread: {0}")]
    ThreadSpawn(String),
}

/// Forwards stdin lines to the daemon's main loop
pub struct ConsoleRelay {
    command_tx: mpsc::Sender<ConsoleCommand>,
    running: Arc<AtomicBool>,
}

impl ConsoleRelay {
    pub fn new(command_tx: mpsc::Sender<ConsoleCommand>) -> Self {
        Self {
            command_tx,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start reading stdin on a dedicated thread
    ///
    /// Stdin reads block, so the thread only notices `stop()` after the next
    /// line arrives; the process exiting ends it otherwise.
    pub fn start(&self) -> Result<(), ConsoleError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ConsoleError::AlreadyRunning);
        }

        let command_tx = self.command_tx.clone();
        let running = Arc::clone(&self.running);

        thread::Builder::new()
            .name("console-relay".to_string())
            .spawn(move || {
                info!("console relay thread started");
                let stdin = std::io::stdin();
                relay_lines(stdin.lock(), &command_tx, &running);
                running.store(false, Ordering::SeqCst);
                info!("console relay thread stopped");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                ConsoleError::ThreadSpawn(e.to_string())
            })?;

        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Forward parsed lines until input ends, the receiver closes, or the relay stops
fn relay_lines<R: BufRead>(
    input: R,
    command_tx: &mpsc::Sender<ConsoleCommand>,
    running: &AtomicBool,
) {
    for line in input.lines() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(?e, "failed to read console input");
                break;
            }
        };

        let Some(command) = ConsoleCommand::parse(&line) else {
            warn!(input = %line.trim(), "unknown console command");
            continue;
        };
        debug!(?command, "console command");
        if command_tx.blocking_send(command).is_err() {
            warn!("console command channel closed");
            break;
        }
    }
}
