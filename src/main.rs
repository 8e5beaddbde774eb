//! voice-flow-daemon: Background daemon for continuous voice conversation
//!
//! Hosts the conversation flow controller and provides:
//! - Silence and max-listen timing that decides when the user has finished
//! - Response generation with barge-in and emergency stop
//! - IPC server for speech input and UI clients
//! - Console relay for operator commands

mod config;
mod console;
mod events;
mod host;
mod ipc;
mod lifecycle;
mod providers;
mod state;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::console::{ConsoleCommand, ConsoleRelay};
use crate::events::FlowEvent;
use crate::host::ResponsePlayer;
use crate::ipc::Server;
use crate::lifecycle::ShutdownSignal;
use crate::providers::{
    ChatEndpointResponder, ContextualResponder, LoggedAmbience, ResponseGenerator, SimulatedSpeech,
};
use crate::state::{spawn, FlowController, FlowHandle};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "voice-flow-daemon starting"
    );

    // Load configuration
    let config = Config::load()?;
    config.ensure_dirs()?;
    info!(?config.socket_path, flow = ?config.flow, "configuration loaded");

    let mut shutdown = ShutdownSignal::new()?;

    // Controller -> IPC subscribers, response player
    let (event_tx, _event_rx) = broadcast::channel::<FlowEvent>(64);
    // Console relay -> main loop
    let (console_tx, mut console_rx) = mpsc::channel(32);

    let generator: Arc<dyn ResponseGenerator> = match &config.chat_url {
        Some(url) => {
            let responder = ChatEndpointResponder::new(url.clone())?;
            info!(url = responder.url(), "using chat endpoint for responses");
            Arc::new(responder)
        }
        None => {
            info!("no chat endpoint configured, using built-in responder");
            Arc::new(ContextualResponder::new())
        }
    };

    let controller = FlowController::new(
        config.flow.clone(),
        generator,
        Box::new(LoggedAmbience::new()),
        event_tx.clone(),
    );
    let (flow, controller_task) = spawn(controller);

    let player = ResponsePlayer::new(flow.clone(), Arc::new(SimulatedSpeech::new()));
    let player_task = tokio::spawn(player.run(event_tx.subscribe()));

    let console = ConsoleRelay::new(console_tx);
    match console.start() {
        Ok(()) => info!("console relay started (blank line or 'esc' for emergency stop)"),
        Err(e) => warn!(?e, "continuing without console relay"),
    }

    let server = Server::new(&config.socket_path, flow.clone(), event_tx.clone())?;

    info!("daemon initialized, entering main loop");

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        _ = async {
            while let Some(command) = console_rx.recv().await {
                handle_console(command, &flow).await;
            }
        } => {
            info!("console relay exited");
        }

        _ = shutdown.wait() => {
            info!("shutdown signal received");
        }
    }

    // Cleanup
    info!("shutting down...");

    console.stop();
    if let Err(e) = flow.stop_flow().await {
        warn!(error = %e, "failed to stop flow");
    }
    server.shutdown().await;

    // The flow is already stopped; nothing is left for these tasks to finish
    player_task.abort();
    controller_task.abort();

    info!("voice-flow-daemon stopped");

    Ok(())
}

async fn handle_console(command: ConsoleCommand, flow: &FlowHandle) {
    let result = match command {
        ConsoleCommand::EmergencyStop => flow.emergency_stop().await,
        ConsoleCommand::Start => flow.start_flow().await,
        ConsoleCommand::Stop => flow.stop_flow().await,
        ConsoleCommand::Status => Ok(flow.status()),
    };

    match result {
        Ok(status) => info!(
            state = %status.state,
            active = status.active,
            pending_timers = status.pending_timers,
            "flow status"
        ),
        Err(e) => warn!(error = %e, ?command, "console command failed"),
    }
}
