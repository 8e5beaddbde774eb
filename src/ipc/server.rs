//! Unix domain socket server for IPC
//!
//! Relays speech input and host commands into the flow controller and pushes
//! flow events to subscribed clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::unix::OwnedReadHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::FlowEvent;
use crate::state::{FlowError, FlowHandle};

use super::protocol::{
    encode_frame, read_frame, write_frame, DaemonStatus, FrameError, Notification, Request,
    Response,
};

/// Outgoing frames queued per client before it is considered stuck
const CLIENT_QUEUE: usize = 64;

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: UnixListener,
    context: Arc<ServerContext>,
    shutdown_tx: broadcast::Sender<()>,
}

/// State shared with every client handler
struct ServerContext {
    flow: FlowHandle,
    event_tx: broadcast::Sender<FlowEvent>,
    start_time: Instant,
}

impl ServerContext {
    fn status(&self) -> DaemonStatus {
        DaemonStatus::new(self.flow.status(), self.start_time.elapsed().as_secs())
    }
}

impl Server {
    /// Create a new IPC server
    pub fn new(
        socket_path: &Path,
        flow: FlowHandle,
        event_tx: broadcast::Sender<FlowEvent>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener,
            context: Arc::new(ServerContext {
                flow,
                event_tx,
                start_time: Instant::now(),
            }),
            shutdown_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let context = Arc::clone(&self.context);
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = Self::handle_client(stream, context) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Handle a single client connection
    ///
    /// Reads stay on this task; all writes go through one writer task so
    /// responses and notifications never interleave mid-frame.
    async fn handle_client(stream: UnixStream, context: Arc<ServerContext>) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(CLIENT_QUEUE);

        let writer_task = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = writer.write_all(&frame).await {
                    debug!(?e, "client write failed");
                    break;
                }
            }
        });

        let result = Self::read_requests(&mut reader, &context, &out_tx).await;
        drop(out_tx);
        let _ = writer_task.await;
        result
    }

    async fn read_requests(
        reader: &mut OwnedReadHalf,
        context: &ServerContext,
        out_tx: &mpsc::Sender<Vec<u8>>,
    ) -> Result<()> {
        let mut forwarder: Option<ForwarderGuard> = None;

        loop {
            let body = match read_frame(reader).await {
                Ok(Some(body)) => body,
                Ok(None) => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(FrameError::TooLarge(len)) => {
                    warn!(len, "message too large, disconnecting");
                    return Ok(());
                }
                Err(FrameError::Io(e)) => return Err(e.into()),
            };

            let response = match serde_json::from_slice::<Request>(&body) {
                Ok(Request::Subscribe) => {
                    if forwarder.is_none() {
                        forwarder = Some(ForwarderGuard::spawn(
                            context.event_tx.subscribe(),
                            out_tx.clone(),
                        ));
                        debug!("client subscribed to notifications");
                    }
                    Response::Subscribed
                }
                Ok(request) => {
                    debug!(?request, "received request");
                    Self::process_request(request, context).await
                }
                Err(e) => Response::Error {
                    code: "bad_request".to_string(),
                    message: e.to_string(),
                },
            };

            let frame = encode_frame(&response)?;
            if out_tx.send(frame).await.is_err() {
                return Ok(());
            }
        }
    }

    /// Process a request and return a response
    async fn process_request(request: Request, context: &ServerContext) -> Response {
        let result = match request {
            Request::Ping => return Response::Pong,
            Request::GetStatus => return Response::Status(context.status()),
            Request::Subscribe => return Response::Subscribed,
            Request::StartFlow => context.flow.start_flow().await,
            Request::StopFlow => context.flow.stop_flow().await,
            Request::EmergencyStop => context.flow.emergency_stop().await,
            Request::SpeechStart => context.flow.speech_start().await,
            Request::SpeechEnd { transcript } => context.flow.speech_end(transcript).await,
            Request::ResponseComplete => context.flow.response_complete().await,
            Request::UpdateConfig { config } => context.flow.update_config(config).await,
        };

        match result {
            Ok(status) => Response::Ack {
                state: status.state,
                active: status.active,
            },
            Err(e) => {
                let code = match e {
                    FlowError::ControllerStopped => "controller_stopped",
                    FlowError::Config(_) => "invalid_config",
                };
                Response::Error {
                    code: code.to_string(),
                    message: e.to_string(),
                }
            }
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

/// Task forwarding flow events to one subscribed client
struct ForwarderGuard(JoinHandle<()>);

impl ForwarderGuard {
    fn spawn(mut events: broadcast::Receiver<FlowEvent>, out_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "subscriber lagged behind flow events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let frame = match encode_frame(&Notification::Event { event }) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(?e, "failed to encode notification");
                        continue;
                    }
                };
                if out_tx.send(frame).await.is_err() {
                    break;
                }
            }
        }))
    }
}

impl Drop for ForwarderGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
