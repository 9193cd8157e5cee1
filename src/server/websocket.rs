//! WebSocket server implementation
//!
//! Provides a WebSocket server that listens on a configurable port and
//! connects chat front-ends to the session core.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::handler::ConnectionHandler;
use super::protocol::{ClientEnvelope, ServerEnvelope, ServerMessage};
use crate::session::{Reply, SessionRegistry};

/// How long a closing connection may take to flush queued frames
const WRITER_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(bind: String, port: u16) -> Self {
        Self { bind, port }
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// WebSocket server for chat front-end connections
pub struct WebSocketServer {
    config: ServerConfig,
    registry: SessionRegistry,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    /// Create a new WebSocket server
    pub fn new(config: ServerConfig, registry: SessionRegistry) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            shutdown_tx,
        }
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the WebSocket server
    ///
    /// Listens for incoming connections and handles them concurrently.
    /// On shutdown every active session is stopped.
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let registry = self.registry.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, registry, shutdown_rx).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let session_count = self.registry.session_count().await;
        if session_count > 0 {
            info!("Stopping {} active sessions...", session_count);
        }
        self.registry.shutdown_all().await;

        Ok(())
    }
}

/// Handle a single WebSocket connection
///
/// Frames are written by a separate task fed by channels, so dispatching a
/// client message never waits on the socket.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: SessionRegistry,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (ws_sender, mut ws_receiver) = ws_stream.split();

    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let handler = ConnectionHandler::new(registry, reply_tx);

    out_tx.send(Message::Text(encode(ServerMessage::welcome())?))?;
    debug!("Queued welcome message for {}", peer_addr);

    let mut writer = tokio::spawn(write_frames(ws_sender, out_rx, reply_rx));

    let result: anyhow::Result<()> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received message from {}: {}", peer_addr, text);

                            let response = match ClientEnvelope::from_json(&text) {
                                Ok(envelope) => handler.handle(envelope.message).await,
                                Err(e) => {
                                    warn!("Invalid message from {}: {}", peer_addr, e);
                                    Some(ServerMessage::from(e))
                                }
                            };
                            if let Some(response) = response {
                                out_tx.send(Message::Text(encode(response)?))?;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            out_tx.send(Message::Pong(data))?;
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            info!("Client {} requested close", peer_addr);
                            break;
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error from {}: {}", peer_addr, e);
                            break;
                        }
                        None => {
                            info!("Connection closed by {}", peer_addr);
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection to {}", peer_addr);
                    break;
                }
            }
        }
        Ok(())
    }
    .await;

    handler.close().await;
    drop(out_tx);
    match tokio::time::timeout(WRITER_GRACE, &mut writer).await {
        Ok(Ok(Err(e))) => debug!("Writer for {} ended: {}", peer_addr, e),
        Ok(Err(e)) => warn!("Writer task for {} failed: {}", peer_addr, e),
        Ok(Ok(Ok(()))) => {}
        Err(_) => {
            warn!("Writer for {} did not flush in time, dropping", peer_addr);
            writer.abort();
        }
    }

    info!("Connection from {} closed", peer_addr);
    result
}

/// Write queued frames and caller replies until the connection closes
async fn write_frames(
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    mut reply_rx: mpsc::UnboundedReceiver<Reply>,
) -> anyhow::Result<()> {
    loop {
        let frame = tokio::select! {
            biased;

            frame = out_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            Some(reply) = reply_rx.recv() => {
                Message::Text(encode(ServerMessage::reply(reply.caller_id, reply.text))?)
            }
        };
        ws_sender.send(frame).await?;
    }

    ws_sender.close().await?;
    Ok(())
}

fn encode(message: ServerMessage) -> anyhow::Result<String> {
    Ok(ServerEnvelope::new(message).to_json()?)
}
