//! Connection handler
//!
//! Dispatches client messages for one connection to the session core and
//! turns every outcome into exactly one reply to the caller.

use std::collections::HashSet;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, ServerMessage, ToolInfo};
use crate::session::reply;
use crate::session::{
    CallerId, InputRouter, RegistryError, Reply, ReplySink, RouteOutcome, SessionRegistry,
    StopOutcome,
};

/// Handles the messages of a single connection
///
/// Replies produced by sessions started on this connection flow through
/// the same sink as the handler's own replies, so a caller sees them in
/// one ordered stream.
pub struct ConnectionHandler {
    registry: SessionRegistry,
    router: InputRouter,
    reply_tx: ReplySink,
    /// Callers that started sessions on this connection
    callers: Mutex<HashSet<CallerId>>,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(registry: SessionRegistry, reply_tx: ReplySink) -> Self {
        let router = InputRouter::new(registry.clone());
        Self {
            registry,
            router,
            reply_tx,
            callers: Mutex::new(HashSet::new()),
        }
    }

    /// Handle a client message
    ///
    /// Returns an immediate response for request/response messages; caller
    /// replies are sent through the reply sink instead.
    pub async fn handle(&self, message: ClientMessage) -> Option<ServerMessage> {
        match message {
            ClientMessage::Ping { seq } => Some(ServerMessage::pong(seq)),

            ClientMessage::StartSession {
                caller_id,
                tool,
                target,
            } => {
                self.start_session(caller_id, &tool, &target).await;
                None
            }

            ClientMessage::UserMessage { caller_id, text } => {
                self.user_message(caller_id, &text).await;
                None
            }

            ClientMessage::StopSession { caller_id } => {
                self.stop_request(caller_id).await;
                None
            }

            ClientMessage::ListTools => Some(ServerMessage::ToolList {
                tools: self
                    .registry
                    .config()
                    .tools
                    .iter()
                    .map(|t| ToolInfo {
                        name: t.name.clone(),
                        label: t.label.clone(),
                    })
                    .collect(),
            }),

            ClientMessage::GetSessionStatus { caller_id } => Some(ServerMessage::SessionStatus {
                caller_id,
                session: self.registry.info(caller_id).await,
            }),
        }
    }

    async fn start_session(&self, caller_id: CallerId, tool: &str, target: &str) {
        debug!("StartSession request: caller={}, tool={}", caller_id, tool);

        match self
            .registry
            .create(caller_id, tool, target, self.reply_tx.clone())
            .await
        {
            Ok(_) => {
                self.callers.lock().await.insert(caller_id);
            }
            Err(e) => {
                info!("Could not start {} for caller {}: {}", tool, caller_id, e);
                self.reply(caller_id, &error_text(&e)).await;
            }
        }
    }

    async fn user_message(&self, caller_id: CallerId, text: &str) {
        match self.router.route(caller_id, text).await {
            RouteOutcome::Accepted(answer) => {
                debug!("Caller {} answered {:?}", caller_id, answer);
            }
            // The session already sent the re-prompt
            RouteOutcome::InvalidInput => {}
            RouteOutcome::ProcessFinished => {
                self.reply(caller_id, reply::ANSWER_TOO_LATE).await;
            }
            RouteOutcome::NotAConfirmation => {
                self.reply(caller_id, reply::NOTHING_AWAITING).await;
            }
        }
    }

    async fn stop_request(&self, caller_id: CallerId) {
        let text = match self.registry.stop(caller_id).await {
            Ok(StopOutcome::Stopped) => reply::STOPPED.to_string(),
            Ok(StopOutcome::AlreadyFinished) => reply::ALREADY_FINISHED.to_string(),
            Err(e) => error_text(&e),
        };
        self.callers.lock().await.remove(&caller_id);
        self.reply(caller_id, &text).await;
    }

    async fn reply(&self, caller_id: CallerId, text: &str) {
        let max_chars = self.registry.config().max_message_chars;
        let reply = Reply::new(caller_id, text, max_chars);
        if self.reply_tx.send(reply).is_err() {
            debug!("Reply channel closed for caller {}", caller_id);
        }
    }

    /// Stop the sessions started on this connection
    ///
    /// Called when the connection closes, since their output has nowhere
    /// left to go.
    pub async fn close(&self) {
        let callers: Vec<CallerId> = self.callers.lock().await.drain().collect();
        for caller_id in callers {
            match self.registry.stop(caller_id).await {
                Ok(outcome) => debug!("Closed session of caller {}: {:?}", caller_id, outcome),
                Err(RegistryError::SessionNotFound(_)) => {}
                Err(e) => warn!("Error stopping session of caller {}: {}", caller_id, e),
            }
        }
    }
}

/// Human-readable text for a registry error
fn error_text(err: &RegistryError) -> String {
    match err {
        RegistryError::DuplicateSession(_) => {
            "A command is already running. Stop it before starting another.".to_string()
        }
        RegistryError::UnknownTool(tool) => {
            format!("Unknown tool '{}'. Select a tool first.", tool)
        }
        RegistryError::InvalidTarget(reason) => format!("Invalid target: {}.", reason),
        RegistryError::ProcessSpawnFailure { tool, reason } => {
            format!("Failed to start {}: {}", tool, reason)
        }
        RegistryError::SessionNotFound(_) => reply::NO_RUNNING_COMMAND.to_string(),
        RegistryError::Session(e) => format!("Command error: {}", e),
    }
}
