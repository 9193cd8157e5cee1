//! Protocol message definitions
//!
//! Defines the message types exchanged between the chat front-end and the
//! relay server. All messages are JSON-encoded and include version
//! information for compatibility.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::session::{CallerId, SessionState};

/// Current protocol version
/// Increment when making breaking changes to message format
pub const PROTOCOL_VERSION: u32 = 1;

/// Minimum supported protocol version
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Maximum target length
pub const MAX_TARGET_LENGTH: usize = 2048;

/// Maximum caller message length
pub const MAX_TEXT_LENGTH: usize = 4096;

/// Maximum tool name length
pub const MAX_TOOL_NAME_LENGTH: usize = 64;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Protocol version {0} not supported (min: {MIN_PROTOCOL_VERSION}, current: {PROTOCOL_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Message Envelope
// ============================================================================

/// Protocol envelope wrapping all client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEnvelope {
    /// Protocol version used by the client
    #[serde(default = "default_version")]
    pub version: u32,
    /// The actual message payload
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// Protocol envelope wrapping all server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    /// Protocol version used by the server
    pub version: u32,
    /// The actual message payload
    #[serde(flatten)]
    pub message: ServerMessage,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl ClientEnvelope {
    /// Create a new client envelope with the current protocol version
    pub fn new(message: ClientMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    /// Parse and validate a client envelope from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let envelope: Self = serde_json::from_str(json)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Validate the envelope and its contents
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.version < MIN_PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }
        self.message.validate()
    }

    /// Serialize the envelope to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerEnvelope {
    /// Create a new server envelope with the current protocol version
    pub fn new(message: ServerMessage) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }

    /// Serialize the envelope to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a server envelope from JSON (primarily for testing)
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from the chat front-end to the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Connection keepalive ping
    Ping {
        /// Sequence number for tracking round-trip time
        seq: u64,
    },

    /// Run a tool against a target for a caller
    StartSession {
        caller_id: CallerId,
        /// Tool name from the catalog
        tool: String,
        /// Target substituted into the tool's command template
        target: String,
    },

    /// A free-form message from a caller
    UserMessage { caller_id: CallerId, text: String },

    /// Stop the caller's running tool
    StopSession { caller_id: CallerId },

    /// List the tool catalog
    ListTools,

    /// Request the status of a caller's session
    GetSessionStatus { caller_id: CallerId },
}

impl ClientMessage {
    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::StartSession { tool, target, .. } => {
                if tool.is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "tool cannot be empty".to_string(),
                    ));
                }
                if tool.len() > MAX_TOOL_NAME_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "tool exceeds maximum length of {} characters",
                        MAX_TOOL_NAME_LENGTH
                    )));
                }
                if target.trim().is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "target cannot be empty".to_string(),
                    ));
                }
                if target.len() > MAX_TARGET_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "target exceeds maximum length of {} characters",
                        MAX_TARGET_LENGTH
                    )));
                }
                Ok(())
            }

            ClientMessage::UserMessage { text, .. } => {
                if text.len() > MAX_TEXT_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "text exceeds maximum length of {} bytes",
                        MAX_TEXT_LENGTH
                    )));
                }
                Ok(())
            }

            ClientMessage::Ping { .. }
            | ClientMessage::StopSession { .. }
            | ClientMessage::ListTools
            | ClientMessage::GetSessionStatus { .. } => Ok(()),
        }
    }

    /// Create a StartSession message
    pub fn start_session(
        caller_id: CallerId,
        tool: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        ClientMessage::StartSession {
            caller_id,
            tool: tool.into(),
            target: target.into(),
        }
    }

    /// Create a UserMessage message
    pub fn user_message(caller_id: CallerId, text: impl Into<String>) -> Self {
        ClientMessage::UserMessage {
            caller_id,
            text: text.into(),
        }
    }

    /// Create a StopSession message
    pub fn stop_session(caller_id: CallerId) -> Self {
        ClientMessage::StopSession { caller_id }
    }
}

// ============================================================================
// Server Messages
// ============================================================================

/// Messages sent from server to the chat front-end
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Welcome message sent on connection
    Welcome {
        /// Server protocol version
        version: u32,
        /// Server identifier/name
        #[serde(skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
    },

    /// Response to Ping
    Pong {
        /// Echo back the sequence number
        seq: u64,
    },

    /// Plain-text message to deliver to a caller
    Reply { caller_id: CallerId, text: String },

    /// The tool catalog
    ToolList { tools: Vec<ToolInfo> },

    /// Status of a caller's session, absent when nothing is running
    SessionStatus {
        caller_id: CallerId,
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<SessionInfo>,
    },

    /// Error response
    Error {
        /// Error message
        message: String,
        /// Error code for programmatic handling
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

/// Information about a catalog tool
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub label: String,
}

/// Information about an active session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    /// Session UUID
    pub session_id: Uuid,
    pub caller_id: CallerId,
    /// Tool name
    pub tool: String,
    pub target: String,
    /// Current state
    pub state: SessionState,
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Invalid message format
    InvalidMessage,
    /// Internal server error
    InternalError,
    /// Unsupported protocol version
    UnsupportedVersion,
}

impl ServerMessage {
    /// Create a Welcome message
    pub fn welcome() -> Self {
        ServerMessage::Welcome {
            version: PROTOCOL_VERSION,
            server_id: None,
        }
    }

    /// Create a Pong message
    pub fn pong(seq: u64) -> Self {
        ServerMessage::Pong { seq }
    }

    /// Create a Reply message
    pub fn reply(caller_id: CallerId, text: impl Into<String>) -> Self {
        ServerMessage::Reply {
            caller_id,
            text: text.into(),
        }
    }

    /// Create an Error message with code
    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code: Some(code),
        }
    }
}

// ============================================================================
// Conversion Traits
// ============================================================================

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::SerializationError(_) => ErrorCode::InvalidMessage,
            ProtocolError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            ProtocolError::ValidationError(_) => ErrorCode::InvalidMessage,
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}

// ============================================================================
// Tests
// ============================================================================
