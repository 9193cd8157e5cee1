//! Replies sent back to callers
//!
//! Every message leaving the session core is plain text addressed to a
//! caller and truncated to the transport's character limit.

use tokio::sync::mpsc;

/// Opaque caller identity (a chat id)
pub type CallerId = i64;

/// Sink for outbound replies
///
/// Unbounded so a session never waits on its caller's connection.
pub type ReplySink = mpsc::UnboundedSender<Reply>;

/// A plain-text message for one caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub caller_id: CallerId,
    pub text: String,
}

impl Reply {
    /// Create a reply, truncating `text` to `max_chars` characters
    pub fn new(caller_id: CallerId, text: &str, max_chars: usize) -> Self {
        Self {
            caller_id,
            text: truncate_chars(text, max_chars),
        }
    }
}

/// Truncate to at most `max_chars` characters (not bytes)
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

pub const INVALID_CONFIRMATION: &str = "Invalid input. Please reply Y or N.";
pub const STOPPED: &str = "Command stopped.";
pub const ALREADY_FINISHED: &str = "Command already finished.";
pub const NO_RUNNING_COMMAND: &str = "No running command.";
pub const NOTHING_AWAITING: &str = "Nothing is waiting for your answer.";
pub const ANSWER_TOO_LATE: &str =
    "The command finished before your answer could be delivered.";

pub fn executing(label: &str, target: &str) -> String {
    format!("Executing {} on {}...", label, target)
}

pub fn awaiting_confirmation(label: &str) -> String {
    format!("{} is waiting for confirmation. Reply Y or N.", label)
}

pub fn output_report(label: &str, stdout: &str) -> String {
    let body = stdout.trim_end();
    if body.is_empty() {
        format!("{} Output:\n(no further output)", label)
    } else {
        format!("{} Output:\n{}", label, body)
    }
}

pub fn errors_report(label: &str, stderr: &str) -> String {
    format!("{} Errors:\n{}", label, stderr.trim_end())
}
