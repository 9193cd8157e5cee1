//! A single tool session
//!
//! Owns one running tool process for one caller. The process handle lives
//! inside the live variants of the status enum, so a terminal session can
//! never hold a process and a live one always does. Every transition is
//! taken under the per-session lock.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::reply::{self, CallerId, Reply, ReplySink};
use crate::config::ToolSpec;
use crate::process::{KillOutcome, ProcessError, ToolProcess};

/// Errors that can occur during session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Process exited before the answer could be written")]
    StdinWriteFailure,

    #[error("Process error: {0}")]
    Process(#[from] ProcessError),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Output is being forwarded
    Running,
    /// The tool is blocked on a yes/no prompt
    AwaitingConfirmation,
    /// The tool exited on its own
    Completed,
    /// The tool was stopped by the caller
    Terminated,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Terminated)
    }
}

/// A confirmation answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
}

impl Answer {
    /// The text written to the tool's stdin
    pub fn as_input(self) -> &'static str {
        match self {
            Answer::Yes => "Y",
            Answer::No => "N",
        }
    }
}

/// Result of submitting caller input to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The session is not waiting for an answer
    NotAwaiting,
    /// The answer was written and the session resumed
    Accepted(Answer),
    /// The input was not a valid answer; the session keeps waiting
    Rejected,
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was killed
    Stopped,
    /// The process had already exited
    AlreadyFinished,
}

/// Signals from the session to its output pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpSignal {
    /// A confirmation was delivered; continue forwarding
    Resume,
    /// The process is gone; collect what is left into the final report
    Drain,
    /// The session was terminated; exit without reporting
    Stop,
}

enum SessionStatus {
    Running(ToolProcess),
    AwaitingConfirmation(ToolProcess),
    Completed,
    Terminated,
}

impl SessionStatus {
    fn state(&self) -> SessionState {
        match self {
            SessionStatus::Running(_) => SessionState::Running,
            SessionStatus::AwaitingConfirmation(_) => SessionState::AwaitingConfirmation,
            SessionStatus::Completed => SessionState::Completed,
            SessionStatus::Terminated => SessionState::Terminated,
        }
    }

    fn process_mut(&mut self) -> Option<&mut ToolProcess> {
        match self {
            SessionStatus::Running(p) | SessionStatus::AwaitingConfirmation(p) => Some(p),
            _ => None,
        }
    }

    /// Move the process into another live state; terminal states are kept
    fn relive(&mut self, next: fn(ToolProcess) -> SessionStatus) {
        let previous = std::mem::replace(self, SessionStatus::Completed);
        *self = match previous {
            SessionStatus::Running(p) | SessionStatus::AwaitingConfirmation(p) => next(p),
            terminal => terminal,
        };
    }

    /// Enter a terminal state and release the process
    fn finish(&mut self, terminal: SessionStatus) -> Option<ToolProcess> {
        match std::mem::replace(self, terminal) {
            SessionStatus::Running(p) | SessionStatus::AwaitingConfirmation(p) => Some(p),
            previous => {
                *self = previous;
                None
            }
        }
    }
}

/// One interactive run of a tool for one caller
pub struct Session {
    id: Uuid,
    caller_id: CallerId,
    tool: ToolSpec,
    target: String,
    command: String,
    status: Mutex<SessionStatus>,
    control_tx: mpsc::UnboundedSender<PumpSignal>,
    sink: ReplySink,
    max_message_chars: usize,
}

impl Session {
    /// Wrap a freshly spawned process in a running session
    ///
    /// Returns the receiving end of the pump control channel.
    pub(crate) fn new(
        caller_id: CallerId,
        tool: ToolSpec,
        target: impl Into<String>,
        command: impl Into<String>,
        process: ToolProcess,
        sink: ReplySink,
        max_message_chars: usize,
    ) -> (Self, mpsc::UnboundedReceiver<PumpSignal>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let session = Self {
            id: Uuid::new_v4(),
            caller_id,
            tool,
            target: target.into(),
            command: command.into(),
            status: Mutex::new(SessionStatus::Running(process)),
            control_tx,
            sink,
            max_message_chars,
        };
        (session, control_rx)
    }

    /// Get the session ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn caller_id(&self) -> CallerId {
        self.caller_id
    }

    pub fn tool(&self) -> &ToolSpec {
        &self.tool
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// The assembled command line
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Get the current state
    pub async fn state(&self) -> SessionState {
        self.status.lock().await.state()
    }

    /// Check whether the session still owns a process
    pub async fn has_process(&self) -> bool {
        self.status.lock().await.process_mut().is_some()
    }

    /// Send a message to the caller
    pub fn send_reply(&self, text: &str) {
        let reply = Reply::new(self.caller_id, text, self.max_message_chars);
        if self.sink.send(reply).is_err() {
            debug!("Reply sink closed for session {}", self.id);
        }
    }

    fn signal(&self, signal: PumpSignal) {
        let _ = self.control_tx.send(signal);
    }

    /// Forward an output line, only while running
    pub(crate) async fn forward_line(&self, line: &str) {
        let status = self.status.lock().await;
        if matches!(*status, SessionStatus::Running(_)) {
            self.send_reply(line);
        }
    }

    /// Running → AwaitingConfirmation
    ///
    /// The notice is queued before the lock is released so no answer can be
    /// accepted ahead of it. Queuing never waits on the caller. Returns false if the session is not running.
    pub(crate) async fn await_confirmation(&self) -> bool {
        let mut status = self.status.lock().await;
        if !matches!(*status, SessionStatus::Running(_)) {
            return false;
        }
        status.relive(SessionStatus::AwaitingConfirmation);
        debug!("Session {} awaiting confirmation", self.id);
        self.send_reply(&reply::awaiting_confirmation(&self.tool.label));
        true
    }

    /// Submit caller input; `None` means the input was not a valid answer
    pub async fn submit(&self, answer: Option<Answer>) -> SessionResult<Submission> {
        let mut status = self.status.lock().await;
        let SessionStatus::AwaitingConfirmation(process) = &mut *status else {
            return Ok(Submission::NotAwaiting);
        };

        let Some(answer) = answer else {
            self.send_reply(reply::INVALID_CONFIRMATION);
            return Ok(Submission::Rejected);
        };

        let written = process.write_line(answer.as_input()).await;
        status.relive(SessionStatus::Running);

        match written {
            Ok(()) => {
                debug!("Session {} answered {:?}", self.id, answer);
                self.signal(PumpSignal::Resume);
                Ok(Submission::Accepted(answer))
            }
            Err(ProcessError::ProcessExited) => {
                info!("Session {} exited before the answer was written", self.id);
                self.signal(PumpSignal::Drain);
                Err(SessionError::StdinWriteFailure)
            }
            Err(e) => {
                self.signal(PumpSignal::Drain);
                Err(SessionError::Process(e))
            }
        }
    }

    /// Live → Completed, handing the process to the caller for reaping
    ///
    /// Returns `None` if the session already reached a terminal state.
    pub(crate) async fn complete(&self) -> Option<ToolProcess> {
        self.status.lock().await.finish(SessionStatus::Completed)
    }

    /// Kill the process and move to Terminated
    ///
    /// If the process already exited on its own the session is left for
    /// the pump to complete, and `AlreadyFinished` is returned. A pump
    /// parked at a prompt is told to drain, since it is not reading.
    pub async fn terminate(&self) -> SessionResult<StopOutcome> {
        let mut status = self.status.lock().await;
        let Some(process) = status.process_mut() else {
            return Ok(StopOutcome::AlreadyFinished);
        };

        if process.kill().await? == KillOutcome::AlreadyExited {
            if matches!(*status, SessionStatus::AwaitingConfirmation(_)) {
                status.relive(SessionStatus::Running);
                self.signal(PumpSignal::Drain);
            }
            return Ok(StopOutcome::AlreadyFinished);
        }

        status.finish(SessionStatus::Terminated);
        self.signal(PumpSignal::Stop);
        info!("Session {} terminated", self.id);
        Ok(StopOutcome::Stopped)
    }
}
