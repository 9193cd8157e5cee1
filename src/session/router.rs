//! Input routing
//!
//! Decides whether a caller's message answers a pending confirmation.

use tracing::{debug, warn};

use super::registry::SessionRegistry;
use super::reply::CallerId;
use super::state::{Answer, SessionError, Submission};

/// What became of a caller message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// No session of this caller is waiting for an answer
    NotAConfirmation,
    /// The answer was written to the tool
    Accepted(Answer),
    /// The session is waiting but the text was not Y or N
    InvalidInput,
    /// The tool exited before the answer could be written
    ProcessFinished,
}

/// Parse a confirmation answer: `y` or `n` after trimming, any case
pub fn parse_confirmation(text: &str) -> Option<Answer> {
    match text.trim().to_lowercase().as_str() {
        "y" => Some(Answer::Yes),
        "n" => Some(Answer::No),
        _ => None,
    }
}

/// Routes caller messages to awaiting sessions
#[derive(Clone)]
pub struct InputRouter {
    registry: SessionRegistry,
}

impl InputRouter {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// Route a caller message
    pub async fn route(&self, caller_id: CallerId, text: &str) -> RouteOutcome {
        let Some(session) = self.registry.get(caller_id).await else {
            return RouteOutcome::NotAConfirmation;
        };

        match session.submit(parse_confirmation(text)).await {
            Ok(Submission::NotAwaiting) => RouteOutcome::NotAConfirmation,
            Ok(Submission::Accepted(answer)) => RouteOutcome::Accepted(answer),
            Ok(Submission::Rejected) => {
                debug!("Rejected confirmation input from caller {}", caller_id);
                RouteOutcome::InvalidInput
            }
            Err(SessionError::StdinWriteFailure) => RouteOutcome::ProcessFinished,
            Err(e) => {
                warn!("Failed to deliver answer for caller {}: {}", caller_id, e);
                RouteOutcome::ProcessFinished
            }
        }
    }
}
