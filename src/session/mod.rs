//! Tool session management module
//!
//! Runs one interactive tool per caller, streams its output back, pauses
//! at yes/no prompts until the caller answers, and supports cancellation.

mod prompt;
mod pump;
#[allow(dead_code)]
mod registry;
pub mod reply;
mod router;
#[allow(dead_code)]
mod state;

#[allow(unused_imports)]
pub use prompt::PromptDetector;
#[allow(unused_imports)]
pub use registry::{RegistryError, RegistryResult, SessionRegistry};
pub use reply::{CallerId, Reply, ReplySink};
#[allow(unused_imports)]
pub use router::{parse_confirmation, InputRouter, RouteOutcome};
#[allow(unused_imports)]
pub use state::{Answer, Session, SessionError, SessionResult, SessionState, StopOutcome, Submission};
