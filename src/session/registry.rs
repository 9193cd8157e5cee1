//! Session registry
//!
//! Maintains the table of active sessions keyed by caller. It is the only
//! structure shared across sessions and the single place where the
//! one-session-per-caller rule is enforced.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::prompt::PromptDetector;
use super::pump::OutputPump;
use super::reply::{self, CallerId, ReplySink};
use super::state::{Session, SessionError, StopOutcome};
use crate::config::BotConfig;
use crate::process::ToolProcess;
use crate::server::SessionInfo;

/// Errors that can occur during registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Caller {0} already has a running session")]
    DuplicateSession(CallerId),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Failed to start {tool}: {reason}")]
    ProcessSpawnFailure { tool: String, reason: String },

    #[error("No session for caller {0}")]
    SessionNotFound(CallerId),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Table of active sessions, at most one per caller
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone)]
pub struct SessionRegistry {
    /// Active sessions (thread-safe via RwLock)
    sessions: Arc<RwLock<HashMap<CallerId, Arc<Session>>>>,
    config: Arc<BotConfig>,
}

impl SessionRegistry {
    /// Create a new registry
    pub fn new(config: BotConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    /// Get the number of active sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Start a session running `tool_name` against `target`
    ///
    /// Fails without touching the table if the caller already has a
    /// session, the tool or target is invalid, or the process cannot be
    /// spawned. On success the "executing" acknowledgment is sent and the
    /// output pump is started.
    pub async fn create(
        &self,
        caller_id: CallerId,
        tool_name: &str,
        target: &str,
        sink: ReplySink,
    ) -> RegistryResult<Arc<Session>> {
        let tool = self
            .config
            .tool(tool_name)
            .ok_or_else(|| RegistryError::UnknownTool(tool_name.to_string()))?
            .clone();
        let command = tool
            .command_for(target)
            .map_err(|e| RegistryError::InvalidTarget(e.to_string()))?;
        let detector = PromptDetector::new(self.config.patterns_for(&tool));
        let target = target.trim();

        let (session, output, control_rx) = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&caller_id) {
                return Err(RegistryError::DuplicateSession(caller_id));
            }

            let (process, output) =
                ToolProcess::spawn(&self.config.shell, &command).map_err(|e| {
                    RegistryError::ProcessSpawnFailure {
                        tool: tool.label.clone(),
                        reason: e.to_string(),
                    }
                })?;

            let (session, control_rx) = Session::new(
                caller_id,
                tool,
                target,
                command,
                process,
                sink,
                self.config.max_message_chars,
            );
            let session = Arc::new(session);
            sessions.insert(caller_id, Arc::clone(&session));
            (session, output, control_rx)
        };

        info!(
            "Session {} started for caller {}: {}",
            session.id(),
            caller_id,
            session.command()
        );

        session.send_reply(&reply::executing(&session.tool().label, target));

        OutputPump::new(
            Arc::clone(&session),
            output,
            control_rx,
            detector,
            self.clone(),
        )
        .spawn();

        Ok(session)
    }

    /// Get the active session of a caller
    pub async fn get(&self, caller_id: CallerId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&caller_id).cloned()
    }

    /// Remove a caller's entry; no-op if absent
    pub async fn remove(&self, caller_id: CallerId) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(&caller_id)
    }

    /// Remove a caller's entry only if it is still the given session
    pub(crate) async fn remove_session(&self, caller_id: CallerId, session_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if sessions.get(&caller_id).map(|s| s.id()) == Some(session_id) {
            sessions.remove(&caller_id);
            debug!("Session {} removed from registry", session_id);
        }
    }

    /// Stop a caller's session
    ///
    /// Kills the process and removes the entry. The entry is removed even
    /// when the process had already exited.
    pub async fn stop(&self, caller_id: CallerId) -> RegistryResult<StopOutcome> {
        let session = self
            .get(caller_id)
            .await
            .ok_or(RegistryError::SessionNotFound(caller_id))?;

        let outcome = session.terminate().await?;
        self.remove_session(caller_id, session.id()).await;

        info!(
            "Stop request for caller {}: {:?} (session {})",
            caller_id,
            outcome,
            session.id()
        );
        Ok(outcome)
    }

    /// Status of a caller's session
    pub async fn info(&self, caller_id: CallerId) -> Option<SessionInfo> {
        let session = self.get(caller_id).await?;
        Some(session_info(&session).await)
    }

    /// List all active sessions
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(sessions.len());
        for session in &sessions {
            infos.push(session_info(session).await);
        }
        infos
    }

    /// Stop all sessions
    ///
    /// Used during server shutdown.
    pub async fn shutdown_all(&self) {
        info!("Stopping all sessions");
        let callers: Vec<CallerId> = self.sessions.read().await.keys().copied().collect();

        for caller_id in callers {
            if let Err(e) = self.stop(caller_id).await {
                warn!("Error stopping session of caller {}: {}", caller_id, e);
            }
        }
    }
}

async fn session_info(session: &Session) -> SessionInfo {
    SessionInfo {
        session_id: session.id(),
        caller_id: session.caller_id(),
        tool: session.tool().name.clone(),
        target: session.target().to_string(),
        state: session.state().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolSpec;
    use crate::session::{InputRouter, Reply, RouteOutcome, SessionState};
    use std::fs;
    use std::path::Path;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Config with stand-in tools: `<name>` runs `sh <dir>/<name>.sh <target>`
    fn config_with_scripts(dir: &Path, scripts: &[(&str, &str, &str)]) -> BotConfig {
        let mut config = BotConfig {
            tools: Vec::new(),
            ..BotConfig::default()
        };
        for (name, label, body) in scripts {
            let path = dir.join(format!("{}.sh", name));
            fs::write(&path, body).unwrap();
            config.tools.push(ToolSpec::new(
                *name,
                *label,
                format!("sh {} {{target}}", path.display()),
            ));
        }
        config.tools.push(ToolSpec::new("sleeper", "Sleeper", "sleep {target}"));
        config
    }

    async fn next_reply(rx: &mut mpsc::UnboundedReceiver<Reply>) -> String {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for reply")
            .expect("reply channel closed")
            .text
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Reply>) {
        let next = timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(!matches!(next, Ok(Some(_))), "unexpected reply: {:?}", next);
    }

    #[tokio::test]
    async fn test_registry_new() {
        let registry = SessionRegistry::new(BotConfig::default());
        assert_eq!(registry.session_count().await, 0);
        assert!(registry.get(1).await.is_none());
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new(BotConfig::default());
        assert!(registry.remove(42).await.is_none());
        assert!(registry.remove(42).await.is_none());
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = SessionRegistry::new(BotConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = registry.create(1, "nmap", "example.com", tx).await;
        assert!(matches!(result, Err(RegistryError::UnknownTool(_))));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_empty_target() {
        let registry = SessionRegistry::new(BotConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = registry.create(1, "nikto", "  ", tx).await;
        assert!(matches!(result, Err(RegistryError::InvalidTarget(_))));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_stores_nothing() {
        let config = BotConfig {
            shell: "/nonexistent/shell".to_string(),
            ..BotConfig::default()
        };
        let registry = SessionRegistry::new(config);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = registry.create(1, "nikto", "http://example.com", tx).await;
        assert!(matches!(
            result,
            Err(RegistryError::ProcessSpawnFailure { .. })
        ));
        assert_eq!(registry.session_count().await, 0);
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(config_with_scripts(dir.path(), &[]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = registry.create(1, "sleeper", "30", tx.clone()).await.unwrap();
        assert_eq!(next_reply(&mut rx).await, "Executing Sleeper on 30...");

        let second = registry.create(1, "sleeper", "10", tx).await;
        assert!(matches!(second, Err(RegistryError::DuplicateSession(1))));

        let current = registry.get(1).await.unwrap();
        assert_eq!(current.id(), first.id());
        assert_eq!(current.target(), "30");
        assert_eq!(first.state().await, SessionState::Running);
        assert_eq!(registry.session_count().await, 1);

        registry.stop(1).await.unwrap();
    }

    #[tokio::test]
    async fn test_output_forwarded_then_reported() {
        let dir = tempfile::tempdir().unwrap();
        let script = "echo line one\necho line two\necho oops 1>&2\nprintf 'tail'\n";
        let registry =
            SessionRegistry::new(config_with_scripts(dir.path(), &[("lister", "Lister", script)]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.create(5, "lister", "x", tx).await.unwrap();

        assert_eq!(next_reply(&mut rx).await, "Executing Lister on x...");
        assert_eq!(next_reply(&mut rx).await, "line one");
        assert_eq!(next_reply(&mut rx).await, "line two");
        assert_eq!(next_reply(&mut rx).await, "Lister Output:\ntail");
        assert!(registry.get(5).await.is_none());
        assert_eq!(next_reply(&mut rx).await, "Lister Errors:\noops");
    }

    #[tokio::test]
    async fn test_empty_stderr_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let registry =
            SessionRegistry::new(config_with_scripts(dir.path(), &[("quiet", "Quiet", "true\n")]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.create(5, "quiet", "x", tx).await.unwrap();

        assert_eq!(next_reply(&mut rx).await, "Executing Quiet on x...");
        assert_eq!(
            next_reply(&mut rx).await,
            "Quiet Output:\n(no further output)"
        );
        assert!(registry.get(5).await.is_none());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_long_output_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with_scripts(
            dir.path(),
            &[("loud", "Loud", "printf '%05000d' 0\n")],
        );
        config.max_message_chars = 4000;
        let registry = SessionRegistry::new(config);
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.create(5, "loud", "x", tx).await.unwrap();
        next_reply(&mut rx).await;

        let report = next_reply(&mut rx).await;
        assert!(report.starts_with("Loud Output:\n000"));
        assert_eq!(report.chars().count(), 4000);
    }

    #[tokio::test]
    async fn test_long_forwarded_line_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with_scripts(
            dir.path(),
            &[("wide", "Wide", "printf '%05000d\\n' 0\nsleep 1\n")],
        );
        config.max_message_chars = 4000;
        let registry = SessionRegistry::new(config);
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry.create(5, "wide", "x", tx).await.unwrap();
        next_reply(&mut rx).await;

        let line = next_reply(&mut rx).await;
        assert_eq!(line.chars().count(), 4000);
        assert!(line.chars().all(|c| c == '0'));
        assert_eq!(
            next_reply(&mut rx).await,
            "Wide Output:\n(no further output)"
        );
    }

    #[tokio::test]
    async fn test_target_is_passed_as_one_argument() {
        let dir = tempfile::tempdir().unwrap();
        let script = "echo \"arg:$1\"\necho \"count:$#\"\n";
        let registry =
            SessionRegistry::new(config_with_scripts(dir.path(), &[("echoer", "Echoer", script)]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        registry
            .create(5, "echoer", "a b; echo injected", tx)
            .await
            .unwrap();

        next_reply(&mut rx).await;
        assert_eq!(next_reply(&mut rx).await, "arg:a b; echo injected");
        assert_eq!(next_reply(&mut rx).await, "count:1");
        assert_eq!(
            next_reply(&mut rx).await,
            "Echoer Output:\n(no further output)"
        );
    }

    #[tokio::test]
    async fn test_prompt_suspends_forwarding() {
        let dir = tempfile::tempdir().unwrap();
        let script = "echo before\necho 'Continue? [y/N]'\necho hidden\nread answer\necho \"answer=$answer\"\n";
        let registry =
            SessionRegistry::new(config_with_scripts(dir.path(), &[("asker", "Asker", script)]));
        let router = InputRouter::new(registry.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let session = registry.create(3, "asker", "x", tx).await.unwrap();

        assert_eq!(next_reply(&mut rx).await, "Executing Asker on x...");
        assert_eq!(next_reply(&mut rx).await, "before");
        assert_eq!(
            next_reply(&mut rx).await,
            "Asker is waiting for confirmation. Reply Y or N."
        );
        assert_eq!(session.state().await, SessionState::AwaitingConfirmation);

        // "hidden" is already in the pipe but must not surface while waiting
        assert_quiet(&mut rx).await;

        assert_eq!(router.route(3, " y ").await, RouteOutcome::Accepted(crate::session::Answer::Yes));
        assert_eq!(next_reply(&mut rx).await, "hidden");
        assert_eq!(next_reply(&mut rx).await, "answer=Y");
        assert_eq!(
            next_reply(&mut rx).await,
            "Asker Output:\n(no further output)"
        );
        assert_eq!(session.state().await, SessionState::Completed);
        assert!(registry.get(3).await.is_none());
    }

    #[tokio::test]
    async fn test_stop_running_session() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(config_with_scripts(dir.path(), &[]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let session = registry.create(9, "sleeper", "30", tx).await.unwrap();
        next_reply(&mut rx).await;

        assert_eq!(registry.stop(9).await.unwrap(), StopOutcome::Stopped);
        assert_eq!(session.state().await, SessionState::Terminated);
        assert!(!session.has_process().await);
        assert!(registry.get(9).await.is_none());

        // Stopped sessions produce no completion report
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_stop_awaiting_session() {
        let dir = tempfile::tempdir().unwrap();
        let script = "printf 'Proceed? [Y/n] '\nread answer\n";
        let registry =
            SessionRegistry::new(config_with_scripts(dir.path(), &[("asker", "Asker", script)]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let session = registry.create(9, "asker", "x", tx).await.unwrap();
        next_reply(&mut rx).await;
        next_reply(&mut rx).await;
        assert_eq!(session.state().await, SessionState::AwaitingConfirmation);

        assert_eq!(registry.stop(9).await.unwrap(), StopOutcome::Stopped);
        assert_eq!(session.state().await, SessionState::Terminated);
        assert!(registry.get(9).await.is_none());
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_stop_without_session() {
        let registry = SessionRegistry::new(BotConfig::default());
        let result = registry.stop(77).await;
        assert!(matches!(result, Err(RegistryError::SessionNotFound(77))));
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_caller_can_start_again_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(config_with_scripts(dir.path(), &[]));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = registry.create(9, "sleeper", "30", tx.clone()).await.unwrap();
        next_reply(&mut rx).await;
        registry.stop(9).await.unwrap();

        let second = registry.create(9, "sleeper", "30", tx).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(registry.get(9).await.unwrap().id(), second.id());

        // A late cleanup for the old session must not evict the new one
        registry.remove_session(9, first.id()).await;
        assert!(registry.get(9).await.is_some());

        registry.stop(9).await.unwrap();
    }

    #[tokio::test]
    async fn test_sessions_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let script = "printf 'Proceed? [Y/n] '\nread answer\necho \"done $answer\"\n";
        let registry =
            SessionRegistry::new(config_with_scripts(dir.path(), &[("asker", "Asker", script)]));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        registry.create(1, "asker", "a", tx_a).await.unwrap();
        registry.create(2, "sleeper", "30", tx_b).await.unwrap();
        assert_eq!(registry.session_count().await, 2);

        next_reply(&mut rx_a).await;
        next_reply(&mut rx_a).await;
        next_reply(&mut rx_b).await;

        // Caller 1 waiting on a prompt does not hold up caller 2
        assert_eq!(registry.stop(2).await.unwrap(), StopOutcome::Stopped);

        let router = InputRouter::new(registry.clone());
        assert_eq!(router.route(1, "N").await, RouteOutcome::Accepted(crate::session::Answer::No));
        assert_eq!(next_reply(&mut rx_a).await, "done N");
        assert_eq!(next_reply(&mut rx_a).await, "Asker Output:\n(no further output)");
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(config_with_scripts(dir.path(), &[]));
        let (tx, _rx) = mpsc::unbounded_channel();

        registry.create(1, "sleeper", "30", tx.clone()).await.unwrap();
        registry.create(2, "sleeper", "30", tx).await.unwrap();
        assert_eq!(registry.list().await.len(), 2);

        registry.shutdown_all().await;
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_session_info() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(config_with_scripts(dir.path(), &[]));
        let (tx, _rx) = mpsc::unbounded_channel();

        let session = registry.create(4, "sleeper", "30", tx).await.unwrap();
        let info = registry.info(4).await.unwrap();
        assert_eq!(info.session_id, session.id());
        assert_eq!(info.caller_id, 4);
        assert_eq!(info.tool, "sleeper");
        assert_eq!(info.target, "30");
        assert_eq!(info.state, SessionState::Running);

        registry.stop(4).await.unwrap();
        assert!(registry.info(4).await.is_none());
    }
}
