//! Output pump
//!
//! Moves a session's stdout to the caller line by line, pausing at
//! prompts. The loop is driven by the stdout end-of-stream signal and by
//! control signals from the session; it never polls process liveness.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::prompt::PromptDetector;
use super::registry::SessionRegistry;
use super::reply;
use super::state::{PumpSignal, Session};
use crate::process::ProcessOutput;

/// How long a tool may linger after closing its output
const EXIT_GRACE: Duration = Duration::from_secs(10);

/// How the pump left its forwarding loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpExit {
    /// Stdout reached end of stream
    EndOfStream,
    /// The process exited while an answer was pending
    Drain,
    /// The session was stopped
    Stopped,
}

/// Drives one session's output into its reply sink
pub(crate) struct OutputPump {
    session: Arc<Session>,
    output: ProcessOutput,
    control_rx: mpsc::UnboundedReceiver<PumpSignal>,
    detector: PromptDetector,
    registry: SessionRegistry,
}

impl OutputPump {
    pub(crate) fn new(
        session: Arc<Session>,
        output: ProcessOutput,
        control_rx: mpsc::UnboundedReceiver<PumpSignal>,
        detector: PromptDetector,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            session,
            output,
            control_rx,
            detector,
            registry,
        }
    }

    /// Run the pump as an independent task
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let OutputPump {
            session,
            mut output,
            mut control_rx,
            detector,
            registry,
        } = self;

        let exit = loop {
            let next = tokio::select! {
                biased;

                signal = control_rx.recv() => match signal {
                    Some(PumpSignal::Resume) => continue,
                    Some(PumpSignal::Drain) => break PumpExit::Drain,
                    Some(PumpSignal::Stop) | None => break PumpExit::Stopped,
                },
                line = output.stdout.next_line(|l: &str| detector.is_prompt(l)) => line,
            };

            match next {
                Ok(Some(line)) if detector.is_prompt(&line) => {
                    if !session.await_confirmation().await {
                        break PumpExit::Stopped;
                    }
                    match wait_for_answer(&mut control_rx).await {
                        PumpSignal::Resume => continue,
                        PumpSignal::Drain => break PumpExit::Drain,
                        PumpSignal::Stop => break PumpExit::Stopped,
                    }
                }
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        session.forward_line(&line).await;
                    }
                }
                Ok(None) => break PumpExit::EndOfStream,
                Err(e) => {
                    warn!("Session {} output read failed: {}", session.id(), e);
                    break PumpExit::EndOfStream;
                }
            }
        };

        if exit == PumpExit::Stopped {
            debug!("Pump for session {} stopped", session.id());
            return;
        }

        finish(&session, output, &registry, exit).await;
    }
}

/// Suspend until the caller's answer is delivered or the session ends
async fn wait_for_answer(control_rx: &mut mpsc::UnboundedReceiver<PumpSignal>) -> PumpSignal {
    control_rx.recv().await.unwrap_or(PumpSignal::Stop)
}

/// Completed path: drain, reap, deregister, report
///
/// Output is drained while the session still owns the process, so a stop
/// arriving meanwhile can kill whatever keeps the pipes open.
async fn finish(
    session: &Session,
    mut output: ProcessOutput,
    registry: &SessionRegistry,
    exit: PumpExit,
) {
    let stdout = match output.stdout.read_remaining().await {
        Ok(text) => text,
        Err(e) => {
            warn!("Session {} failed to drain stdout: {}", session.id(), e);
            String::new()
        }
    };
    let stderr = output.collect_stderr().await;

    let Some(mut process) = session.complete().await else {
        debug!("Session {} already terminal, skipping report", session.id());
        return;
    };

    match process.wait_or_kill(EXIT_GRACE).await {
        Ok(status) => info!(
            "Session {} completed ({:?}) with {}",
            session.id(),
            exit,
            status
        ),
        Err(e) => warn!("Session {} wait failed: {}", session.id(), e),
    }
    drop(process);

    registry
        .remove_session(session.caller_id(), session.id())
        .await;

    let label = &session.tool().label;
    session.send_reply(&reply::output_report(label, &stdout));
    if !stderr.trim().is_empty() {
        session.send_reply(&reply::errors_report(label, &stderr));
    }
}
