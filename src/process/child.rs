//! Child process management
//!
//! Spawns tool commands through a shell with piped stdio, including:
//! - Line-oriented stdout reading with early delivery of unterminated prompts
//! - Concurrent stderr collection
//! - Stdin writes that detect an already-exited process
//! - Kill of the whole process group with reaping

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Size of a single stdout read
const READ_CHUNK_SIZE: usize = 4096;

/// Longest unterminated fragment kept before it is delivered as a line
pub const MAX_LINE_BYTES: usize = 16 * 1024;

/// Errors that can occur during process operations
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to write to process: {0}")]
    WriteFailed(String),

    #[error("Failed to read from process: {0}")]
    ReadFailed(String),

    #[error("Failed to kill process: {0}")]
    KillFailed(String),

    #[error("Process already exited")]
    ProcessExited,
}

/// Result type for process operations
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Outcome of a kill request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// The process was running and has been killed
    Killed,
    /// The process had already exited on its own
    AlreadyExited,
}

/// Handle to a running tool process
///
/// Owns the child and its stdin. Output streams are handed out separately
/// as a [`ProcessOutput`] so they can be read without holding this handle.
///
/// The shell leads its own process group, so everything it starts can be
/// signalled together.
pub struct ToolProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    pgid: Option<i32>,
}

impl ToolProcess {
    /// Spawn `command` as `<shell> -c <command>`
    ///
    /// # Returns
    /// The process handle and its output streams
    pub fn spawn(shell: &str, command: &str) -> ProcessResult<(Self, ProcessOutput)> {
        let mut child = Command::new(shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed("stderr not captured".to_string()))?;

        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        debug!("Spawned process {:?}: {}", pgid, command);

        let output = ProcessOutput {
            stdout: LineReader::new(stdout),
            stderr: tokio::spawn(collect_to_string(stderr)),
        };

        Ok((Self { child, stdin, pgid }, output))
    }

    /// OS process id, if the process has not been reaped yet
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Check whether the process has exited without blocking
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Write a line to the process stdin and flush it
    pub async fn write_line(&mut self, line: &str) -> ProcessResult<()> {
        if self.has_exited() {
            return Err(ProcessError::ProcessExited);
        }
        let stdin = self.stdin.as_mut().ok_or(ProcessError::ProcessExited)?;

        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');

        stdin.write_all(&data).await.map_err(write_error)?;
        stdin.flush().await.map_err(write_error)?;
        Ok(())
    }

    /// Kill the process group and reap the shell
    ///
    /// The group is signalled even when the shell already exited, so
    /// background children holding the output pipes go away too.
    pub async fn kill(&mut self) -> ProcessResult<KillOutcome> {
        let exited = self.has_exited();
        self.stdin = None;
        if let Err(e) = self.kill_group() {
            warn!("{}", e);
        }

        if exited {
            return Ok(KillOutcome::AlreadyExited);
        }
        match self.child.kill().await {
            Ok(()) => Ok(KillOutcome::Killed),
            // Exited between the check and the signal
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
                Ok(KillOutcome::AlreadyExited)
            }
            Err(e) => Err(ProcessError::KillFailed(e.to_string())),
        }
    }

    fn kill_group(&self) -> ProcessResult<()> {
        let Some(pgid) = self.pgid else {
            return Ok(());
        };
        match signal::killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) => {
                debug!("Sent SIGKILL to process group {}", pgid);
                Ok(())
            }
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(ProcessError::KillFailed(format!(
                "process group {}: {}",
                pgid, e
            ))),
        }
    }

    /// Wait for the process to exit, killing its group after `grace`
    pub async fn wait_or_kill(&mut self, grace: Duration) -> ProcessResult<ExitStatus> {
        self.stdin = None;
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => status.map_err(|e| ProcessError::ReadFailed(e.to_string())),
            Err(_) => {
                warn!("Process group {:?} still running after {:?}, killing", self.pgid, grace);
                self.kill().await?;
                self.wait().await
            }
        }
    }

    /// Wait for the process to exit
    pub async fn wait(&mut self) -> ProcessResult<ExitStatus> {
        self.stdin = None;
        self.child
            .wait()
            .await
            .map_err(|e| ProcessError::ReadFailed(e.to_string()))
    }
}

impl Drop for ToolProcess {
    fn drop(&mut self) {
        if !self.has_exited() {
            let _ = self.kill_group();
        }
    }
}

fn write_error(e: std::io::Error) -> ProcessError {
    if e.kind() == std::io::ErrorKind::BrokenPipe {
        ProcessError::ProcessExited
    } else {
        ProcessError::WriteFailed(e.to_string())
    }
}

/// Output streams of a tool process
pub struct ProcessOutput {
    /// Line reader over stdout
    pub stdout: LineReader<ChildStdout>,
    /// Task collecting the whole of stderr
    pub stderr: JoinHandle<String>,
}

impl ProcessOutput {
    /// Wait for the stderr collector and return everything it read
    pub async fn collect_stderr(self) -> String {
        match self.stderr.await {
            Ok(text) => text,
            Err(e) => {
                warn!("stderr collector failed: {}", e);
                String::new()
            }
        }
    }
}

async fn collect_to_string<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buffer = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buffer).await {
        warn!("Failed to read stderr: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Splits a byte stream into text lines
///
/// `next_line` is cancel-safe: bytes read before a cancelled call stay in
/// the internal buffer for the next call.
pub struct LineReader<R> {
    reader: R,
    buffer: Vec<u8>,
    /// Prefix of `buffer` known to hold no newline
    scanned: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            scanned: 0,
            eof: false,
        }
    }

    /// Read the next line, without its terminator
    ///
    /// An unterminated fragment is returned early when `is_prompt` accepts
    /// it, since interactive prompts rarely end with a newline. Returns
    /// `None` at end of stream; a trailing unterminated fragment is kept for
    /// [`LineReader::read_remaining`]. Fragments reaching
    /// [`MAX_LINE_BYTES`] are delivered as a line of their own.
    pub async fn next_line<F>(&mut self, is_prompt: F) -> ProcessResult<Option<String>>
    where
        F: Fn(&str) -> bool,
    {
        loop {
            if let Some(pos) = self.buffer[self.scanned..]
                .iter()
                .position(|&b| b == b'\n')
            {
                let line: Vec<u8> = self.buffer.drain(..=self.scanned + pos).collect();
                self.scanned = 0;
                return Ok(Some(decode_line(&line)));
            }
            self.scanned = self.buffer.len();

            if self.buffer.len() >= MAX_LINE_BYTES {
                let line = std::mem::take(&mut self.buffer);
                self.scanned = 0;
                return Ok(Some(decode_line(&line)));
            }

            if !self.buffer.is_empty() {
                let pending = decode_line(&self.buffer);
                if is_prompt(&pending) {
                    self.buffer.clear();
                    self.scanned = 0;
                    return Ok(Some(pending));
                }
            }

            if self.eof {
                return Ok(None);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let n = self
                .reader
                .read(&mut chunk)
                .await
                .map_err(|e| ProcessError::ReadFailed(e.to_string()))?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buffer.extend_from_slice(&chunk[..n]);
            }
        }
    }

    /// Read everything left in the stream, including buffered bytes
    pub async fn read_remaining(&mut self) -> ProcessResult<String> {
        if !self.eof {
            self.reader
                .read_to_end(&mut self.buffer)
                .await
                .map_err(|e| ProcessError::ReadFailed(e.to_string()))?;
            self.eof = true;
        }
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        Ok(String::from_utf8_lossy(&rest).into_owned())
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let mut end = bytes.len();
    if end > 0 && bytes[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && bytes[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
