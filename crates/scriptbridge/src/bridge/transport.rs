//! Peer process and its three pipes.
//!
//! The transport spawns the interpreter, feeds it the bootstrap, and then moves
//! frames: commands out on stdin, responses in on stdout. Stderr doubles as the
//! exit channel; reading a response always races it so a peer that dies
//! mid-call ends the call instead of hanging it.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::FrameCodec;
use super::protocol::{BOOTSTRAP_END, Command, ControlSignal, Response};
use crate::error::{BridgeError, ExitCode};

/// How long to wait for the process after its pipes broke.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long stderr may lag behind process exit when looking for the exit signal.
const CONTROL_DRAIN: Duration = Duration::from_millis(250);

/// Grace between SIGTERM and SIGKILL when force-killing.
#[cfg(unix)]
const TERM_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Put the peer in its own process group so its descendants can be
    /// signalled together.
    pub process_group: bool,
}

impl SpawnSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            process_group: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawned process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different spawn strategies.
///
/// Implementations must pipe stdin, stdout and stderr.
pub trait PeerSpawner: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec) -> Result<Child, SpawnError>;
}

/// Spawns the interpreter directly with `tokio::process`.
pub struct CommandSpawner;

impl PeerSpawner for CommandSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> Result<Child, SpawnError> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        if spec.process_group {
            cmd.process_group(0);
        }
        Ok(cmd.spawn()?)
    }
}

pub struct PeerTransport {
    child: Child,
    writer: FramedWrite<ChildStdin, FrameCodec<Command>>,
    reader: FramedRead<ChildStdout, FrameCodec<Response>>,
    control: FramedRead<ChildStderr, FrameCodec<ControlSignal>>,
    control_closed: bool,
    /// Exit code announced on the control channel, if any.
    declared: Option<Option<i32>>,
    exited: Option<ExitCode>,
    pid: Option<u32>,
    process_group: bool,
}

impl PeerTransport {
    /// Spawn the peer and write `bootstrap` followed by the end marker.
    pub async fn spawn(
        spawner: &dyn PeerSpawner,
        spec: &SpawnSpec,
        bootstrap: &str,
    ) -> Result<Self, BridgeError> {
        let mut child = spawner.spawn(spec)?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SpawnError::MissingPipe("stderr"))?;

        tracing::info!(
            pid,
            program = %spec.program.display(),
            process_group = spec.process_group,
            "Spawned peer"
        );

        let mut transport = Self {
            child,
            writer: FramedWrite::new(stdin, FrameCodec::new()),
            reader: FramedRead::new(stdout, FrameCodec::new()),
            control: FramedRead::new(stderr, FrameCodec::new()),
            control_closed: false,
            declared: None,
            exited: None,
            pid,
            process_group: spec.process_group,
        };

        if let Err(e) = transport.write_bootstrap(bootstrap).await {
            return Err(transport.fail(e).await);
        }
        Ok(transport)
    }

    async fn write_bootstrap(&mut self, text: &str) -> io::Result<()> {
        tracing::debug!(bootstrap_bytes = text.len(), "Writing bootstrap");
        let stdin = self.writer.get_mut();
        stdin.write_all(text.as_bytes()).await?;
        if !text.is_empty() && !text.ends_with('\n') {
            stdin.write_all(b"\n").await?;
        }
        stdin.write_all(BOOTSTRAP_END.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The recorded exit, if the peer is known to be gone.
    pub fn exit_code(&self) -> Option<ExitCode> {
        self.exited
    }

    pub async fn send(&mut self, command: Command) -> Result<(), BridgeError> {
        if let Some(code) = self.exited {
            return Err(BridgeError::PeerExit(code));
        }
        tracing::trace!(kind = command.kind.as_str(), target = %command.target, "Sending command");
        if let Err(e) = self.writer.send(command).await {
            return Err(self.fail(e).await);
        }
        Ok(())
    }

    /// Next response frame, or `PeerExit` if the peer goes away first.
    pub async fn recv(&mut self) -> Result<Response, BridgeError> {
        if let Some(code) = self.exited {
            return Err(BridgeError::PeerExit(code));
        }
        loop {
            tokio::select! {
                biased;

                frame = self.reader.next() => {
                    return match frame {
                        Some(Ok(response)) => Ok(response),
                        Some(Err(e)) => Err(self.fail(e).await),
                        None => {
                            tracing::debug!("Peer closed stdout");
                            Err(BridgeError::PeerExit(self.settle(SETTLE_TIMEOUT).await))
                        }
                    };
                }

                signal = self.control.next(), if !self.control_closed => {
                    match signal {
                        Some(Ok(ControlSignal::Exit(code))) => {
                            tracing::debug!(?code, "Exit signal during call");
                            self.declared = Some(code);
                            return Err(BridgeError::PeerExit(self.settle(SETTLE_TIMEOUT).await));
                        }
                        Some(Ok(ControlSignal::Diagnostic(line))) => forward_diagnostic(&line),
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Control channel error");
                            self.control_closed = true;
                        }
                        None => {
                            tracing::trace!("Control channel closed");
                            self.control_closed = true;
                        }
                    }
                }

                // Descendants of the peer can hold both pipes open after it dies.
                status = self.child.wait() => {
                    let status = match status {
                        Ok(status) => Some(status),
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to wait for peer");
                            None
                        }
                    };
                    tracing::debug!(?status, "Peer exited during call");
                    self.drain_control(CONTROL_DRAIN).await;
                    return Err(BridgeError::PeerExit(self.record_exit(status)));
                }
            }
        }
    }

    /// The peer answered with an EXIT frame; wait for it to finish.
    pub async fn peer_exiting(&mut self, code: Option<i32>) -> ExitCode {
        if self.declared.is_none() {
            self.declared = Some(code);
        }
        self.settle(SETTLE_TIMEOUT).await
    }

    /// Non-blocking exit check. A received exit signal counts as an exit even
    /// while the process is still winding down.
    pub fn poll_exit(&mut self) -> Option<ExitCode> {
        if let Some(code) = self.exited {
            return Some(code);
        }

        while !self.control_closed {
            match self.control.next().now_or_never() {
                Some(Some(Ok(ControlSignal::Exit(code)))) => self.declared = Some(code),
                Some(Some(Ok(ControlSignal::Diagnostic(line)))) => forward_diagnostic(&line),
                Some(Some(Err(e))) => {
                    tracing::warn!(error = %e, "Control channel error");
                    self.control_closed = true;
                }
                Some(None) => self.control_closed = true,
                None => break,
            }
        }

        match self.child.try_wait() {
            Ok(Some(status)) => return Some(self.record_exit(Some(status))),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to query peer status"),
        }

        // The exit hook already ran; the process is reaped later by settle.
        self.declared.map(|code| ExitCode::Declared(code.unwrap_or_default()))
    }

    /// Ask the peer to exit, wait up to `grace`, then kill it.
    pub async fn terminate(&mut self, code: Option<i32>, grace: Duration) -> ExitCode {
        if let Some(code) = self.exited {
            return code;
        }
        if self.poll_exit().is_none() {
            tracing::debug!(?code, "Requesting peer exit");
            if let Err(e) = self.writer.send(Command::exit(code)).await {
                tracing::debug!(error = %e, "Could not deliver exit request");
            }
        }
        self.settle(grace).await
    }

    /// Wait for the process to end (killing it after `timeout`) and record how
    /// it ended.
    async fn settle(&mut self, timeout: Duration) -> ExitCode {
        if let Some(code) = self.exited {
            return code;
        }

        let status = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to wait for peer");
                None
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Peer did not exit in time, killing"
                );
                self.force_kill().await;
                self.child.wait().await.ok()
            }
        };

        self.drain_control(CONTROL_DRAIN).await;
        self.record_exit(status)
    }

    async fn drain_control(&mut self, limit: Duration) {
        let deadline = Instant::now() + limit;
        while !self.control_closed {
            match tokio::time::timeout_at(deadline, self.control.next()).await {
                Ok(Some(Ok(ControlSignal::Exit(code)))) => self.declared = Some(code),
                Ok(Some(Ok(ControlSignal::Diagnostic(line)))) => forward_diagnostic(&line),
                Ok(Some(Err(_))) | Ok(None) => self.control_closed = true,
                Err(_) => break,
            }
        }
    }

    fn record_exit(&mut self, status: Option<ExitStatus>) -> ExitCode {
        let os_code = status.and_then(|s| s.code());
        let code = match self.declared {
            Some(Some(code)) => ExitCode::Declared(code),
            Some(None) => ExitCode::Declared(os_code.unwrap_or(0)),
            None => ExitCode::Ungraceful(os_code),
        };

        if code.is_graceful() {
            tracing::info!(pid = self.pid, %code, "Peer exited");
        } else {
            tracing::warn!(pid = self.pid, %code, ?status, "Peer exited without signalling");
        }

        self.reap_group();
        self.exited = Some(code);
        code
    }

    /// Translate an I/O failure into the error the caller should see.
    async fn fail(&mut self, err: io::Error) -> BridgeError {
        match err.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset => {
                tracing::debug!(error = %err, "Pipe to peer broke");
                BridgeError::PeerExit(self.settle(SETTLE_TIMEOUT).await)
            }
            io::ErrorKind::InvalidData => {
                tracing::error!(error = %err, "Malformed frame from peer, killing it");
                self.force_kill().await;
                self.settle(SETTLE_TIMEOUT).await;
                BridgeError::Protocol(err.to_string())
            }
            _ => {
                tracing::error!(error = %err, "Transport error, killing peer");
                self.force_kill().await;
                self.settle(SETTLE_TIMEOUT).await;
                BridgeError::Transport(err)
            }
        }
    }

    #[cfg(unix)]
    async fn force_kill(&mut self) {
        use nix::sys::signal::{Signal, kill, killpg};
        use nix::unistd::Pid;

        if let Some(raw) = self.child.id() {
            let pid = Pid::from_raw(raw as i32);
            let sent = if self.process_group {
                killpg(pid, Signal::SIGTERM)
            } else {
                kill(pid, Signal::SIGTERM)
            };
            if sent.is_ok()
                && tokio::time::timeout(TERM_GRACE, self.child.wait())
                    .await
                    .is_ok()
            {
                return;
            }
            if self.process_group {
                let _ = killpg(pid, Signal::SIGKILL);
            }
        }
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "Failed to kill peer");
        }
    }

    #[cfg(not(unix))]
    async fn force_kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "Failed to kill peer");
        }
    }

    /// Kill whatever is left of the peer's process group.
    #[cfg(unix)]
    fn reap_group(&self) {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Some(raw) = self.pid.filter(|_| self.process_group) else {
            return;
        };
        match killpg(Pid::from_raw(raw as i32), Signal::SIGKILL) {
            Ok(()) => tracing::debug!(pgid = raw, "Killed leftover peer descendants"),
            Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => tracing::debug!(pgid = raw, error = %e, "killpg failed"),
        }
    }

    #[cfg(not(unix))]
    fn reap_group(&self) {}
}

impl Drop for PeerTransport {
    fn drop(&mut self) {
        // kill_on_drop covers the peer itself.
        if self.exited.is_none() {
            self.reap_group();
        }
    }
}

fn forward_diagnostic(line: &str) {
    tracing::debug!(target: "scriptbridge::peer", "{line}");
}
