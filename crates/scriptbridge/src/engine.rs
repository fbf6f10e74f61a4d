//! Request/response cycle on top of the transport.
//!
//! One request is in flight at a time. Each request:
//! 1. encodes its arguments (rejecting unsupported values before anything is sent)
//! 2. checks the exit channel without blocking
//! 3. sends the command frame
//! 4. reads frames until a terminal one arrives, handing `WARN` frames to the
//!    warning handler along the way

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::protocol::{
    Command, CommandKind, ErrorDescriptor, INPUT_SYNC_CALL_ERROR, Response,
};
use crate::bridge::transport::PeerTransport;
use crate::error::{BridgeError, ExitCode, PeerException, Result, Warning, WarningHandler};
use crate::value::{self, Value};

const INPUT_SYNC_CALL_MESSAGE: &str = "0x8001010D - An outgoing call cannot be made since the \
     application is dispatching an input-synchronous call.";

/// Maps peer source locations back onto the user script.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    /// Lines of framework text that precede the user script.
    pub bootstrap_lines: u32,
    /// Where the user script was loaded from, if it came from a file.
    pub script_path: Option<PathBuf>,
}

impl SourceMap {
    pub fn rebase(&self, desc: &mut ErrorDescriptor) {
        let Some(line) = desc.source_line else {
            return;
        };
        if line <= self.bootstrap_lines {
            return;
        }
        desc.source_line = Some(line - self.bootstrap_lines);
        if let Some(path) = &self.script_path {
            desc.source_file = path.display().to_string();
        }
    }
}

pub struct ProtocolEngine {
    transport: PeerTransport,
    source_map: SourceMap,
    on_warning: WarningHandler,
}

impl ProtocolEngine {
    pub fn new(
        transport: PeerTransport,
        source_map: SourceMap,
        on_warning: WarningHandler,
    ) -> Self {
        Self {
            transport,
            source_map,
            on_warning,
        }
    }

    pub fn transport(&self) -> &PeerTransport {
        &self.transport
    }

    /// Read the peer's greeting: its identity, then `Initialized`.
    pub async fn handshake(&mut self) -> Result<String> {
        let identity = self.read_reply(CommandKind::Get).await?;
        tracing::debug!(%identity, "Peer identified");
        let ready = self.read_reply(CommandKind::Get).await?;
        if ready != "Initialized" {
            return Err(BridgeError::Handshake(format!(
                "expected Initialized, got {ready:?}"
            )));
        }
        Ok(identity)
    }

    /// Non-blocking check that the peer is still alive.
    pub fn poll(&mut self) -> Result<()> {
        match self.transport.poll_exit() {
            Some(code) => Err(BridgeError::PeerExit(code)),
            None => Ok(()),
        }
    }

    /// Send one command and return the raw OK payload.
    pub async fn request(
        &mut self,
        kind: CommandKind,
        target: &str,
        args: &[Value],
    ) -> Result<String> {
        value::check_text(target)?;

        let mut warnings = Vec::new();
        let mut encoded = Vec::with_capacity(args.len());
        for arg in args {
            let e = value::encode(arg)?;
            if let Some(w) = e.warning {
                warnings.push(Warning::PrecisionLoss(w));
            }
            encoded.push(e.text);
        }
        for w in &warnings {
            (self.on_warning)(w);
        }

        self.poll()?;

        tracing::trace!(kind = kind.as_str(), %target, args = encoded.len(), "Request");
        self.transport
            .send(Command::new(kind, target).with_args(encoded))
            .await?;
        self.read_reply(kind).await
    }

    async fn read_reply(&mut self, kind: CommandKind) -> Result<String> {
        loop {
            match self.transport.recv().await? {
                Response::Ok(payload) => return Ok(payload),
                Response::Warn { name, message } => {
                    (self.on_warning)(&Warning::Peer { name, message });
                }
                Response::Err(mut desc) => {
                    self.source_map.rebase(&mut desc);
                    if kind.is_fast_call() && desc.message == INPUT_SYNC_CALL_ERROR {
                        desc.message = INPUT_SYNC_CALL_MESSAGE.to_string();
                        return Err(BridgeError::MainThreadRequired(PeerException::new(desc)));
                    }
                    tracing::debug!(kind = %desc.kind, message = %desc.message, "Peer error");
                    return Err(BridgeError::Peer(PeerException::new(desc)));
                }
                Response::Exit(code) => {
                    let code = self.transport.peer_exiting(code).await;
                    return Err(BridgeError::PeerExit(code));
                }
            }
        }
    }

    pub async fn terminate(&mut self, code: Option<i32>, grace: Duration) -> ExitCode {
        self.transport.terminate(code, grace).await
    }

    pub fn exit_code(&self) -> Option<ExitCode> {
        self.transport.exit_code()
    }
}
