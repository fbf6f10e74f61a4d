//! Error and warning types shared across the bridge.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bridge::protocol::ErrorDescriptor;
use crate::bridge::transport::SpawnError;
use crate::value::{PrecisionLossWarning, UnsupportedValueError};

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// How the peer process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// The peer ran its exit hook and announced this code.
    Declared(i32),
    /// The peer vanished without announcing anything. Carries the OS exit
    /// status when there was one (`None` when killed by a signal).
    Ungraceful(Option<i32>),
}

impl ExitCode {
    pub fn is_graceful(&self) -> bool {
        matches!(self, ExitCode::Declared(_))
    }

    pub fn code(&self) -> Option<i32> {
        match *self {
            ExitCode::Declared(code) => Some(code),
            ExitCode::Ungraceful(code) => code,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCode::Declared(code) => write!(f, "exited with code {code}"),
            ExitCode::Ungraceful(Some(code)) => {
                write!(f, "terminated unexpectedly with status {code}")
            }
            ExitCode::Ungraceful(None) => write!(f, "terminated unexpectedly"),
        }
    }
}

/// An error raised inside the peer and carried back across the pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerException {
    descriptor: ErrorDescriptor,
}

impl PeerException {
    pub fn new(descriptor: ErrorDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn kind(&self) -> &str {
        &self.descriptor.kind
    }

    pub fn message(&self) -> &str {
        &self.descriptor.message
    }

    pub fn context(&self) -> &str {
        &self.descriptor.context
    }

    pub fn extra(&self) -> &str {
        &self.descriptor.extra
    }

    pub fn source_file(&self) -> &str {
        &self.descriptor.source_file
    }

    /// `None` when the peer did not report a usable line.
    pub fn source_line(&self) -> Option<u32> {
        self.descriptor.source_line
    }

    pub fn descriptor(&self) -> &ErrorDescriptor {
        &self.descriptor
    }

    pub fn into_descriptor(self) -> ErrorDescriptor {
        self.descriptor
    }
}

impl fmt::Display for PeerException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.descriptor;
        if d.kind.is_empty() {
            write!(f, "{}", d.message)?;
        } else {
            write!(f, "{}: {}", d.kind, d.message)?;
        }
        if !d.context.is_empty() {
            write!(f, "\n\tSpecifically: {}", d.context)?;
        }
        if !d.extra.is_empty() {
            write!(f, "\n\tExtra: {}", d.extra)?;
        }
        match (d.source_file.is_empty(), d.source_line) {
            (false, Some(line)) => write!(f, "\n\tat {}:{line}", d.source_file),
            (false, None) => write!(f, "\n\tat {} (unknown line)", d.source_file),
            (true, Some(line)) => write!(f, "\n\tat line {line}"),
            (true, None) => Ok(()),
        }
    }
}

impl std::error::Error for PeerException {}

/// Problems detected before the peer is spawned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unresolved placeholder {{{{{name}}}}}")]
    UnresolvedPlaceholder { name: String },
    #[error("script contains the reserved end-of-bootstrap marker line")]
    ReservedMarker,
    #[error("failed to read script {}: {source}", path.display())]
    ReadScript {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no interpreter configured (set SCRIPTBRIDGE_INTERPRETER)")]
    MissingInterpreter,
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },
    #[error("cannot stage interpreter into {}: {source}", dir.display())]
    Staging {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("working directory {} is not a directory", .0.display())]
    WorkingDir(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    UnsupportedValue(#[from] UnsupportedValueError),

    #[error("peer raised {0}")]
    Peer(PeerException),

    #[error("call must be made on the main thread (use the *_main variant): {0}")]
    MainThreadRequired(PeerException),

    #[error("peer {0}")]
    PeerExit(ExitCode),

    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer raised an error while loading the script, before a session
    /// existed.
    #[error("peer failed during startup: {0}")]
    Startup(PeerException),
}

impl BridgeError {
    /// Whether the session is unusable after this error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BridgeError::PeerExit(_)
                | BridgeError::Transport(_)
                | BridgeError::Protocol(_)
                | BridgeError::Spawn(_)
                | BridgeError::Handshake(_)
                | BridgeError::Startup(_)
        )
    }

    pub fn exit_code(&self) -> Option<ExitCode> {
        match self {
            BridgeError::PeerExit(code) => Some(*code),
            _ => None,
        }
    }

    pub fn peer_exception(&self) -> Option<&PeerException> {
        match self {
            BridgeError::Peer(e)
            | BridgeError::MainThreadRequired(e)
            | BridgeError::Startup(e) => Some(e),
            _ => None,
        }
    }
}

/// Non-fatal conditions surfaced while a request completes.
#[derive(Debug, Clone, PartialEq)]
pub enum Warning {
    PrecisionLoss(PrecisionLossWarning),
    /// A `WARN` frame sent by the peer.
    Peer { name: String, message: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::PrecisionLoss(w) => write!(f, "{w}"),
            Warning::Peer { name, message } => write!(f, "{name}: {message}"),
        }
    }
}

pub type WarningHandler = Arc<dyn Fn(&Warning) + Send + Sync>;

pub fn log_warning(warning: &Warning) {
    match warning {
        Warning::PrecisionLoss(w) => {
            tracing::warn!(
                value = w.value,
                encoded = %w.encoded,
                "Loss of precision encoding float"
            );
        }
        Warning::Peer { name, message } => {
            tracing::warn!(target: "scriptbridge::peer", %name, "{message}");
        }
    }
}
