//! Wire protocol between the host and the peer interpreter.
//!
//! Three channels, all line oriented:
//! - **stdin**: bootstrap text, the end-of-bootstrap marker, then [`Command`] frames
//! - **stdout**: [`Response`] frames, one answer per command
//! - **stderr**: [`ControlSignal`]s (the exit hook) mixed with peer diagnostics
//!
//! Fields inside a frame are separated by [`SEPARATOR`] and escaped so a frame
//! never spans lines. The `BLOCK` form carries multi-line payloads unescaped,
//! prefixed by their line count.

use std::fmt::Write as _;

use serde::Serialize;

/// Field delimiter. Never escaped; values containing it are rejected.
pub const SEPARATOR: char = '\u{3}';

/// Line that ends the bootstrap section on stdin.
pub const BOOTSTRAP_END: &str = "\u{3}\u{3}\u{3}";

/// Peer message for "an outgoing call cannot be made since the application is
/// dispatching an input-synchronous call" (0x8001010D).
pub const INPUT_SYNC_CALL_ERROR: &str = "2147549453";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown response status: {0:?}")]
    UnknownStatus(String),
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),
    #[error("malformed block header: {0:?}")]
    BadBlockHeader(String),
    #[error("{0} frames cannot be sent as a block")]
    BlockNotAllowed(&'static str),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

/// Result of parsing a single line.
#[derive(Debug)]
pub enum Parsed<T> {
    Frame(T),
    /// A block header: the next `lines` lines form the payload.
    Block { status: String, lines: usize },
}

/// A message that travels as one or more `\n`-terminated lines.
pub trait Frame: Sized {
    /// Append the wire form, including the trailing newline(s).
    fn write_to(&self, dst: &mut String);

    fn parse_line(line: &str) -> Result<Parsed<Self>, FrameError>;

    fn parse_block(status: &str, payload: &str) -> Result<Self, FrameError>;
}

pub fn escape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape`]. Unknown escapes are kept verbatim.
pub fn unescape(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

// ============================================================================
// Commands (host -> peer)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Invoke a function, discard its result.
    Call,
    /// [`CommandKind::Call`] dispatched on the peer's main thread.
    CallMain,
    /// Invoke a function and return its result.
    Func,
    /// [`CommandKind::Func`] dispatched on the peer's main thread.
    FuncMain,
    Get,
    Set,
    GetRaw,
    SetRaw,
    Exit,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Call => "CALL",
            CommandKind::CallMain => "CALL_MAIN",
            CommandKind::Func => "F",
            CommandKind::FuncMain => "F_MAIN",
            CommandKind::Get => "GET",
            CommandKind::Set => "SET",
            CommandKind::GetRaw => "GET_RAW",
            CommandKind::SetRaw => "SET_RAW",
            CommandKind::Exit => "EXIT",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "CALL" => CommandKind::Call,
            "CALL_MAIN" => CommandKind::CallMain,
            "F" => CommandKind::Func,
            "F_MAIN" => CommandKind::FuncMain,
            "GET" => CommandKind::Get,
            "SET" => CommandKind::Set,
            "GET_RAW" => CommandKind::GetRaw,
            "SET_RAW" => CommandKind::SetRaw,
            "EXIT" => CommandKind::Exit,
            _ => return None,
        })
    }

    pub fn is_main_route(self) -> bool {
        matches!(self, CommandKind::CallMain | CommandKind::FuncMain)
    }

    /// Function invocations on the fast route.
    pub fn is_fast_call(self) -> bool {
        matches!(self, CommandKind::Call | CommandKind::Func)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub target: String,
    pub args: Vec<String>,
}

impl Command {
    pub fn new(kind: CommandKind, target: impl Into<String>) -> Self {
        Self {
            kind,
            target: target.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Ask the peer to exit with `code`, or its default code.
    pub fn exit(code: Option<i32>) -> Self {
        Self::new(
            CommandKind::Exit,
            code.map(|c| c.to_string()).unwrap_or_default(),
        )
    }
}

impl Frame for Command {
    fn write_to(&self, dst: &mut String) {
        dst.push_str(self.kind.as_str());
        dst.push(SEPARATOR);
        dst.push_str(&escape(&self.target));
        for arg in &self.args {
            dst.push(SEPARATOR);
            dst.push_str(&escape(arg));
        }
        dst.push('\n');
    }

    fn parse_line(line: &str) -> Result<Parsed<Self>, FrameError> {
        if line.is_empty() {
            return Err(FrameError::Empty);
        }
        let mut fields = line.split(SEPARATOR);
        let token = fields.next().unwrap_or_default();
        let kind =
            CommandKind::parse(token).ok_or_else(|| FrameError::UnknownCommand(token.to_owned()))?;
        let target = fields.next().map(unescape).unwrap_or_default();
        let args = fields.map(unescape).collect();
        Ok(Parsed::Frame(Command { kind, target, args }))
    }

    fn parse_block(_status: &str, _payload: &str) -> Result<Self, FrameError> {
        Err(FrameError::BlockNotAllowed("command"))
    }
}

// ============================================================================
// Responses (peer -> host)
// ============================================================================

/// Error details sent by the peer.
///
/// Every field is optional on the wire; missing fields decode as empty strings
/// and a line that is not a valid number decodes as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ErrorDescriptor {
    /// Peer-side error class, e.g. `UserException` or `FunctionNotFound`.
    pub kind: String,
    pub message: String,
    /// What was executing when the error was raised.
    pub context: String,
    pub extra: String,
    pub source_file: String,
    pub source_line: Option<u32>,
}

impl ErrorDescriptor {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    fn from_fields<I: Iterator<Item = String>>(mut fields: I) -> Self {
        let mut next = || fields.next().unwrap_or_default();
        let kind = next();
        let message = next();
        let context = next();
        let extra = next();
        let source_file = next();
        let source_line = next().trim().parse::<u32>().ok();
        Self {
            kind,
            message,
            context,
            extra,
            source_file,
            source_line,
        }
    }

    fn fields(&self) -> [String; 6] {
        [
            self.kind.clone(),
            self.message.clone(),
            self.context.clone(),
            self.extra.clone(),
            self.source_file.clone(),
            self.source_line.map(|l| l.to_string()).unwrap_or_default(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok(String),
    Err(ErrorDescriptor),
    /// The peer is exiting instead of answering.
    Exit(Option<i32>),
    /// Non-terminal; more frames follow.
    Warn { name: String, message: String },
}

impl Response {
    fn status(&self) -> &'static str {
        match self {
            Response::Ok(_) => "OK",
            Response::Err(_) => "ERR",
            Response::Exit(_) => "EXIT",
            Response::Warn { .. } => "WARN",
        }
    }

    fn fields(&self) -> Vec<String> {
        match self {
            Response::Ok(payload) => vec![payload.clone()],
            Response::Err(desc) => desc.fields().to_vec(),
            Response::Exit(code) => vec![code.map(|c| c.to_string()).unwrap_or_default()],
            Response::Warn { name, message } => vec![name.clone(), message.clone()],
        }
    }

    fn from_fields(status: &str, payload: &str, escaped: bool) -> Result<Self, FrameError> {
        let field = |s: &str| {
            if escaped {
                unescape(s)
            } else {
                s.to_owned()
            }
        };
        match status {
            "OK" => Ok(Response::Ok(field(payload))),
            "ERR" => Ok(Response::Err(ErrorDescriptor::from_fields(
                payload.split(SEPARATOR).map(field),
            ))),
            "EXIT" => Ok(Response::Exit(payload.trim().parse().ok())),
            "WARN" => {
                let mut parts = payload.splitn(2, SEPARATOR).map(field);
                Ok(Response::Warn {
                    name: parts.next().unwrap_or_default(),
                    message: parts.next().unwrap_or_default(),
                })
            }
            other => Err(FrameError::UnknownStatus(other.to_owned())),
        }
    }
}

impl Frame for Response {
    fn write_to(&self, dst: &mut String) {
        let fields = self.fields();
        let multiline = fields.iter().any(|f| f.contains('\n'));

        if multiline {
            let payload = fields.join(&SEPARATOR.to_string());
            let lines: Vec<&str> = payload.split('\n').collect();
            let _ = writeln!(
                dst,
                "BLOCK{SEPARATOR}{}{SEPARATOR}{}",
                self.status(),
                lines.len()
            );
            for line in lines {
                dst.push_str(line);
                dst.push('\n');
            }
            return;
        }

        dst.push_str(self.status());
        for field in &fields {
            dst.push(SEPARATOR);
            dst.push_str(&escape(field));
        }
        dst.push('\n');
    }

    fn parse_line(line: &str) -> Result<Parsed<Self>, FrameError> {
        if line.is_empty() {
            return Err(FrameError::Empty);
        }
        let (status, payload) = line.split_once(SEPARATOR).unwrap_or((line, ""));
        if status == "BLOCK" {
            let (inner, count) = payload
                .split_once(SEPARATOR)
                .ok_or_else(|| FrameError::BadBlockHeader(line.to_owned()))?;
            let lines = count
                .trim()
                .parse::<usize>()
                .map_err(|_| FrameError::BadBlockHeader(line.to_owned()))?;
            return Ok(Parsed::Block {
                status: inner.to_owned(),
                lines,
            });
        }
        Self::from_fields(status, payload, true).map(Parsed::Frame)
    }

    fn parse_block(status: &str, payload: &str) -> Result<Self, FrameError> {
        Self::from_fields(status, payload, false)
    }
}

// ============================================================================
// Control channel (peer stderr)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// Written by the peer's exit hook just before it terminates.
    Exit(Option<i32>),
    /// Anything else the peer printed to stderr.
    Diagnostic(String),
}

impl Frame for ControlSignal {
    fn write_to(&self, dst: &mut String) {
        match self {
            ControlSignal::Exit(code) => {
                let code = code.map(|c| c.to_string()).unwrap_or_default();
                let _ = writeln!(dst, "EXIT{SEPARATOR}{code}");
            }
            ControlSignal::Diagnostic(text) => {
                for line in text.lines() {
                    dst.push_str(line);
                    dst.push('\n');
                }
            }
        }
    }

    fn parse_line(line: &str) -> Result<Parsed<Self>, FrameError> {
        let signal = match line.split_once(SEPARATOR) {
            Some(("EXIT", code)) => ControlSignal::Exit(code.trim().parse().ok()),
            _ => ControlSignal::Diagnostic(line.to_owned()),
        };
        Ok(Parsed::Frame(signal))
    }

    fn parse_block(_status: &str, _payload: &str) -> Result<Self, FrameError> {
        Err(FrameError::BlockNotAllowed("control"))
    }
}
