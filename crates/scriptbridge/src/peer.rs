//! Reference peer: the child side of the protocol.
//!
//! Runs inside the `scriptbridge-peer` binary. It reads the bootstrap from
//! stdin up to the end marker, parses it as a small declarative script,
//! greets the host and then answers commands until told to exit or stdin
//! closes.
//!
//! Script language, one statement per line (`#` starts a comment):
//!
//! ```text
//! option <name> <value>          # separator, host_pid, working_dir
//! var <name> <value...>          # initial global
//! func <name> <behavior> [text]  # see Behavior
//! autoexec <name>                # run once before Initialized
//! ```

use std::collections::HashMap;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{stderr, stdin, stdout};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{FrameCodec, LineCodec};
use crate::bridge::protocol::{
    BOOTSTRAP_END, Command, CommandKind, ControlSignal, ErrorDescriptor, Frame,
    INPUT_SYNC_CALL_ERROR, Parsed, Response, SEPARATOR,
};
use crate::version::SCRIPTBRIDGE_VERSION;

/// Framework text the host sends ahead of every user script.
pub const FRAMEWORK: &str = "# scriptbridge reference framework
option separator {{SEPARATOR_CODE}}
option host_pid {{HOST_PID}}
option working_dir {{WORKING_DIR}}
";

/// File name reported in error locations.
pub const STDIN_NAME: &str = "<stdin>";

/// Exit code for a bootstrap the peer could not run.
pub const SCRIPT_ERROR_EXIT: i32 = 2;

/// Exit code of the `crash` behavior.
pub const CRASH_EXIT: i32 = 99;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
    /// First argument, or empty.
    Echo,
    /// All arguments joined.
    Concat,
    Const(String),
    /// Number of arguments.
    Count,
    Throw {
        message: String,
        what: String,
        extra: String,
    },
    /// Fails with the input-synchronous call error on the fast route.
    MainOnly(String),
    /// Sends a WARN frame, then returns the text.
    Warn(String),
    Sleep(u64),
    /// Graceful exit without answering.
    Exit(i32),
    /// Abort without an exit signal or answer.
    Crash,
    /// `n` lines joined by `\n`.
    Lines(usize),
    /// Current working directory.
    Cwd,
}

impl Behavior {
    fn parse(name: &str, text: &str) -> Result<Self, String> {
        Ok(match name {
            "echo" => Behavior::Echo,
            "concat" => Behavior::Concat,
            "const" => Behavior::Const(text.to_string()),
            "count" => Behavior::Count,
            "throw" => {
                let mut parts = text.splitn(3, '|');
                Behavior::Throw {
                    message: parts.next().unwrap_or_default().to_string(),
                    what: parts.next().unwrap_or_default().to_string(),
                    extra: parts.next().unwrap_or_default().to_string(),
                }
            }
            "main_only" => Behavior::MainOnly(text.to_string()),
            "warn" => Behavior::Warn(text.to_string()),
            "sleep" => Behavior::Sleep(parse_number(name, text, "milliseconds")?),
            "exit" => Behavior::Exit(parse_number(name, text, "an exit code")?),
            "crash" => Behavior::Crash,
            "lines" => Behavior::Lines(parse_number(name, text, "a line count")?),
            "cwd" => Behavior::Cwd,
            other => return Err(format!("unknown behavior {other:?}")),
        })
    }
}

fn parse_number<T: FromStr>(behavior: &str, text: &str, what: &str) -> Result<T, String> {
    text.trim()
        .parse()
        .map_err(|_| format!("{behavior} expects {what}, got {text:?}"))
}

#[derive(Debug, Clone)]
struct Function {
    behavior: Behavior,
    /// Line of the `func` statement, counted over the whole bootstrap.
    line: u32,
}

#[derive(Debug, thiserror::Error)]
#[error("line {line}: {message}")]
pub struct ScriptError {
    pub line: u32,
    pub message: String,
}

impl ScriptError {
    fn to_descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            kind: "ScriptError".to_string(),
            message: self.message.clone(),
            source_file: STDIN_NAME.to_string(),
            source_line: Some(self.line),
            ..Default::default()
        }
    }
}

/// A parsed bootstrap.
#[derive(Debug, Default)]
pub struct Program {
    options: HashMap<String, String>,
    vars: HashMap<String, String>,
    functions: HashMap<String, Function>,
    autoexec: Vec<String>,
}

impl Program {
    pub fn parse(text: &str) -> Result<Self, ScriptError> {
        let mut program = Program::default();

        for (idx, raw) in text.lines().enumerate() {
            let line = idx as u32 + 1;
            let stmt = raw.trim();
            if stmt.is_empty() || stmt.starts_with('#') {
                continue;
            }
            let err = |message: String| ScriptError { line, message };

            let (keyword, rest) = stmt.split_once(' ').unwrap_or((stmt, ""));
            let rest = rest.trim_start();
            match keyword {
                "option" => {
                    let (name, value) = rest.split_once(' ').unwrap_or((rest, ""));
                    if name == "separator" && value.trim() != u32::from(SEPARATOR).to_string() {
                        return Err(err(format!("unsupported separator {value:?}")));
                    }
                    program
                        .options
                        .insert(name.to_string(), value.trim().to_string());
                }
                "var" => {
                    let (name, value) = rest.split_once(' ').unwrap_or((rest, ""));
                    if name.is_empty() {
                        return Err(err("var needs a name".to_string()));
                    }
                    program.vars.insert(name.to_string(), value.to_string());
                }
                "func" => {
                    let mut parts = rest.splitn(3, ' ');
                    let name = parts.next().unwrap_or_default();
                    let behavior = parts.next().unwrap_or_default();
                    let text = parts.next().unwrap_or_default();
                    if name.is_empty() || behavior.is_empty() {
                        return Err(err("func needs a name and a behavior".to_string()));
                    }
                    let behavior = Behavior::parse(behavior, text).map_err(err)?;
                    program
                        .functions
                        .insert(name.to_string(), Function { behavior, line });
                }
                "autoexec" => {
                    if rest.is_empty() {
                        return Err(err("autoexec needs a function name".to_string()));
                    }
                    program.autoexec.push(rest.to_string());
                }
                other => return Err(err(format!("unknown statement {other:?}"))),
            }
        }

        Ok(program)
    }

    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.get(name).map(String::as_str)
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }
}

/// What a command produced.
#[derive(Debug, PartialEq)]
enum Outcome {
    Reply(Vec<Response>),
    Exit(i32),
    Crash,
}

struct Peer {
    program: Program,
}

impl Peer {
    async fn dispatch(&mut self, cmd: Command) -> Outcome {
        match cmd.kind {
            CommandKind::Get | CommandKind::GetRaw => {
                let value = self.program.var(&cmd.target).unwrap_or_default();
                Outcome::Reply(vec![Response::Ok(value.to_string())])
            }
            CommandKind::Set | CommandKind::SetRaw => {
                let value = cmd.args.into_iter().next().unwrap_or_default();
                self.program.vars.insert(cmd.target, value);
                Outcome::Reply(vec![Response::Ok(String::new())])
            }
            CommandKind::Exit => Outcome::Exit(cmd.target.trim().parse().unwrap_or(0)),
            kind => self.invoke(kind, &cmd.target, &cmd.args).await,
        }
    }

    async fn invoke(&self, kind: CommandKind, name: &str, args: &[String]) -> Outcome {
        let Some(func) = self.program.functions.get(name) else {
            return Outcome::Reply(vec![Response::Err(ErrorDescriptor::new(
                "FunctionNotFound",
                name,
            ))]);
        };

        let mut frames = Vec::new();
        let result = match &func.behavior {
            Behavior::Echo => args.first().cloned().unwrap_or_default(),
            Behavior::Concat => args.concat(),
            Behavior::Const(text) => text.clone(),
            Behavior::Count => args.len().to_string(),
            Behavior::Throw {
                message,
                what,
                extra,
            } => {
                return Outcome::Reply(vec![Response::Err(ErrorDescriptor {
                    kind: "UserException".to_string(),
                    message: message.clone(),
                    context: what.clone(),
                    extra: extra.clone(),
                    source_file: STDIN_NAME.to_string(),
                    source_line: Some(func.line),
                })]);
            }
            Behavior::MainOnly(text) => {
                if kind.is_fast_call() {
                    return Outcome::Reply(vec![Response::Err(ErrorDescriptor {
                        kind: "UserException".to_string(),
                        message: INPUT_SYNC_CALL_ERROR.to_string(),
                        context: name.to_string(),
                        source_file: STDIN_NAME.to_string(),
                        source_line: Some(func.line),
                        ..Default::default()
                    })]);
                }
                text.clone()
            }
            Behavior::Warn(text) => {
                frames.push(Response::Warn {
                    name: "PeerWarning".to_string(),
                    message: text.clone(),
                });
                text.clone()
            }
            Behavior::Sleep(ms) => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                String::new()
            }
            Behavior::Exit(code) => return Outcome::Exit(*code),
            Behavior::Crash => return Outcome::Crash,
            Behavior::Lines(n) => (1..=*n)
                .map(|i| format!("line {i}"))
                .collect::<Vec<_>>()
                .join("\n"),
            Behavior::Cwd => std::env::current_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_default(),
        };

        let wants_result = matches!(kind, CommandKind::Func | CommandKind::FuncMain);
        frames.push(Response::Ok(if wants_result {
            result
        } else {
            String::new()
        }));
        Outcome::Reply(frames)
    }
}

type ResponseWriter = FramedWrite<tokio::io::Stdout, FrameCodec<Response>>;
type ControlWriter = FramedWrite<tokio::io::Stderr, FrameCodec<ControlSignal>>;

async fn signal_exit(control: &mut ControlWriter, code: i32) -> i32 {
    tracing::debug!(code, "Peer exiting");
    if let Err(e) = control.send(ControlSignal::Exit(Some(code))).await {
        tracing::debug!(error = %e, "Failed to write exit signal");
    }
    code
}

/// Run the peer on this process's stdio. Returns the process exit code.
pub async fn run_peer() -> io::Result<i32> {
    let mut input = FramedRead::new(stdin(), LineCodec::new());
    let mut output: ResponseWriter = FramedWrite::new(stdout(), FrameCodec::new());
    let mut control: ControlWriter = FramedWrite::new(stderr(), FrameCodec::new());

    // Bootstrap section
    let mut bootstrap = Vec::new();
    loop {
        match input.next().await {
            Some(Ok(line)) => {
                let line = String::from_utf8_lossy(&line).into_owned();
                if line.trim_end_matches('\r') == BOOTSTRAP_END {
                    break;
                }
                bootstrap.push(line);
            }
            Some(Err(e)) => return Err(e),
            None => {
                control
                    .send(ControlSignal::Diagnostic(
                        "stdin closed before the end of the bootstrap".to_string(),
                    ))
                    .await?;
                return Ok(signal_exit(&mut control, SCRIPT_ERROR_EXIT).await);
            }
        }
    }

    let program = match Program::parse(&bootstrap.join("\n")) {
        Ok(program) => program,
        Err(e) => {
            tracing::error!(error = %e, "Script error");
            output.send(Response::Err(e.to_descriptor())).await?;
            return Ok(signal_exit(&mut control, SCRIPT_ERROR_EXIT).await);
        }
    };

    control
        .send(ControlSignal::Diagnostic(format!(
            "scriptbridge-peer: host pid {}, {} function(s)",
            program.option("host_pid").unwrap_or("?"),
            program.functions.len()
        )))
        .await?;

    let identity = format!(
        "scriptbridge-peer {SCRIPTBRIDGE_VERSION} pid {}",
        std::process::id()
    );
    output.send(Response::Ok(identity)).await?;

    let mut peer = Peer { program };

    let autoexec = std::mem::take(&mut peer.program.autoexec);
    for name in autoexec {
        match peer.invoke(CommandKind::CallMain, &name, &[]).await {
            Outcome::Reply(frames) => {
                let failed = frames.iter().any(|f| matches!(f, Response::Err(_)));
                for frame in frames {
                    if failed || !matches!(frame, Response::Ok(_)) {
                        output.send(frame).await?;
                    }
                }
                if failed {
                    return Ok(signal_exit(&mut control, SCRIPT_ERROR_EXIT).await);
                }
            }
            Outcome::Exit(code) => return Ok(signal_exit(&mut control, code).await),
            Outcome::Crash => return Ok(CRASH_EXIT),
        }
    }

    output.send(Response::Ok("Initialized".to_string())).await?;

    // Command loop
    loop {
        let line = match input.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(e),
            None => {
                tracing::debug!("Host closed stdin");
                return Ok(signal_exit(&mut control, 0).await);
            }
        };
        let line = String::from_utf8_lossy(&line);

        let cmd = match Command::parse_line(&line) {
            Ok(Parsed::Frame(cmd)) => cmd,
            Ok(Parsed::Block { .. }) => continue,
            Err(e) => {
                output
                    .send(Response::Err(ErrorDescriptor::new(
                        "ProtocolError",
                        e.to_string(),
                    )))
                    .await?;
                continue;
            }
        };

        tracing::trace!(kind = cmd.kind.as_str(), target = %cmd.target, "Command");
        match peer.dispatch(cmd).await {
            Outcome::Reply(frames) => {
                for frame in frames {
                    output.send(frame).await?;
                }
            }
            Outcome::Exit(code) => {
                let code = signal_exit(&mut control, code).await;
                let _ = output.send(Response::Exit(Some(code))).await;
                return Ok(code);
            }
            Outcome::Crash => return Ok(CRASH_EXIT),
        }
    }
}
