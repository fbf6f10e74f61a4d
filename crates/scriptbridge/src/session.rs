//! Session lifecycle: start, typed operations, shutdown.
//!
//! Flow:
//! 1. Render the framework bootstrap and validate the user script
//! 2. Stage the interpreter if requested, spawn it, write bootstrap + script
//! 3. Handshake: identity, then `Initialized`
//! 4. Serve call/get/set requests one at a time
//! 5. On exit or shutdown: request exit, wait, escalate to kill

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::Instrument;

use crate::bridge::protocol::{CommandKind, SEPARATOR};
use crate::bridge::transport::{PeerTransport, SpawnSpec};
use crate::config::SessionConfig;
use crate::engine::{ProtocolEngine, SourceMap};
use crate::error::{BridgeError, ConfigError, ExitCode, Result};
use crate::script::{Script, check_no_marker, render_template};
use crate::value::{self, Value};
use crate::version::VersionInfo;

/// Unique identifier for a session, used in log spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A running peer and the single request channel to it.
///
/// Every operation takes `&mut self`, so at most one request is in flight.
/// Wrap the session in a `tokio::sync::Mutex` to share it between tasks.
pub struct Session {
    id: SessionId,
    engine: ProtocolEngine,
    shutdown_grace: Duration,
    version: VersionInfo,
    span: tracing::Span,
}

impl Session {
    pub async fn start(config: SessionConfig, script: Script) -> Result<Self> {
        let id = SessionId::new();
        let span = tracing::info_span!("session", session_id = %id);
        Self::start_in(id, span.clone(), config, script)
            .instrument(span)
            .await
    }

    async fn start_in(
        id: SessionId,
        span: tracing::Span,
        config: SessionConfig,
        script: Script,
    ) -> Result<Self> {
        script.validate()?;

        if let Some(dir) = &config.working_dir
            && !dir.is_dir()
        {
            return Err(ConfigError::WorkingDir(dir.clone()).into());
        }
        let working_dir = match &config.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        };

        let framework = render_framework(&config.bootstrap, &working_dir)?;

        let program = match &config.execute_from {
            Some(dir) => stage_interpreter(&config.interpreter, dir)?,
            None => config.interpreter.clone(),
        };

        let spec = SpawnSpec {
            program,
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            process_group: config.kill_process_tree,
        };

        let mut bootstrap = framework;
        let bootstrap_lines = bootstrap.lines().count() as u32;
        if !bootstrap.is_empty() && !bootstrap.ends_with('\n') {
            bootstrap.push('\n');
        }
        bootstrap.push_str(script.text());

        let transport = PeerTransport::spawn(config.spawner.as_ref(), &spec, &bootstrap).await?;
        let source_map = SourceMap {
            bootstrap_lines,
            script_path: script.path().map(Path::to_path_buf),
        };
        let mut engine = ProtocolEngine::new(transport, source_map, config.on_warning);

        let identity = engine.handshake().await.map_err(|e| match e {
            BridgeError::Peer(e) | BridgeError::MainThreadRequired(e) => BridgeError::Startup(e),
            other => other,
        })?;
        tracing::info!(%identity, pid = engine.transport().pid(), "Session ready");

        Ok(Self {
            id,
            engine,
            shutdown_grace: config.shutdown_grace,
            version: VersionInfo::new().with_peer(identity),
            span,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn version(&self) -> &VersionInfo {
        &self.version
    }

    pub fn pid(&self) -> Option<u32> {
        self.engine.transport().pid()
    }

    /// How the peer ended, once it has.
    pub fn exit_code(&self) -> Option<ExitCode> {
        self.engine.exit_code()
    }

    pub fn is_running(&mut self) -> bool {
        self.poll().is_ok()
    }

    /// Non-blocking check for an unsolicited exit.
    pub fn poll(&mut self) -> Result<()> {
        self.engine.poll()
    }

    async fn request(
        &mut self,
        kind: CommandKind,
        target: &str,
        args: &[Value],
    ) -> Result<String> {
        if let Some(code) = self.engine.exit_code() {
            return Err(BridgeError::PeerExit(code));
        }
        let span = self.span.clone();
        self.engine.request(kind, target, args).instrument(span).await
    }

    /// Invoke `name`, discarding its result.
    pub async fn call(&mut self, name: &str, args: &[Value]) -> Result<()> {
        self.request(CommandKind::Call, name, args).await.map(drop)
    }

    /// [`Session::call`] dispatched on the peer's main thread.
    pub async fn call_main(&mut self, name: &str, args: &[Value]) -> Result<()> {
        self.request(CommandKind::CallMain, name, args)
            .await
            .map(drop)
    }

    /// Invoke `name` and infer the type of its result.
    pub async fn f(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        let payload = self.request(CommandKind::Func, name, args).await?;
        Ok(value::decode(&payload, false))
    }

    pub async fn f_main(&mut self, name: &str, args: &[Value]) -> Result<Value> {
        let payload = self.request(CommandKind::FuncMain, name, args).await?;
        Ok(value::decode(&payload, false))
    }

    /// Invoke `name` and return its result text unchanged.
    pub async fn f_raw(&mut self, name: &str, args: &[Value]) -> Result<String> {
        self.request(CommandKind::Func, name, args).await
    }

    pub async fn f_raw_main(&mut self, name: &str, args: &[Value]) -> Result<String> {
        self.request(CommandKind::FuncMain, name, args).await
    }

    /// Read a global variable, inferring its type.
    pub async fn get(&mut self, name: &str) -> Result<Value> {
        let payload = self.request(CommandKind::Get, name, &[]).await?;
        Ok(value::decode(&payload, false))
    }

    pub async fn get_raw(&mut self, name: &str) -> Result<String> {
        self.request(CommandKind::GetRaw, name, &[]).await
    }

    /// Assign a global variable. Returns once the peer has stored it.
    pub async fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.request(CommandKind::Set, name, &[value.into()])
            .await
            .map(drop)
    }

    pub async fn set_raw(&mut self, name: &str, text: &str) -> Result<()> {
        self.request(CommandKind::SetRaw, name, &[Value::from(text)])
            .await
            .map(drop)
    }

    /// Ask the peer to exit with `code` and wait for it (bounded by the
    /// shutdown grace). Returns how the peer ended.
    pub async fn exit(&mut self, code: i32) -> ExitCode {
        self.terminate(Some(code)).await
    }

    /// Graceful exit with the peer's default code, escalating to a kill.
    /// Safe to call more than once.
    pub async fn shutdown(&mut self) -> ExitCode {
        self.terminate(None).await
    }

    async fn terminate(&mut self, code: Option<i32>) -> ExitCode {
        let span = self.span.clone();
        let grace = self.shutdown_grace;
        self.engine.terminate(code, grace).instrument(span).await
    }
}

fn render_framework(template: &str, working_dir: &Path) -> Result<String> {
    let host_pid = std::process::id().to_string();
    let separator_code = u32::from(SEPARATOR).to_string();
    let working_dir = working_dir.display().to_string();

    let framework = render_template(template, |name| match name {
        "SEPARATOR_CODE" => Some(separator_code.clone()),
        "HOST_PID" => Some(host_pid.clone()),
        "WORKING_DIR" => Some(working_dir.clone()),
        _ => None,
    })?;
    check_no_marker(&framework)?;
    Ok(framework)
}

/// Hard-link (or copy) the interpreter into `dir`, reusing an existing copy
/// whose modification time matches the source.
fn stage_interpreter(interpreter: &Path, dir: &Path) -> Result<PathBuf, ConfigError> {
    let staging = |source: io::Error| ConfigError::Staging {
        dir: dir.to_path_buf(),
        source,
    };

    fs::create_dir_all(dir).map_err(staging)?;
    let name = interpreter.file_name().ok_or_else(|| {
        staging(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interpreter path has no file name",
        ))
    })?;
    let target = dir.join(name);
    let modified = fs::metadata(interpreter)
        .and_then(|m| m.modified())
        .map_err(staging)?;

    if let Ok(existing) = fs::metadata(&target) {
        if existing.modified().ok() == Some(modified) {
            tracing::debug!(target = %target.display(), "Reusing staged interpreter");
            return Ok(target);
        }
        tracing::debug!(target = %target.display(), "Replacing stale staged interpreter");
        fs::remove_file(&target).map_err(staging)?;
    }

    if let Err(e) = fs::hard_link(interpreter, &target) {
        tracing::debug!(error = %e, "Hard link failed, copying interpreter");
        fs::copy(interpreter, &target).map_err(staging)?;
        fs::File::options()
            .write(true)
            .open(&target)
            .and_then(|f| f.set_modified(modified))
            .map_err(staging)?;
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framework_placeholders_resolve() {
        let out = render_framework(
            "option separator {{SEPARATOR_CODE}}\noption working_dir {{WORKING_DIR}}\n",
            Path::new("/work"),
        )
        .unwrap();
        assert_eq!(out, "option separator 3\noption working_dir /work\n");

        let pid = render_framework("{{HOST_PID}}", Path::new("/")).unwrap();
        assert_eq!(pid, std::process::id().to_string());
    }

    #[test]
    fn framework_rejects_unknown_placeholder() {
        let err = render_framework("{{NOT_BUILT_IN}}", Path::new("/")).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Config(ConfigError::UnresolvedPlaceholder { .. })
        ));
    }

    #[test]
    fn staging_links_once_and_replaces_stale_copies() {
        let src_dir = tempfile::tempdir().unwrap();
        let stage_dir = tempfile::tempdir().unwrap();
        let interpreter = src_dir.path().join("peer-bin");
        fs::write(&interpreter, b"#!/bin/true\n").unwrap();

        let staged = stage_interpreter(&interpreter, stage_dir.path()).unwrap();
        assert_eq!(staged, stage_dir.path().join("peer-bin"));
        assert_eq!(fs::read(&staged).unwrap(), b"#!/bin/true\n");

        // Same modification time: reused as is.
        let again = stage_interpreter(&interpreter, stage_dir.path()).unwrap();
        assert_eq!(again, staged);

        // A stale file with a different mtime gets replaced.
        fs::remove_file(&staged).unwrap();
        fs::write(&staged, b"stale").unwrap();
        let old = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        fs::File::options()
            .write(true)
            .open(&staged)
            .unwrap()
            .set_modified(old)
            .unwrap();
        stage_interpreter(&interpreter, stage_dir.path()).unwrap();
        assert_eq!(fs::read(&staged).unwrap(), b"#!/bin/true\n");
    }

    #[test]
    fn staging_reports_missing_interpreter() {
        let stage_dir = tempfile::tempdir().unwrap();
        let err = stage_interpreter(Path::new("/no/such/peer"), stage_dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Staging { .. }));
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }
}
