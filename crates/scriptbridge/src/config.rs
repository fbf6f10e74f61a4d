//! Session configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::transport::{CommandSpawner, PeerSpawner};
use crate::error::{ConfigError, WarningHandler, log_warning};
use crate::peer::FRAMEWORK;

pub const INTERPRETER_ENV: &str = "SCRIPTBRIDGE_INTERPRETER";
pub const SHUTDOWN_GRACE_ENV: &str = "SCRIPTBRIDGE_SHUTDOWN_GRACE_MS";

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct SessionConfig {
    pub interpreter: PathBuf,
    pub args: Vec<String>,
    /// Framework text sent ahead of the user script. Supports the built-in
    /// `{{SEPARATOR_CODE}}`, `{{HOST_PID}}` and `{{WORKING_DIR}}` placeholders.
    pub bootstrap: String,
    pub working_dir: Option<PathBuf>,
    /// Directory the interpreter is staged into and run from.
    pub execute_from: Option<PathBuf>,
    pub shutdown_grace: Duration,
    pub kill_process_tree: bool,
    pub spawner: Arc<dyn PeerSpawner>,
    pub on_warning: WarningHandler,
}

impl SessionConfig {
    pub fn new(interpreter: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            args: Vec::new(),
            bootstrap: FRAMEWORK.to_string(),
            working_dir: None,
            execute_from: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            kill_process_tree: false,
            spawner: Arc::new(CommandSpawner),
            on_warning: Arc::new(log_warning),
        }
    }

    /// Build from `SCRIPTBRIDGE_INTERPRETER` and `SCRIPTBRIDGE_SHUTDOWN_GRACE_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let interpreter = lookup(INTERPRETER_ENV)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingInterpreter)?;
        let mut config = Self::new(interpreter);

        if let Some(raw) = lookup(SHUTDOWN_GRACE_ENV) {
            let ms = raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidEnv {
                    var: SHUTDOWN_GRACE_ENV.to_string(),
                    value: raw.clone(),
                })?;
            config = config.with_shutdown_grace(Duration::from_millis(ms));
        }
        Ok(config)
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: impl Into<String>) -> Self {
        self.bootstrap = bootstrap.into();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_execute_from(mut self, dir: impl Into<PathBuf>) -> Self {
        self.execute_from = Some(dir.into());
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_kill_process_tree(mut self, enabled: bool) -> Self {
        self.kill_process_tree = enabled;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn PeerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_warning_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&crate::error::Warning) + Send + Sync + 'static,
    {
        self.on_warning = Arc::new(handler);
        self
    }
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("interpreter", &self.interpreter)
            .field("args", &self.args)
            .field("bootstrap_bytes", &self.bootstrap.len())
            .field("working_dir", &self.working_dir)
            .field("execute_from", &self.execute_from)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("kill_process_tree", &self.kill_process_tree)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn config_defaults() {
        let config = SessionConfig::new("/usr/bin/peer");
        assert_eq!(config.interpreter, PathBuf::from("/usr/bin/peer"));
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert!(!config.kill_process_tree);
        assert!(config.bootstrap.contains("{{SEPARATOR_CODE}}"));
        assert!(config.working_dir.is_none());
    }

    #[test]
    fn config_builder_pattern() {
        let config = SessionConfig::new("peer")
            .with_args(["--quiet"])
            .with_working_dir("/tmp")
            .with_execute_from("/opt/stage")
            .with_shutdown_grace(Duration::from_millis(250))
            .with_kill_process_tree(true)
            .with_bootstrap("option separator {{SEPARATOR_CODE}}\n");

        assert_eq!(config.args, vec!["--quiet".to_string()]);
        assert_eq!(config.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(config.execute_from, Some(PathBuf::from("/opt/stage")));
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
        assert!(config.kill_process_tree);
        assert_eq!(config.bootstrap, "option separator {{SEPARATOR_CODE}}\n");
    }

    #[test]
    fn config_from_lookup() {
        let config = SessionConfig::from_lookup(env(&[
            (INTERPRETER_ENV, "/bin/peer"),
            (SHUTDOWN_GRACE_ENV, "1500"),
        ]))
        .unwrap();
        assert_eq!(config.interpreter, PathBuf::from("/bin/peer"));
        assert_eq!(config.shutdown_grace, Duration::from_millis(1500));
    }

    #[test]
    fn config_from_lookup_requires_interpreter() {
        let err = SessionConfig::from_lookup(env(&[(INTERPRETER_ENV, "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingInterpreter));
    }

    #[test]
    fn config_from_lookup_rejects_bad_grace() {
        let err = SessionConfig::from_lookup(env(&[
            (INTERPRETER_ENV, "/bin/peer"),
            (SHUTDOWN_GRACE_ENV, "soon"),
        ]))
        .unwrap_err();
        insta::assert_snapshot!(
            err.to_string(),
            @r#"invalid value for SCRIPTBRIDGE_SHUTDOWN_GRACE_MS: "soon""#
        );
    }
}
