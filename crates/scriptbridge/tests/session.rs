//! End-to-end tests against the reference peer binary.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use scriptbridge::{
    BridgeError, CommandSpawner, ConfigError, ExitCode, PeerSpawner, Script, Session,
    SessionConfig, SpawnError, SpawnSpec, UnsupportedValueError, Value, Warning,
};
use tokio::process::Child;

const PEER: &str = env!("CARGO_BIN_EXE_scriptbridge-peer");

const FUNCTIONS: &str = "\
func Echo echo
func Join concat
func Count count
func Explode throw boom|Exploding|details
func OnlyMain main_only done
func Careful warn careful
func Quit exit 7
func Boom crash
func Lines lines 3
func Where cwd
func Nap sleep 50
";

fn peer_config() -> SessionConfig {
    SessionConfig::new(PEER)
}

async fn start(script: &str) -> Session {
    Session::start(peer_config(), Script::new(script))
        .await
        .expect("session starts")
}

fn collecting(config: SessionConfig) -> (SessionConfig, Arc<Mutex<Vec<Warning>>>) {
    let warnings = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&warnings);
    let config = config.with_warning_handler(move |w| sink.lock().unwrap().push(w.clone()));
    (config, warnings)
}

fn s(text: &str) -> Value {
    Value::from(text)
}

struct CountingSpawner {
    spawned: AtomicUsize,
}

impl PeerSpawner for CountingSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> Result<Child, SpawnError> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        CommandSpawner.spawn(spec)
    }
}

#[tokio::test]
async fn handshake_reports_peer_identity() {
    let mut session = start("").await;

    let identity = session.version().peer.clone().unwrap();
    assert!(identity.starts_with("scriptbridge-peer "), "{identity}");
    assert!(identity.ends_with(&format!("pid {}", session.pid().unwrap())));
    assert!(session.is_running());

    assert_eq!(session.shutdown().await, ExitCode::Declared(0));
}

#[tokio::test]
async fn echo_on_both_routes() {
    let mut session = start(FUNCTIONS).await;

    assert_eq!(session.f("Echo", &[s("hi")]).await.unwrap(), s("hi"));
    assert_eq!(session.f_main("Echo", &[s("hi")]).await.unwrap(), s("hi"));
    assert_eq!(
        session.f("Echo", &[Value::Int(42)]).await.unwrap(),
        Value::Int(42)
    );
    assert_eq!(
        session.f("Echo", &[Value::Float(0.5)]).await.unwrap(),
        Value::Float(0.5)
    );
    assert_eq!(
        session.f("Join", &[s("a"), Value::Int(1), s("b")]).await.unwrap(),
        s("a1b")
    );
    assert_eq!(
        session.f("Count", &[s(""), s("")]).await.unwrap(),
        Value::Int(2)
    );

    session.call("Echo", &[s("ignored")]).await.unwrap();
    session.call_main("Echo", &[]).await.unwrap();
    session.shutdown().await;
}

#[tokio::test]
async fn set_then_get_observes_value() {
    let mut session = start("var preset hello\n").await;

    assert_eq!(session.get("preset").await.unwrap(), s("hello"));
    assert_eq!(session.get("never_set").await.unwrap(), s(""));

    session.set("x", 1).await.unwrap();
    assert_eq!(session.get("x").await.unwrap(), Value::Int(1));

    for i in 0..100i64 {
        session.set("counter", i).await.unwrap();
        assert_eq!(session.get("counter").await.unwrap(), Value::Int(i));
    }

    session.set("flag", true).await.unwrap();
    assert_eq!(session.get("flag").await.unwrap(), Value::Int(1));
    session.shutdown().await;
}

#[tokio::test]
async fn raw_and_inferred_reads() {
    let mut session = start(FUNCTIONS).await;

    session.set_raw("hex", "0x1F").await.unwrap();
    assert_eq!(session.get("hex").await.unwrap(), Value::Int(31));
    assert_eq!(session.get_raw("hex").await.unwrap(), "0x1F");

    assert_eq!(session.f("Echo", &[s("0x1F")]).await.unwrap(), Value::Int(31));
    assert_eq!(session.f_raw("Echo", &[s("0x1F")]).await.unwrap(), "0x1F");
    assert_eq!(session.f_raw_main("Echo", &[s("007")]).await.unwrap(), "007");

    session.set("pi", 3.25).await.unwrap();
    assert_eq!(session.get_raw("pi").await.unwrap(), "3.25");
    assert_eq!(session.get("pi").await.unwrap(), Value::Float(3.25));
    session.shutdown().await;
}

#[tokio::test]
async fn unicode_roundtrips() {
    let mut session = start(FUNCTIONS).await;

    for text in ["ünïcödé", "🙂", "𝄞 clef", "中文字符", "mixed 🙂 and \u{10FFFF}"] {
        assert_eq!(session.f("Echo", &[s(text)]).await.unwrap(), s(text));
        session.set("u", text).await.unwrap();
        assert_eq!(session.get_raw("u").await.unwrap(), text);
    }
    session.shutdown().await;
}

#[tokio::test]
async fn newlines_and_backslashes_roundtrip() {
    let mut session = start(FUNCTIONS).await;

    for text in [
        "a\nb",
        "a\r\nb",
        "a\rb",
        "\n",
        "\n\n",
        "trailing\n",
        "trailing\\",
        "\\n is not a newline",
        "\\\\",
    ] {
        assert_eq!(
            session.f_raw("Echo", &[s(text)]).await.unwrap(),
            text,
            "echo {text:?}"
        );
        session.set_raw("v", text).await.unwrap();
        assert_eq!(session.get_raw("v").await.unwrap(), text, "get {text:?}");
    }

    assert_eq!(
        session.f_raw("Lines", &[]).await.unwrap(),
        "line 1\nline 2\nline 3"
    );
    session.shutdown().await;
}

#[tokio::test]
async fn long_payloads() {
    let mut session = start(FUNCTIONS).await;

    let long: String = "0123456789abcdef".repeat(64 * 1024);
    assert_eq!(session.f_raw("Echo", &[s(&long)]).await.unwrap(), long);

    let many_lines = "row\n".repeat(10_000);
    assert_eq!(
        session.f_raw("Echo", &[s(&many_lines)]).await.unwrap(),
        many_lines
    );
    session.shutdown().await;
}

#[tokio::test]
async fn unsupported_values_are_rejected_before_sending() {
    let mut session = start(FUNCTIONS).await;

    let err = session.f("Echo", &[s("a\u{3}b")]).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::UnsupportedValue(UnsupportedValueError::Delimiter)
    ));

    let err = session.f("Echo", &[s("nul\0")]).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::UnsupportedValue(UnsupportedValueError::NulCharacter)
    ));

    let err = session.set("x", f64::NAN).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::UnsupportedValue(UnsupportedValueError::NaN)
    ));

    let err = session.set("x", f64::INFINITY).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::UnsupportedValue(UnsupportedValueError::Infinite(_))
    ));

    // Nothing reached the peer, so the session is still in step.
    assert_eq!(session.f("Echo", &[s("after")]).await.unwrap(), s("after"));
    session.shutdown().await;
}

#[tokio::test]
async fn precision_loss_is_reported() {
    let (config, warnings) = collecting(peer_config());
    let mut session = Session::start(config, Script::new(FUNCTIONS))
        .await
        .unwrap();

    let third = session
        .f("Echo", &[Value::Float(1.0 / 3.0)])
        .await
        .unwrap();
    assert_eq!(third, Value::Float(0.333333));
    {
        let seen = warnings.lock().unwrap();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            Warning::PrecisionLoss(w) => {
                assert_eq!(w.encoded, "0.333333");
                assert_eq!(w.value, 1.0 / 3.0);
            }
            other => panic!("unexpected warning {other:?}"),
        }
    }

    let half = session.f("Echo", &[Value::Float(0.5)]).await.unwrap();
    assert_eq!(half, Value::Float(0.5));
    assert_eq!(warnings.lock().unwrap().len(), 1);
    session.shutdown().await;
}

#[tokio::test]
async fn user_exception_fields_propagate() {
    let mut session = start(&format!("\n# helpers\n{FUNCTIONS}")).await;

    let err = session.f("Explode", &[]).await.unwrap_err();
    let BridgeError::Peer(e) = err else {
        panic!("expected a peer exception, got {err:?}");
    };
    insta::assert_json_snapshot!(e.descriptor(), @r#"
    {
      "kind": "UserException",
      "message": "boom",
      "context": "Exploding",
      "extra": "details",
      "source_file": "<stdin>",
      "source_line": 6
    }
    "#);

    // Recoverable: the session keeps working.
    assert_eq!(session.f("Echo", &[s("still here")]).await.unwrap(), s("still here"));
    session.shutdown().await;
}

#[tokio::test]
async fn exception_location_uses_script_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "var greeting {{{{GREETING}}}}\nfunc Explode throw {{{{MESSAGE}}}}|Exploding|\n"
    )
    .unwrap();

    let vars: HashMap<String, String> = [
        ("GREETING".to_string(), "hi".to_string()),
        ("MESSAGE".to_string(), "from file".to_string()),
    ]
    .into_iter()
    .collect();
    let script = Script::from_file(file.path(), Some(&vars)).unwrap();
    let mut session = Session::start(peer_config(), script).await.unwrap();

    assert_eq!(session.get("greeting").await.unwrap(), s("hi"));

    let err = session.f("Explode", &[]).await.unwrap_err();
    let e = err.peer_exception().unwrap();
    assert_eq!(e.message(), "from file");
    assert_eq!(e.source_line(), Some(2));
    assert_eq!(Path::new(e.source_file()), file.path());
    session.shutdown().await;
}

#[tokio::test]
async fn unknown_function_is_reported() {
    let mut session = start(FUNCTIONS).await;

    let err = session.f("Nope", &[]).await.unwrap_err();
    let e = err.peer_exception().unwrap();
    assert_eq!(e.kind(), "FunctionNotFound");
    assert_eq!(e.message(), "Nope");
    assert_eq!(e.source_line(), None);
    assert!(!err.is_terminal());

    assert!(session.call("Nope", &[]).await.is_err());
    assert!(session.is_running());
    session.shutdown().await;
}

#[tokio::test]
async fn main_thread_only_functions() {
    let mut session = start(FUNCTIONS).await;

    let err = session.f("OnlyMain", &[]).await.unwrap_err();
    let BridgeError::MainThreadRequired(e) = err else {
        panic!("expected MainThreadRequired, got {err:?}");
    };
    assert!(e.message().starts_with("0x8001010D"), "{}", e.message());
    assert_eq!(e.context(), "OnlyMain");

    assert!(matches!(
        session.call("OnlyMain", &[]).await,
        Err(BridgeError::MainThreadRequired(_))
    ));

    assert_eq!(session.f_main("OnlyMain", &[]).await.unwrap(), s("done"));
    session.call_main("OnlyMain", &[]).await.unwrap();
    session.shutdown().await;
}

#[tokio::test]
async fn peer_warnings_reach_the_handler() {
    let (config, warnings) = collecting(peer_config());
    let mut session = Session::start(config, Script::new(FUNCTIONS))
        .await
        .unwrap();

    assert_eq!(session.f("Careful", &[]).await.unwrap(), s("careful"));
    assert_eq!(
        *warnings.lock().unwrap(),
        vec![Warning::Peer {
            name: "PeerWarning".into(),
            message: "careful".into(),
        }]
    );
    session.shutdown().await;
}

#[tokio::test]
async fn crash_mid_call_is_detected() {
    let mut session = start(FUNCTIONS).await;

    let err = session.f("Boom", &[]).await.unwrap_err();
    assert!(matches!(
        err,
        BridgeError::PeerExit(ExitCode::Ungraceful(Some(99)))
    ));

    // Every later operation reports the same exit.
    let expected = ExitCode::Ungraceful(Some(99));
    assert_eq!(session.get("x").await.unwrap_err().exit_code(), Some(expected));
    assert_eq!(session.set("x", 1).await.unwrap_err().exit_code(), Some(expected));
    assert_eq!(session.call("Echo", &[]).await.unwrap_err().exit_code(), Some(expected));
    assert_eq!(session.poll().unwrap_err().exit_code(), Some(expected));
    assert!(!session.is_running());
    assert_eq!(session.shutdown().await, expected);
}

#[cfg(unix)]
fn kill_peer(session: &Session) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = session.pid().unwrap();
    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn out_of_band_kill_is_seen_by_poll() {
    let mut session = start(FUNCTIONS).await;
    kill_peer(&session);

    let deadline = Instant::now() + Duration::from_secs(5);
    let code = loop {
        match session.poll() {
            Ok(()) => {
                assert!(Instant::now() < deadline, "peer death not observed");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(BridgeError::PeerExit(code)) => break code,
            Err(e) => panic!("unexpected error {e:?}"),
        }
    };
    assert_eq!(code, ExitCode::Ungraceful(None));
    assert!(matches!(
        session.get("x").await,
        Err(BridgeError::PeerExit(ExitCode::Ungraceful(None)))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn out_of_band_kill_is_seen_by_next_request() {
    let mut session = start(FUNCTIONS).await;
    kill_peer(&session);

    assert!(matches!(
        session.f("Echo", &[s("anyone?")]).await,
        Err(BridgeError::PeerExit(ExitCode::Ungraceful(None)))
    ));
    assert!(matches!(
        session.set("x", 2).await,
        Err(BridgeError::PeerExit(_))
    ));
}

/// Runs the peer behind a shell whose background child inherits the peer's
/// stdout and stderr.
#[cfg(unix)]
struct LingeringChildSpawner;

#[cfg(unix)]
impl PeerSpawner for LingeringChildSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> Result<Child, SpawnError> {
        let mut shell = spec.clone();
        shell.program = "sh".into();
        shell.args = vec![
            "-c".to_string(),
            "sleep 20 & exec \"$0\"".to_string(),
            spec.program.display().to_string(),
        ];
        CommandSpawner.spawn(&shell)
    }
}

#[cfg(unix)]
#[tokio::test]
async fn crash_is_detected_while_a_descendant_holds_the_pipes() {
    let config = peer_config()
        .with_spawner(Arc::new(LingeringChildSpawner))
        .with_kill_process_tree(true);
    let mut session = Session::start(config, Script::new(FUNCTIONS)).await.unwrap();
    assert_eq!(session.f("Echo", &[s("up")]).await.unwrap(), s("up"));

    let result = tokio::time::timeout(Duration::from_secs(5), session.f("Boom", &[]))
        .await
        .expect("call returns once the peer is gone");
    assert!(matches!(
        result,
        Err(BridgeError::PeerExit(ExitCode::Ungraceful(Some(99))))
    ));
    assert!(matches!(session.poll(), Err(BridgeError::PeerExit(_))));
    assert_eq!(session.shutdown().await, ExitCode::Ungraceful(Some(99)));
}

/// Greets like a peer, announces exit code 5 on stderr, then keeps running.
#[cfg(unix)]
const SLOW_EXIT_PEER: &str = "printf 'OK\\003fake peer\\nOK\\003Initialized\\n'; \
                              sleep 1; printf 'EXIT\\003%s\\n' 5 >&2; exec sleep 30";

#[cfg(unix)]
#[tokio::test]
async fn poll_reports_exit_signal_before_the_process_ends() {
    let config = SessionConfig::new("sh")
        .with_args(["-c", SLOW_EXIT_PEER])
        .with_shutdown_grace(Duration::from_millis(200));
    let mut session = Session::start(config, Script::new("")).await.unwrap();
    assert_eq!(session.version().peer.as_deref(), Some("fake peer"));

    let deadline = Instant::now() + Duration::from_secs(3);
    let code = loop {
        match session.poll() {
            Ok(()) => {
                assert!(Instant::now() < deadline, "exit signal not reported");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(BridgeError::PeerExit(code)) => break code,
            Err(e) => panic!("unexpected error {e:?}"),
        }
    };
    assert_eq!(code, ExitCode::Declared(5));
    assert!(!session.is_running());
    assert!(matches!(
        session.get("x").await,
        Err(BridgeError::PeerExit(ExitCode::Declared(5)))
    ));

    // Shutdown reaps the still-running process and keeps the declared code.
    assert_eq!(session.shutdown().await, ExitCode::Declared(5));
}

#[tokio::test]
async fn graceful_exit_inside_a_call() {
    let mut session = start(FUNCTIONS).await;

    let err = session.f("Quit", &[]).await.unwrap_err();
    assert!(matches!(err, BridgeError::PeerExit(ExitCode::Declared(7))));
    assert!(err.is_terminal());
    assert_eq!(session.shutdown().await, ExitCode::Declared(7));
}

#[tokio::test]
async fn exit_with_code_is_idempotent() {
    let mut session = start(FUNCTIONS).await;

    // A call that is still sleeping is not interrupted by poll.
    session.call("Nap", &[]).await.unwrap();
    session.poll().unwrap();

    assert_eq!(session.exit(3).await, ExitCode::Declared(3));
    assert_eq!(session.shutdown().await, ExitCode::Declared(3));
    assert_eq!(session.exit(5).await, ExitCode::Declared(3));
    assert!(matches!(
        session.get("x").await,
        Err(BridgeError::PeerExit(ExitCode::Declared(3)))
    ));
}

#[tokio::test]
async fn placeholder_errors_prevent_spawning() {
    let spawner = Arc::new(CountingSpawner {
        spawned: AtomicUsize::new(0),
    });

    let config = peer_config()
        .with_spawner(spawner.clone())
        .with_bootstrap("option separator {{SEPARATOR_CODE}}\noption mood {{MOOD}}\n");
    let err = Session::start(config, Script::new("")).await.err().unwrap();
    assert!(matches!(
        err,
        BridgeError::Config(ConfigError::UnresolvedPlaceholder { ref name }) if name == "MOOD"
    ));

    let config = peer_config().with_spawner(spawner.clone());
    let err = Session::start(config, Script::new("var a 1\n\u{3}\u{3}\u{3}\nvar b 2\n"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BridgeError::Config(ConfigError::ReservedMarker)));

    let config = peer_config()
        .with_spawner(spawner.clone())
        .with_working_dir("/definitely/not/a/dir");
    let err = Session::start(config, Script::new("")).await.err().unwrap();
    assert!(matches!(err, BridgeError::Config(ConfigError::WorkingDir(_))));

    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 0);

    // Sanity check: the same spawner does start a valid session.
    let mut session = Session::start(peer_config().with_spawner(spawner.clone()), Script::new(""))
        .await
        .unwrap();
    assert_eq!(spawner.spawned.load(Ordering::SeqCst), 1);
    session.shutdown().await;
}

#[tokio::test]
async fn script_errors_fail_the_handshake() {
    let err = Session::start(peer_config(), Script::new("var ok 1\nfunc Broken nonsense\n"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BridgeError::Startup(_)));
    assert!(err.is_terminal());
    let e = err.peer_exception().expect("peer exception");
    assert_eq!(e.kind(), "ScriptError");
    assert_eq!(e.source_line(), Some(2));
    assert!(e.message().contains("nonsense"), "{}", e.message());
}

#[tokio::test]
async fn failing_autoexec_fails_the_handshake() {
    let ok = Session::start(peer_config(), Script::new("func Init const ready\nautoexec Init\n"))
        .await;
    ok.unwrap().shutdown().await;

    let err = Session::start(
        peer_config(),
        Script::new("func Init throw setup broke||\nautoexec Init\n"),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, BridgeError::Startup(_)));
    let e = err.peer_exception().expect("peer exception");
    assert_eq!(e.message(), "setup broke");
    assert_eq!(e.source_line(), Some(1));
}

#[tokio::test]
async fn missing_interpreter_is_a_spawn_error() {
    let err = Session::start(
        SessionConfig::new("/definitely/not/an/interpreter"),
        Script::new(""),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, BridgeError::Spawn(SpawnError::Spawn(_))));
}

#[tokio::test]
async fn working_dir_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = Session::start(
        peer_config().with_working_dir(dir.path()),
        Script::new(FUNCTIONS),
    )
    .await
    .unwrap();

    let cwd = session.f_raw("Where", &[]).await.unwrap();
    assert_eq!(
        Path::new(&cwd).canonicalize().unwrap(),
        dir.path().canonicalize().unwrap()
    );
    session.shutdown().await;
}

#[tokio::test]
async fn interpreter_runs_from_staging_dir() {
    let stage = tempfile::tempdir().unwrap();
    let config = peer_config().with_execute_from(stage.path());

    let mut session = Session::start(config, Script::new(FUNCTIONS)).await.unwrap();
    assert!(stage.path().join("scriptbridge-peer").exists());
    assert_eq!(session.f("Echo", &[Value::Int(5)]).await.unwrap(), Value::Int(5));
    session.shutdown().await;

    // The staged copy is reused on the next start.
    let config = SessionConfig::new(PEER).with_execute_from(stage.path());
    let mut session = Session::start(config, Script::new("")).await.unwrap();
    session.shutdown().await;
}

#[tokio::test]
async fn sessions_have_distinct_ids() {
    let mut a = start("").await;
    let mut b = start("").await;
    assert_ne!(a.id(), b.id());
    a.shutdown().await;
    b.shutdown().await;
}
