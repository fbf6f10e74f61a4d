//! Run one function of a script through a peer and print the result as JSON.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process;

use anyhow::Context;

use scriptbridge::logging::init_tracing;
use scriptbridge::{Script, Session, SessionConfig, Value, value};

struct Args {
    script: PathBuf,
    interpreter: Option<PathBuf>,
    defines: HashMap<String, String>,
    main_route: bool,
    raw: bool,
    function: String,
    call_args: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let parsed = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!(
                "Usage: scriptbridge <script> [--interpreter <path>] [--define KEY=VALUE]... \
                 [--main] [--raw] <function> [args]..."
            );
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <script>                Script file loaded after the framework bootstrap");
            eprintln!("  <function>              Function to invoke");
            eprintln!("  [args]...               Arguments; numbers are sent as numbers");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --interpreter <path>    Peer executable [default: $SCRIPTBRIDGE_INTERPRETER]");
            eprintln!("  --define KEY=VALUE      Substitute {{{{KEY}}}} in the script");
            eprintln!("  --main                  Dispatch on the peer's main thread");
            eprintln!("  --raw                   Print the result text without type inference");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(parsed).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut script: Option<PathBuf> = None;
    let mut interpreter = None;
    let mut defines = HashMap::new();
    let mut main_route = false;
    let mut raw = false;
    let mut positional = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--interpreter" => {
                i += 1;
                interpreter = Some(PathBuf::from(
                    args.get(i).ok_or("--interpreter requires a value")?,
                ));
            }
            "--define" => {
                i += 1;
                let def = args.get(i).ok_or("--define requires KEY=VALUE")?;
                let (key, value) = def
                    .split_once('=')
                    .ok_or_else(|| format!("invalid --define {def:?}, expected KEY=VALUE"))?;
                defines.insert(key.to_string(), value.to_string());
            }
            "--main" => main_route = true,
            "--raw" => raw = true,
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => {
                if script.is_none() {
                    script = Some(PathBuf::from(arg));
                } else {
                    positional.push(arg.to_string());
                }
            }
        }
        i += 1;
    }

    let script = script.ok_or("missing required argument: <script>")?;
    let mut positional = positional.into_iter();
    let function = positional
        .next()
        .ok_or("missing required argument: <function>")?;
    if function.is_empty() {
        return Err("<function> must not be empty".to_string());
    }

    Ok(Args {
        script,
        interpreter,
        defines,
        main_route,
        raw,
        function,
        call_args: positional.collect(),
    })
}

async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = match args.interpreter {
        Some(path) => SessionConfig::new(path),
        None => SessionConfig::from_env().context("no interpreter given")?,
    };
    if let Ok(dir) = std::env::current_dir() {
        config = config.with_working_dir(dir);
    }

    let defines = (!args.defines.is_empty()).then_some(&args.defines);
    let script = Script::from_file(&args.script, defines)?;

    let call_args: Vec<Value> = args
        .call_args
        .iter()
        .map(|a| value::decode(a, false))
        .collect();

    let mut session = Session::start(config, script).await?;

    let result = match (args.main_route, args.raw) {
        (false, false) => session.f(&args.function, &call_args).await,
        (true, false) => session.f_main(&args.function, &call_args).await,
        (false, true) => session.f_raw(&args.function, &call_args).await.map(Value::Str),
        (true, true) => session
            .f_raw_main(&args.function, &call_args)
            .await
            .map(Value::Str),
    };

    let code = session.shutdown().await;
    tracing::debug!(%code, "Peer stopped");

    let value = result?;
    println!("{}", serde_json::to_string(&value)?);
    Ok(())
}
