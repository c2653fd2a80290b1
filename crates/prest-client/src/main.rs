use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use prest_bridge::codec::StrCodec;
use prest_bridge::{
    CancellationToken, Connection, CoreConfig, ProgressTracker, VersionInfo, Workspace,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
Usage: prest-client [--core <path>] [--transcript <dir>] <command>

Commands:
  echo <text>          Round-trip <text> through the core
  crash                Ask the core to panic
  fail                 Ask the core to report a failure
  inspect <workspace>  Print the datasets of a workspace file as JSON
  version              Print version information as JSON

Options:
  --core <path>        Core executable [default: $PREST_CORE, then prest-core next to cwd or this binary]
  --transcript <dir>   Record raw requests/responses into <dir>";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Echo(String),
    Crash,
    Fail,
    Inspect(PathBuf),
    Version,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Options {
    core: Option<PathBuf>,
    transcript: Option<PathBuf>,
    command: Command,
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(options).await {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut core = None;
    let mut transcript = None;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--core" => {
                i += 1;
                core = Some(PathBuf::from(args.get(i).ok_or("--core requires a value")?));
            }
            "--transcript" => {
                i += 1;
                transcript = Some(PathBuf::from(
                    args.get(i).ok_or("--transcript requires a value")?,
                ));
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') && positional.is_empty() => {
                return Err(format!("unknown flag: {arg}"));
            }
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let (name, rest) = positional
        .split_first()
        .ok_or("missing required argument: <command>")?;
    let command = match (name.as_str(), rest) {
        ("echo", [text]) => Command::Echo(text.clone()),
        ("inspect", [path]) => Command::Inspect(PathBuf::from(path)),
        ("crash", []) => Command::Crash,
        ("fail", []) => Command::Fail,
        ("version", []) => Command::Version,
        ("echo", _) => return Err("echo takes exactly one argument: <text>".to_string()),
        ("inspect", _) => return Err("inspect takes exactly one argument: <workspace>".to_string()),
        ("crash" | "fail" | "version", _) => {
            return Err(format!("{name} takes no arguments"));
        }
        (other, _) => return Err(format!("unknown command: {other}")),
    };

    Ok(Options {
        core,
        transcript,
        command,
    })
}

/// `RUST_LOG` wins; otherwise `PREST_LOG` picks the level for our crates.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PREST_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "prest_bridge={level},prest_client={level},prest::core={level}"
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn core_config(options: &Options) -> anyhow::Result<CoreConfig> {
    let mut config = match &options.core {
        Some(path) => CoreConfig::new(path),
        None => CoreConfig::locate()?,
    };
    if let Some(dir) = &options.transcript {
        config = config.with_transcript(dir.join("requests.bin"), dir.join("responses.bin"));
    }
    Ok(config)
}

/// Cancel the token on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, cancelling");
            cancel.cancel();
        }
    });
    token
}

async fn run(options: Options) -> anyhow::Result<()> {
    match &options.command {
        Command::Inspect(path) => inspect(path),
        Command::Version => {
            let mut info = VersionInfo::new();
            if let Ok(config) = core_config(&options) {
                info = info.with_core(config.executable.display().to_string());
            }
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Command::Echo(_) | Command::Crash | Command::Fail => {
            let config = core_config(&options)?;
            let mut connection = Connection::start(config)
                .await
                .context("failed to start core")?;
            let result = call_core(&mut connection, &options.command).await;
            connection.shutdown().await;
            println!("{}", result?);
            Ok(())
        }
    }
}

async fn call_core(connection: &mut Connection, command: &Command) -> anyhow::Result<String> {
    let reply = match command {
        Command::Echo(text) => {
            let mut tracker = ProgressTracker::new(cancel_on_interrupt())
                .with_callback(|position, _| tracing::debug!(position, "Core progress"));
            connection
                .call("echo", &StrCodec, text, StrCodec, &mut tracker)
                .await?
        }
        Command::Crash => connection.crash().await?,
        Command::Fail => connection.fail().await?,
        Command::Inspect(_) | Command::Version => anyhow::bail!("not a core command"),
    };
    Ok(reply)
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let mut tracker = ProgressTracker::detached().with_callback(|position, work_size| {
        tracing::debug!(position, ?work_size, "Loading workspace")
    });
    let mut workspace = Workspace::new();
    workspace
        .load_from_file(path, &mut tracker)
        .with_context(|| format!("cannot load {}", path.display()))?;

    let summaries: Vec<_> = workspace.datasets.iter().map(|d| d.summary()).collect();
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}
