//! udfbox shell - load and invoke UDF binaries interactively.
//!
//! ```text
//! $ udfbox --sandbox off
//! > load ./my_udf 2
//! loaded 3f2a…  (2 workers)
//! > run 3f2a… hello
//! ok (13 bytes): Hello, world!
//! > delete 3f2a…
//! > quit
//! ```

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::mpsc::channel;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use udfbox::{
    BinarySource, CodeToken, Config, ExecuteRequest, ExecutionToken, SandboxMode, UdfService,
};

#[derive(Parser)]
#[command(name = "udfbox")]
#[command(about = "Interactive shell for the sandboxed UDF execution service")]
struct Cli {
    /// Read-only paths mounted into every worker sandbox.
    #[arg(long, default_values = ["/lib", "/lib64"])]
    mounts: Vec<PathBuf>,

    /// Sandbox mode: "on" expects an external monitor and strips
    /// capabilities, "off" applies namespaces and mounts only.
    #[arg(long, default_value = "on")]
    sandbox: String,

    /// Per-invocation deadline in seconds (0 = none).
    #[arg(long, default_value = "30")]
    timeout: u64,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let mode = match cli.sandbox.as_str() {
        "on" => SandboxMode::Gvisor,
        "off" => SandboxMode::Namespaces,
        other => bail!("unsupported --sandbox value {other:?}; expected on or off"),
    };
    let service = UdfService::new(Config::new().mounts(cli.mounts.clone()).sandbox_mode(mode))
        .context("failed to start service")?;
    let deadline = (cli.timeout > 0).then(|| Duration::from_secs(cli.timeout));

    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else { break };
        let line = line?;
        let args: Vec<&str> = line.split_whitespace().collect();
        match args.as_slice() {
            [] => {}
            ["quit" | "exit"] => break,
            ["help"] => help(),
            ["load", path, workers] => cmd_load(&service, path, workers, false),
            ["load", path, workers, "logs"] => cmd_load(&service, path, workers, true),
            ["run", token, payload @ ..] => {
                if let Some(token) = code_token(token) {
                    cmd_run(&service, token, payload, deadline);
                }
            }
            ["cancel", token] => {
                if let Some(token) = execution_token(token) {
                    service.cancel(&token);
                }
            }
            ["stats", token] => {
                if let Some(token) = code_token(token) {
                    match service.pool_stats(&token) {
                        Some(stats) => println!(
                            "idle={} busy={} starting={} target={} degraded={}",
                            stats.idle, stats.busy, stats.starting, stats.target, stats.degraded
                        ),
                        None => println!("unknown code token"),
                    }
                }
            }
            ["delete", token] => {
                if let Some(token) = code_token(token) {
                    service.delete(&token);
                    println!("deleted");
                }
            }
            _ => println!("unrecognized command; try help"),
        }
    }

    service.shutdown();
    Ok(())
}

fn help() {
    println!("commands:");
    println!("  load <path> <workers> [logs]   load a binary, print its code token");
    println!("  run <code_token> [payload…]    invoke with the payload (joined by spaces)");
    println!("  cancel <execution_token>       cancel a pending invocation");
    println!("  stats <code_token>             worker population counts");
    println!("  delete <code_token>            unload a binary");
    println!("  quit                           shut down and exit");
}

fn cmd_load(service: &UdfService, path: &str, workers: &str, logs: bool) {
    let Ok(workers) = workers.parse::<usize>() else {
        println!("worker count must be a number");
        return;
    };
    match service.load_binary(BinarySource::Path(path.as_ref()), workers, logs) {
        Ok(token) => println!("loaded {token}  ({workers} workers)"),
        Err(err) => println!("load failed [{}]: {err}", err.kind()),
    }
}

fn cmd_run(service: &UdfService, token: CodeToken, payload: &[&str], deadline: Option<Duration>) {
    let mut request = ExecuteRequest::new(token, payload.join(" ").into_bytes()).metadata(
        HashMap::from([("origin".to_owned(), "udfbox-shell".to_owned())]),
    );
    if let Some(deadline) = deadline {
        request = request.deadline(deadline);
    }

    let (tx, rx) = channel();
    let (log_tx, log_rx) = channel();
    let execution = service.execute(
        request,
        move |completion| {
            tx.send(completion).ok();
        },
        Some(Box::new(move |logs| {
            log_tx.send(logs).ok();
        })),
    );
    println!("execution {execution}");

    match rx.recv() {
        Ok(completion) => match completion.result {
            Ok(bytes) => println!(
                "ok ({} bytes): {}",
                bytes.len(),
                String::from_utf8_lossy(&bytes)
            ),
            Err(err) => println!("failed [{}]: {err}", err.kind()),
        },
        Err(_) => println!("service dropped the invocation"),
    }
    if let Ok(Ok(logs)) = log_rx.recv() {
        print!("{logs}");
    }
}

fn code_token(s: &str) -> Option<CodeToken> {
    match CodeToken::from_bytes(s.as_bytes()) {
        Ok(token) => Some(token),
        Err(err) => {
            println!("{s:?}: {err}");
            None
        }
    }
}

fn execution_token(s: &str) -> Option<ExecutionToken> {
    match ExecutionToken::from_bytes(s.as_bytes()) {
        Ok(token) => Some(token),
        Err(err) => {
            println!("{s:?}: {err}");
            None
        }
    }
}
