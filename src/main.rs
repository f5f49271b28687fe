//! Toolhost - interactive chat host for the bearing tool server.
//!
//! Reads one request per line from standard input, routes it to the
//! `bearingpro` server and prints the answer. Logs go to a daily file so the
//! terminal only shows the conversation.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use toolhost::config::HostConfig;
use toolhost::host::{ChatHost, Reply};

/// Route all tracing output to the day's log file.
fn init_logging(config: &HostConfig) -> Result<()> {
    fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory {}", config.log_dir.display()))?;
    let path = config.log_file(chrono::Local::now().date_naive());
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "toolhost=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Mutex::new(file)),
        )
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let config = HostConfig::from_env()?;
    init_logging(&config)?;

    tracing::info!("Starting toolhost v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Tool server: {} (timeout {:?})",
        config.bearingpro.display(),
        config.timeout
    );

    let mut host = ChatHost::from_config(&config);
    let result = run(&mut host);
    host.shutdown();

    if let Err(e) = &result {
        tracing::error!("Host error: {:#}", e);
    } else {
        tracing::info!("toolhost exited cleanly");
    }
    result
}

/// Prompt, read, answer until `quit` or end of input.
fn run(host: &mut ChatHost) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    writeln!(stdout, "toolhost v{} - type 'help' for commands", env!("CARGO_PKG_VERSION"))?;

    let mut lines = stdin.lock().lines();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;

        let Some(line) = lines.next() else {
            writeln!(stdout)?;
            break;
        };
        match host.handle_line(&line.context("Failed to read from stdin")?) {
            Reply::Quit => break,
            Reply::Message(text) if text.is_empty() => {}
            Reply::Message(text) => writeln!(stdout, "{}", text)?,
        }
    }
    Ok(())
}
