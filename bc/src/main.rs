//! bc - broadcaster demo
//!
//! Registers a set of listeners, broadcasts words to them and prints what
//! each one observed.

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use futures::StreamExt;
use futures::future::join_all;
use tracing::{debug, info};

use bcast::Broadcaster;
use bcast::cli::{Cli, Command};
use bcast::config::Config;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .map_err(|e| eyre::eyre!(e))?;

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run { listeners, words } => cmd_run(&config, listeners, words).await,
        Command::Config => cmd_config(&config),
    }
}

/// Broadcast `words` to `count` listeners and print each listener's view
async fn cmd_run(config: &Config, count: usize, words: Vec<String>) -> Result<()> {
    debug!(count, ?words, "cmd_run: called");
    let bc = Broadcaster::spawn(config.broadcast.clone());

    let mut consumers = Vec::with_capacity(count);
    for n in 0..count {
        let listener = bc.listen().await;
        consumers.push(tokio::spawn(async move {
            let received: Vec<String> = listener.collect().await;
            (n, received)
        }));
    }

    let sender = bc.sender();
    for word in words {
        let report = sender.send(word).await.context("Broadcast failed")?;
        debug!(?report, "cmd_run: broadcast complete");
    }
    bc.stop();
    bc.stopped().await;

    let mut results = Vec::with_capacity(count);
    for joined in join_all(consumers).await {
        results.push(joined.context("Listener task failed")?);
    }
    results.sort_by_key(|(n, _)| *n);

    for (n, received) in results {
        println!("{} {}", format!("listener {}:", n).cyan(), received.join(" "));
    }
    println!("{} {} listener(s) completed", "✓".green(), count);
    Ok(())
}

/// Print the effective configuration as YAML
fn cmd_config(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize config")?;
    print!("{}", yaml);
    Ok(())
}
