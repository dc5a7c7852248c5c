use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use httpreplay::{Endpoint, Exchange, ReplayClient};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::ReplayConfig;

#[derive(Parser)]
#[command(name = "httpreplay")]
#[command(version)]
#[command(about = "Replay captured HTTP requests against a destination", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: replay.yml in the current or home directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Destination to replay to, overrides the config file
    #[arg(short, long, global = true)]
    destination: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay raw request files, one HTTP/1.x request per file
    Send {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Redirects to follow per request
        #[arg(long)]
        follow_redirects: Option<usize>,

        /// Mirror requests and responses to the log
        #[arg(long)]
        debug_trace: bool,

        /// Maximum number of requests in flight
        #[arg(long)]
        concurrency: Option<usize>,

        /// Print one JSON object per request
        #[arg(long)]
        json: bool,
    },
    /// Print the canonical form of a destination
    Resolve {
        url: String,
    },
}

/// Result of replaying one file
#[derive(Debug, Serialize)]
struct Outcome {
    file: String,
    status: Option<u16>,
    bytes: usize,
    redirects: usize,
    error: Option<String>,
}

impl Outcome {
    fn new(file: &Path, result: Result<Exchange>) -> Self {
        let file = file.display().to_string();
        match result {
            Ok(exchange) => Self {
                file,
                status: exchange.status(),
                bytes: exchange.raw.len(),
                redirects: exchange.redirects,
                error: None,
            },
            Err(e) => Self {
                file,
                status: None,
                bytes: 0,
                redirects: 0,
                error: Some(format!("{:#}", e)),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Resolve { url } => {
            let endpoint = Endpoint::resolve(&url);
            println!("{}", endpoint.base_url());
            println!("tls: {}", endpoint.use_tls());
            Ok(())
        }
        Commands::Send {
            files,
            follow_redirects,
            debug_trace,
            concurrency,
            json,
        } => {
            let mut config = match cli.config.or_else(ReplayConfig::find_config) {
                Some(path) => ReplayConfig::load(&path)?,
                None => ReplayConfig::default(),
            };
            if let Some(destination) = cli.destination {
                config.destination = destination;
            }
            if let Some(n) = follow_redirects {
                config.client.follow_redirects = n;
            }
            if let Some(n) = concurrency {
                config.concurrency = n;
            }
            config.client.debug_trace |= debug_trace;
            config.validate()?;

            init_logging(cli.verbose, config.client.debug_trace)?;
            run_send(config, files, json).await
        }
    }
}

fn init_logging(verbose: bool, debug_trace: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    if debug_trace {
        filter = filter.add_directive("httpreplay::trace=debug".parse()?);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

/// Replay every file through one shared client
async fn run_send(config: ReplayConfig, files: Vec<PathBuf>, json: bool) -> Result<()> {
    let client = Arc::new(ReplayClient::new(&config.destination, config.client.clone()));
    let permits = Arc::new(Semaphore::new(config.concurrency));
    info!(
        "Replaying {} request(s) to {} ({} in flight)",
        files.len(),
        client.base_url(),
        config.concurrency
    );

    let mut tasks = JoinSet::new();
    for (index, file) in files.into_iter().enumerate() {
        let client = client.clone();
        let permits = permits.clone();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let result = replay_file(&client, &file).await;
            (index, Outcome::new(&file, result))
        });
    }

    let total = tasks.len();
    let mut outcomes = Vec::with_capacity(total);
    loop {
        tokio::select! {
            joined = tasks.join_next() => {
                match joined {
                    Some(Ok(outcome)) => outcomes.push(outcome),
                    Some(Err(e)) => error!("Replay task failed: {}", e),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, abandoning {} request(s)", tasks.len());
                tasks.shutdown().await;
                break;
            }
        }
    }

    outcomes.sort_by_key(|(index, _)| *index);
    let mut failed = total - outcomes.len();
    for (_, outcome) in &outcomes {
        if outcome.error.is_some() {
            failed += 1;
        }
        print_outcome(outcome, json)?;
    }

    if failed > 0 {
        anyhow::bail!("{} of {} request(s) failed", failed, total);
    }
    Ok(())
}

async fn replay_file(client: &ReplayClient, file: &Path) -> Result<Exchange> {
    let request = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read request file: {}", file.display()))?;
    let exchange = client
        .exchange(&request)
        .await
        .with_context(|| format!("Failed to replay {}", file.display()))?;
    Ok(exchange)
}

fn print_outcome(outcome: &Outcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(outcome)?);
        return Ok(());
    }
    match (&outcome.error, outcome.status) {
        (Some(e), _) => println!("{}  failed: {}", outcome.file, e),
        (None, Some(status)) => println!(
            "{}  {}  {} bytes  {} redirect(s)",
            outcome.file, status, outcome.bytes, outcome.redirects
        ),
        (None, None) => println!("{}  -  {} bytes (no HTTP response)", outcome.file, outcome.bytes),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_send() {
        let cli = Cli::try_parse_from([
            "httpreplay",
            "send",
            "--destination",
            "https://staging.local",
            "--follow-redirects",
            "3",
            "a.http",
            "b.http",
        ])
        .unwrap();
        assert_eq!(cli.destination.as_deref(), Some("https://staging.local"));
        match cli.command {
            Commands::Send { files, follow_redirects, json, .. } => {
                assert_eq!(files.len(), 2);
                assert_eq!(follow_redirects, Some(3));
                assert!(!json);
            }
            Commands::Resolve { .. } => panic!("expected send"),
        }
    }

    #[test]
    fn test_outcome_from_error() {
        let outcome = Outcome::new(Path::new("req.http"), Err(anyhow::anyhow!("boom")));
        assert_eq!(outcome.error.as_deref(), Some("boom"));
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"file\":\"req.http\""));
    }
}
