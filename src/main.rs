use anyhow::{Context, Result};
use std::time::Duration;
use taskhub::cli::{
    Args, ConfigDiscovery, ExecutionMode, MessageSource, RunConfig, install_default_routes,
};
use taskhub::{EventError, TaskService};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    let verbose = matches!(&mode, ExecutionMode::Run(config) if config.verbose);
    init_logging(verbose);

    let result = match mode {
        ExecutionMode::Run(config) => run_mode(config).await,
        ExecutionMode::ShowConfig { config_override } => {
            show_config_mode(config_override.as_deref())
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "taskhub=debug" } else { "taskhub=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_mode(config: RunConfig) -> Result<()> {
    let service_config = ConfigDiscovery::load(config.config_override.as_deref())?;
    let service = TaskService::new(service_config)?;

    install_default_routes(&service);
    service.start().await;
    info!("Reading messages from {:?}", config.source);

    let submitted = match &config.source {
        MessageSource::Stdin => {
            feed_messages(&service, BufReader::new(tokio::io::stdin()), &config.submitter_id).await
        }
        MessageSource::File(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open message file {:?}", path))?;
            feed_messages(&service, BufReader::new(file), &config.submitter_id).await
        }
    };

    // Handlers submit tasks, so the event side must settle before the engine
    service.events().wait_idle().await;
    service.engine().wait_idle().await;

    let status = service.status();
    service.stop().await;

    let submitted = submitted?;
    info!("Submitted {} messages", submitted);
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("Failed to render service status")?
    );
    Ok(())
}

/// Submit one message per non-empty line; returns how many were accepted
async fn feed_messages<R>(service: &TaskService, reader: R, submitter_id: &str) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_number = 0;
    let mut submitted = 0;

    while let Some(line) = lines.next_line().await.context("Failed to read message")? {
        line_number += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!("Skipping line {}: invalid JSON: {}", line_number, e);
                continue;
            }
        };

        loop {
            match service.events().submit_json(value.clone(), submitter_id) {
                Ok(_) => {
                    submitted += 1;
                    break;
                }
                Err(EventError::QueueFull { .. }) => tokio::time::sleep(QUEUE_FULL_BACKOFF).await,
                Err(e @ EventError::InvalidPayload(_)) => {
                    warn!("Skipping line {}: {}", line_number, e);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(submitted)
}

fn show_config_mode(config_override: Option<&std::path::Path>) -> Result<()> {
    ConfigDiscovery::show_discovery_info(config_override);
    let config = ConfigDiscovery::load(config_override)?;

    println!();
    println!("Effective configuration:");
    println!();
    print!("{}", config.to_toml_string()?);
    Ok(())
}
