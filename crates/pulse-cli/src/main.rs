use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use pulse_client::{Client, ClientConfig};
use tracing_subscriber::EnvFilter;

use pulse_cli::commands::{buckets, flush, query, queue, record};
use pulse_cli::{Cli, Commands, load_config};

fn open_client(config: &ClientConfig) -> Result<Client> {
    Client::open(config.clone()).context("failed to open client")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Logs go to stderr; stdout carries command output.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    let mut stdout = std::io::stdout();
    match &cli.command {
        Some(Commands::Heartbeat { event, pulsetime }) => {
            record::heartbeat(&mut stdout, &config, event, *pulsetime).await?;
        }
        Some(Commands::Insert { event }) => {
            record::insert(&mut stdout, &config, event).await?;
        }
        Some(Commands::CreateBucket { bucket, event_type }) => {
            let client = open_client(&config)?;
            buckets::create(&mut stdout, &client, bucket, event_type).await?;
        }
        Some(Commands::Buckets) => {
            let client = open_client(&config)?;
            buckets::list(&mut stdout, &client).await?;
        }
        Some(Commands::Query {
            bucket,
            start,
            end,
            statement,
            name,
            cache,
        }) => {
            let client = open_client(&config)?;
            let args = query::QueryArgs {
                buckets: bucket,
                start: *start,
                end: *end,
                statements: statement,
                name: name.as_deref(),
                cache: *cache,
            };
            query::run(&mut stdout, &client, &args).await?;
        }
        Some(Commands::Queue) => {
            queue::run(&mut stdout, &config)?;
        }
        Some(Commands::Flush { grace_ms }) => {
            let client = open_client(&config)?;
            flush::run(&mut stdout, &client, Duration::from_millis(*grace_ms)).await?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    stdout.flush()?;
    Ok(())
}
