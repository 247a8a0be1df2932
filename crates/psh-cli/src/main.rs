use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use psh_pipeline::{ScrapeConfig, ScrapePipeline};
use psh_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, MemoryRepository};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "psh-cli")]
#[command(about = "Problem-statement harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape one year, or run the full campaign when no year is given.
    Scrape {
        #[arg(long)]
        year: Option<i32>,
    },
    /// Serve the scrape API.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

fn build_pipeline(config: ScrapeConfig) -> Result<ScrapePipeline> {
    let fetcher = HttpFetcher::new(HttpClientConfig {
        timeout: config.request_timeout,
        user_agent: config.user_agent.clone(),
        backoff: BackoffPolicy {
            max_retries: config.max_retries,
            ..BackoffPolicy::default()
        },
    })?;
    Ok(ScrapePipeline::new(
        config,
        Arc::new(MemoryRepository::default()),
        Arc::new(fetcher),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = ScrapeConfig::from_env();

    match cli.command.unwrap_or(Commands::Scrape { year: None }) {
        Commands::Scrape { year: Some(year) } => {
            let pipeline = build_pipeline(config)?;
            let outcome = pipeline.scrape_year(year).await?;
            println!(
                "scrape complete: year={} status={:?} count={}",
                outcome.year, outcome.status, outcome.count
            );
        }
        Commands::Scrape { year: None } => {
            let pipeline = build_pipeline(config)?;
            let summary = pipeline.scrape_all_years().await;
            println!(
                "campaign complete: run_id={} years={}",
                summary.run_id,
                summary.outcomes.len()
            );
            for outcome in &summary.outcomes {
                println!(
                    "  year={} status={:?} count={} error={}",
                    outcome.year,
                    outcome.status,
                    outcome.count,
                    outcome.error.as_deref().unwrap_or("-")
                );
            }
        }
        Commands::Serve { port } => {
            let pipeline = build_pipeline(config)?;
            let state = psh_web::AppState::new(Arc::new(pipeline));
            psh_web::serve(state, port).await?;
        }
    }

    Ok(())
}
