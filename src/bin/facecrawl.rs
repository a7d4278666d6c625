use anyhow::{Context, Result};
use clap::Parser;
use facecrawl::{run_crawler, Cli};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("facecrawl=info")),
        )
        .init();

    let cli = Cli::parse();
    let controls = cli.build_controls().context("invalid configuration")?;
    run_crawler(controls).context("crawl failed")?;
    Ok(())
}
