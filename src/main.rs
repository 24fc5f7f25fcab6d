use std::{env, path::PathBuf};

use anyhow::Result;
use clap::Parser;
use csp::{config::FanInConfig, runner::FanInRunner};
use log::info;

#[derive(Parser, Debug)]
#[command(version, about = "Fan-in over rendezvous channels with bounded resolvers", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config/demo.toml")]
    config: PathBuf,

    #[arg(short, long)]
    producers: Option<usize>,

    #[arg(short, long)]
    items: Option<usize>,

    #[arg(long)]
    concurrency: Option<usize>,
}

fn main() -> Result<()> {
    // Default log level to "info"
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info")
    }

    pretty_env_logger::init();

    let args = Args::parse();

    info!("Reading config from '{}'", args.config.display());
    let mut config = FanInConfig::from_file(&args.config)?;

    if let Some(producers) = args.producers {
        config.producers = producers;
    }
    if let Some(items) = args.items {
        config.items_per_producer = items;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }

    let report = FanInRunner::new(config)?.run_blocking()?;

    info!("Done! {} item(s) processed", report.processed);

    Ok(())
}
