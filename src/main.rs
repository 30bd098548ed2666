//! sharestat -- capacity stats collector for federated storage shares.
//!
//! Reads the UGR configuration, collects stats from every declared
//! share concurrently, and publishes them to the selected sinks.

use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};

/// Command-line arguments for the stats collector.
#[derive(Parser, Debug)]
#[command(
    name = "sharestat",
    version,
    about = "Storage-share capacity stats collector"
)]
struct Cli {
    /// Configuration files or directories to scan for `*.conf` files.
    /// Defaults to /etc/ugr/conf.d when empty.
    #[arg(short = 'c', long = "config")]
    config: Vec<PathBuf>,

    /// Upload each share's stats record to memcached.
    #[arg(short = 'm', long = "memcached")]
    memcached: bool,

    /// Memcached host.
    #[arg(long, default_value = "127.0.0.1")]
    memhost: String,

    /// Memcached port.
    #[arg(long, default_value_t = 11211)]
    memport: u16,

    /// Print each share's stats to stdout.
    #[arg(long)]
    stdout: bool,

    /// Write a StAR accounting XML document to this path.
    #[arg(long)]
    star: Option<PathBuf>,

    /// Include the per-share debug trail in stdout output.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Maximum number of shares contacted at once.
    #[arg(long, default_value_t = 5)]
    parallelism: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_paths = if cli.config.is_empty() {
        vec![PathBuf::from("/etc/ugr/conf.d")]
    } else {
        cli.config.clone()
    };

    info!("Loading configuration from {:?}", config_paths);
    let config_files = sharestat::config::get_conf_files(&config_paths)?;
    let raw_shares = sharestat::config::parse_conf_files(&config_files)?;
    info!("Found {} configured storage shares", raw_shares.len());

    let shares = sharestat::dispatch::build_storage_shares(raw_shares);
    let shares = sharestat::dispatch::collect_storage_stats(shares, cli.parallelism).await;

    let memcached_addr = format!("{}:{}", cli.memhost, cli.memport);
    if cli.memcached {
        for share in &shares {
            let index = sharestat::memcache::index_for(&share.id);
            let record = sharestat::memcache::storage_stats_record(share);
            if let Err(err) = sharestat::memcache::set(&memcached_addr, &index, &record).await {
                warn!(share = %share.id, "{}", err.status_message());
            }
        }
        info!("Uploaded {} records to {}", shares.len(), memcached_addr);
    }

    // Stdout is the default sink when nothing else was selected.
    if cli.stdout || (!cli.memcached && cli.star.is_none()) {
        let cache = cli.memcached.then_some(memcached_addr.as_str());
        sharestat::output::to_stdout(&shares, cache, cli.debug).await;
    }

    if let Some(path) = cli.star {
        let endpoints = sharestat::dispatch::get_storage_endpoints(shares);
        let document = sharestat::xml::format_star(&endpoints);
        std::fs::write(&path, document)?;
        info!("StAR accounting document written to {}", path.display());
    }

    Ok(())
}
