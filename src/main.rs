use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::mpsc;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};

use feedreader::config::{Config, LogLevel};
use feedreader::feed::{Feed, HttpClient, SubscriberId};
use feedreader::output::run_printer;

#[derive(Parser, Debug)]
#[command(
    name = "feedreader",
    version,
    about = "Poll RSS and Atom feeds and print new items as they appear"
)]
struct Args {
    /// Log verbosity (RUST_LOG takes precedence when set)
    #[arg(long, value_enum, ignore_case = true)]
    loglevel: Option<LogLevel>,

    /// Seconds between polls of each feed
    #[arg(long, value_name = "SECS")]
    interval: Option<u64>,

    /// Print the items already present on each feed's first poll
    #[arg(long, overrides_with = "drop_initial")]
    include_initial: bool,

    /// Only print items that appear after the first poll
    #[arg(long, overrides_with = "include_initial")]
    drop_initial: bool,

    /// Config file (default: ~/.config/feedreader/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Items buffered for output before new ones are dropped
    #[arg(long, value_name = "N")]
    queue_capacity: Option<usize>,

    /// Feed URLs, polled in addition to those in the config file
    #[arg(value_name = "URL")]
    urls: Vec<String>,
}

impl Args {
    /// Layers command-line flags over the file configuration.
    fn apply(&self, mut config: Config) -> Result<Config> {
        if let Some(level) = self.loglevel {
            config.loglevel = level;
        }
        if let Some(interval) = self.interval {
            config.interval_secs = interval;
        }
        if self.include_initial {
            config.include_initial = true;
        } else if self.drop_initial {
            config.include_initial = false;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }
        config.feeds.extend(self.urls.iter().cloned());
        config.validate().context("Invalid command-line option")?;
        Ok(config)
    }
}

/// Filter in force while the config file is read. Config problems are
/// reported at warn, so that is the floor until the file's own level applies.
fn startup_filter(args: &Args) -> &'static str {
    args.loglevel.map_or("warn", LogLevel::as_filter)
}

fn load_config(args: &Args) -> Result<Config> {
    let path = match args.config.clone().or_else(Config::default_path) {
        Some(path) => path,
        None => return args.apply(Config::default()),
    };
    let config = Config::load(&path)
        .with_context(|| format!("Failed to load config from '{}'", path.display()))?;
    args.apply(config)
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                tracing::info!("Received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        tracing::info!("Received Ctrl-C, shutting down");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().ok();
    let from_env = env_filter.is_some();
    let (filter, filter_handle) = reload::Layer::new(
        env_filter.unwrap_or_else(|| EnvFilter::new(startup_filter(&args))),
    );
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&args)?;
    if !from_env {
        filter_handle
            .reload(EnvFilter::new(config.loglevel.as_filter()))
            .context("Failed to apply configured log level")?;
    }

    if config.feeds.is_empty() {
        bail!("No feeds to poll: pass URLs on the command line or list them under `feeds` in the config file");
    }

    let client = HttpClient::new(config.cache_capacity).context("Failed to build HTTP client")?;
    let (tx, rx) = mpsc::channel(config.queue_capacity);

    let feeds: Vec<(Feed, SubscriberId)> = config
        .feeds
        .iter()
        .map(|url| {
            let feed = Feed::new(url.as_str(), config.feed_options(), client.clone());
            let id = feed.subscribe(tx.clone());
            tracing::info!(feed = %feed, "Watching feed");
            (feed, id)
        })
        .collect();
    drop(tx);

    let mut printer = tokio::spawn(run_printer(rx, std::io::stdout()));

    let outcome = tokio::select! {
        result = shutdown_signal() => result,
        joined = &mut printer => {
            // Printer only ends early when stdout goes away.
            let result = joined.context("Printer task panicked")?;
            result.context("Failed to write to stdout").map(|_| ())
        }
    };

    futures::future::join_all(feeds.iter().map(|(feed, _)| feed.stop())).await;
    for (feed, id) in &feeds {
        feed.unsubscribe(*id);
    }
    drop(feeds);

    if !printer.is_finished() {
        match printer.await {
            Ok(Ok(printed)) => tracing::debug!(printed = printed, "Output drained"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to flush remaining output"),
            Err(e) => tracing::warn!(error = %e, "Printer task ended abnormally"),
        }
    }

    outcome
}
