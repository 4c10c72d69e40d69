//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fetchcache_service::config::{CachePolicy, Config};
use fetchcache_service::metrics;

use crate::commands;
use crate::logging;

/// The cache policy to fetch with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Policy {
    /// Defer to the protocol.
    UseProtocol,
    /// Always load from the network, never persist.
    AlwaysLoad,
    /// Use persisted responses, load from the network otherwise.
    ReturnCacheElseLoad,
    /// Use persisted responses only.
    ReturnCacheOnly,
}

impl From<Policy> for CachePolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::UseProtocol => Self::UseProtocol,
            Policy::AlwaysLoad => Self::AlwaysLoad,
            Policy::ReturnCacheElseLoad => Self::ReturnCacheElseLoad,
            Policy::ReturnCacheOnly => Self::ReturnCacheOnly,
        }
    }
}

/// Fetchcache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch resources through the cache.
    ///
    /// All URLs are requested concurrently, so duplicates share a single download.
    Fetch {
        /// The URLs to fetch.
        #[arg(required = true)]
        urls: Vec<String>,

        /// How many times to request all URLs.
        ///
        /// Later rounds are served from memory.
        #[arg(long, default_value_t = 1)]
        repeat: usize,

        /// Overrides the configured cache policy.
        #[arg(long, value_enum)]
        policy: Option<Policy>,
    },

    /// Remove stale responses from the persistent store.
    Cleanup,

    /// Remove all responses from the persistent store.
    Clear,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(author, version, about, bin_name = "fetchcache")]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: We are still single-threaded, the runtime is created below.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure metrics")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("fetchcache")
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    match cli.command {
        Command::Fetch {
            urls,
            repeat,
            policy,
        } => runtime.block_on(commands::fetch(
            &config,
            &urls,
            repeat,
            policy.map(Into::into),
        ))?,
        Command::Cleanup => commands::cleanup(&config).context("failed to clean up cache")?,
        Command::Clear => commands::clear(&config).context("failed to clear cache")?,
    }

    Ok(())
}
