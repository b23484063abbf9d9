//! Host for the CacheKit cache controller.
//!
//! Runs the controller's lifecycle and fetch handlers against a live origin
//! and keeps the cache registry in a snapshot file between runs.
//!
//! ## Usage
//!
//! ```bash
//! # Show the cache name and precache list
//! cachekit-host --config worker.json plan
//!
//! # Install + activate the configured version, writing the snapshot
//! cachekit-host --config worker.json --snapshot caches.json warm
//!
//! # Serve paths through the controller
//! cachekit-host --config worker.json --snapshot caches.json fetch --navigate /projects.html
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cachekit_common::{init_logging, CacheKitError, LogConfig, LogFormat, OptionExt};
use cachekit_net::{Fetcher, HttpFetcher, LoaderConfig, Request};
use cachekit_sw::{
    CacheController, CacheStorage, FetchEvent, ResponseSource, ServiceWorkerEvent,
    ServiceWorkerRegistration, WorkerConfig,
};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cachekit-host")]
#[command(about = "Drive a cache-first worker against a live origin")]
struct Cli {
    /// Worker config (JSON); built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cache registry snapshot
    #[arg(short, long, global = true, default_value = "cachekit-snapshot.json")]
    snapshot: PathBuf,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the config and print the precache plan
    Plan,

    /// Install and activate the configured version
    Warm,

    /// Serve paths through the active controller
    Fetch {
        /// Same-origin paths to request
        #[arg(required = true)]
        paths: Vec<String>,

        /// Treat requests as page navigations
        #[arg(long)]
        navigate: bool,

        /// How long to wait for background revalidation (ms)
        #[arg(long, default_value = "2000")]
        wait_ms: u64,
    },
}

fn load_config(path: Option<&Path>) -> cachekit_common::Result<WorkerConfig> {
    let config = match path {
        Some(path) => WorkerConfig::load(path)?,
        None => {
            let config = WorkerConfig::default();
            config.validate()?;
            config
        }
    };
    Ok(config)
}

fn http_fetcher() -> cachekit_common::Result<Arc<dyn Fetcher>> {
    let fetcher = HttpFetcher::new(LoaderConfig::default())
        .map_err(|e| CacheKitError::network_with_source("building HTTP client", e))?;
    Ok(Arc::new(fetcher))
}

fn plan(config: &WorkerConfig) -> cachekit_common::Result<()> {
    println!("cache:   {}", config.cache_name());
    println!("offline: {}", config.offline_url()?);
    for url in config.manifest_urls()? {
        println!("  {}", url);
    }
    Ok(())
}

async fn warm(config: WorkerConfig, snapshot: &Path) -> cachekit_common::Result<()> {
    let caches = Arc::new(RwLock::new(CacheStorage::load(snapshot)?));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut registration = ServiceWorkerRegistration::new(config.origin_url()?, tx.clone());

    let controller = CacheController::with_events(config, Arc::clone(&caches), http_fetcher()?, tx)?;
    registration.install(Arc::new(controller)).await?;
    let active = registration.active().ok_or_not_found("active worker")?;

    caches.read().await.save(snapshot)?;

    while let Ok(event) = rx.try_recv() {
        if let ServiceWorkerEvent::CacheDeleted { name } = event {
            println!("deleted {}", name);
        }
    }
    println!("active  {}", active.cache_name());
    Ok(())
}

async fn fetch(
    config: WorkerConfig,
    snapshot: &Path,
    paths: &[String],
    navigate: bool,
    wait: Duration,
) -> cachekit_common::Result<()> {
    let caches = Arc::new(RwLock::new(CacheStorage::load(snapshot)?));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let controller = CacheController::resume(config, Arc::clone(&caches), http_fetcher()?, tx).await?;

    let mut hits = 0usize;
    for path in paths {
        let url = controller.config().resolve(path)?;
        let request = if navigate {
            Request::navigate(url)
        } else {
            Request::get(url)
        };

        match controller.on_fetch(&FetchEvent::new(request)).await {
            Some(response) => {
                if response.source == ResponseSource::Cache {
                    hits += 1;
                }
                println!(
                    "{} {:?} {} bytes {}",
                    response.status,
                    response.source,
                    response.body.len(),
                    path
                );
            }
            None => println!("passthrough {}", path),
        }
    }

    let mut settled = 0usize;
    let _ = tokio::time::timeout(wait, async {
        while settled < hits {
            match rx.recv().await {
                Some(ServiceWorkerEvent::Revalidated { url }) => {
                    settled += 1;
                    info!(url = %url, "Refreshed");
                }
                Some(ServiceWorkerEvent::RevalidationFailed { url, reason }) => {
                    settled += 1;
                    info!(url = %url, reason = %reason, "Kept cached copy");
                }
                Some(_) => {}
                None => break,
            }
        }
    })
    .await;

    caches.read().await.save(snapshot)?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(log_config.with_format(cli.log_format));

    let config = load_config(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Plan => plan(&config),
        Commands::Warm => warm(config, &cli.snapshot).await,
        Commands::Fetch {
            paths,
            navigate,
            wait_ms,
        } => {
            fetch(
                config,
                &cli.snapshot,
                &paths,
                navigate,
                Duration::from_millis(wait_ms),
            )
            .await
        }
    };

    if let Err(e) = &result {
        if e.is_retryable() {
            warn!(category = e.category(), "Transient failure, re-running may succeed");
        }
    }
    result.map_err(anyhow::Error::from)
}
