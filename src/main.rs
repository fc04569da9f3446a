mod config;
mod mailbox;
mod matcher;
mod message;
mod notify;
mod seen;
mod watcher;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::notify::telegram::TelegramNotifier;
use crate::seen::SeenStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mailwatch=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Usage: mailwatch [config.toml] [--watch]
    let mut config_path = PathBuf::from("config.toml");
    let mut watch = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--watch" => watch = true,
            other => config_path = PathBuf::from(other),
        }
    }

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)?;

    info!("Configuration loaded successfully");
    info!("  Mailbox: {}@{}/{}", config.imap.user, config.imap.server, config.imap.mailbox);
    info!("  Search terms: {:?}", config.matching.search_terms);
    info!("  Seen-state db: {}", config.seen.database_path.display());

    let store = SeenStore::open(&config.seen.database_path)?;
    let notifier = Arc::new(TelegramNotifier::new(&config.telegram));

    if watch {
        run_watch_mode(config, notifier, store).await
    } else {
        // One-shot: a fatal error (config, connect, auth) propagates out of
        // main for the non-zero exit the external scheduler retries on.
        watcher::run(&config, notifier.as_ref(), &store).await?;
        Ok(())
    }
}

/// Long-lived mode: poll the mailbox on the configured cron expression
/// until interrupted. Per-tick failures are logged, not fatal; the next
/// tick retries.
async fn run_watch_mode(
    config: Config,
    notifier: Arc<TelegramNotifier>,
    store: SeenStore,
) -> Result<()> {
    let cron = config.watch.cron.clone();
    let config = Arc::new(config);

    let scheduler = JobScheduler::new()
        .await
        .context("Failed to create job scheduler")?;
    let poll = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let config = config.clone();
        let notifier = notifier.clone();
        let store = store.clone();
        Box::pin(async move {
            info!("Polling mailbox");
            if let Err(e) = watcher::run(&config, notifier.as_ref(), &store).await {
                error!("Watcher run failed: {:#}", e);
            }
        })
    })
    .with_context(|| format!("Invalid watch cron expression: {cron}"))?;
    scheduler
        .add(poll)
        .await
        .context("Failed to schedule mailbox poll")?;
    scheduler
        .start()
        .await
        .context("Failed to start scheduler")?;
    info!("Watching mailbox on cron: {}", cron);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Interrupted, shutting down");
    Ok(())
}
