use log::{error, info, warn};
use std::sync::Arc;
use tokio::io::BufReader;

pub mod backfill;
pub mod clients;
pub mod config;
pub mod error;
pub mod presentation;
pub mod purge;
pub mod reconcile;
pub mod scheduler;
pub mod sources;
pub mod store;
#[cfg(test)]
mod testing;
pub mod timer;
pub mod timesheet;

pub use clients::{HttpSourceFactory, SourceFactory};
pub use config::Settings;
pub use error::{HarvesterError, Result};
pub use presentation::{ConsoleExit, ConsolePresenter, Presenter};
pub use scheduler::{Scheduler, SchedulerHandle, Snapshot};
pub use sources::{BillingSource, IssueSource, Sources};
pub use store::{FileStore, MemoryStore, Persistence, StoreError};
pub use timer::{TaskTimer, TimerStatus, TimerStore};

/// Runs the tracker until `quit`, end of input or Ctrl-C, then flushes state.
async fn serve() -> Result<()> {
    let dir = config::data_dir()
        .ok_or_else(|| StoreError::Unavailable("no data directory for this platform".into()))?;
    info!("Using data directory {}", dir.display());
    let persistence = Arc::new(FileStore::open(dir).await?);
    let presenter: Arc<dyn Presenter> = Arc::new(ConsolePresenter);
    let (handle, task) =
        Scheduler::spawn(persistence, Arc::new(HttpSourceFactory), presenter.clone()).await?;

    let settings = handle.settings().await?;
    if !settings.jira.is_configured() && !settings.harvest.is_configured() {
        warn!("No credentials configured; use `set jira.url ...` or `set harvest.token ...`");
    }

    let console = presentation::run_console(
        handle.clone(),
        presenter,
        BufReader::new(tokio::io::stdin()),
    );
    tokio::select! {
        exit = console => {
            if exit == ConsoleExit::EndOfInput {
                info!("Console input closed; tracking continues until Ctrl-C");
                wait_for_interrupt().await;
            }
        }
        _ = wait_for_interrupt() => {}
    }

    handle.shutdown().await?;
    if let Err(err) = task.await {
        warn!("Scheduler task ended abnormally: {}", err);
    }
    Ok(())
}

async fn wait_for_interrupt() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Interrupted"),
        Err(err) => warn!("Failed to listen for Ctrl-C: {}", err),
    }
}

pub fn run() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .try_init();

    info!("Starting harvester");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to start async runtime: {}", err);
            return;
        }
    };
    if let Err(err) = runtime.block_on(serve()) {
        error!("harvester stopped with an error: {}", err);
    }
}
