pub mod config;
pub mod listener;
pub mod storage;

use std::sync::Arc;

use dimse::{DimseScu, MoveQuery, RetrieveOutcome, UlConnector};
use tracing_subscriber::{self, prelude::*, EnvFilter};

use crate::config::Config;
use crate::listener::{RetrievedEntry, RetrievedObjectLog};
use crate::storage::{create_storage_backend, StorageResult};

/// Result of one retrieve run
#[derive(Debug)]
pub struct RetrieveReport {
    pub outcome: RetrieveOutcome,
    pub objects: Vec<RetrievedEntry>,
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Calling this again once a
/// subscriber is installed does nothing.
pub fn init_logging(config: &Config) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.retriever.log_level));

    let stdout_appender = tracing_subscriber::fmt::layer()
        .with_file(true)
        .with_line_number(true);

    let file_appender = if config.logging.log_to_file {
        let file = std::fs::File::create(&config.logging.log_file_path)?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
    } else {
        None
    };

    if tracing_subscriber::registry()
        .with(filter)
        .with(stdout_appender)
        .with(file_appender)
        .try_init()
        .is_err()
    {
        tracing::debug!("Logging already initialised");
    }
    Ok(())
}

/// Retrieve everything matching `query` from the configured archive
pub async fn run(config: &Config, query: &MoveQuery) -> StorageResult<RetrieveReport> {
    tracing::info!("Starting retriever '{}'", config.retriever.id);

    let storage = Arc::new(create_storage_backend(&config.storage)?);
    let log = Arc::new(RetrievedObjectLog::default());
    let connector = Arc::new(UlConnector::new(config.dimse.clone()));

    let scu = DimseScu::new(
        config.dimse.clone(),
        config.archive.clone(),
        connector,
        storage,
        log.clone(),
    );
    let outcome = scu.retrieve(query).await;

    Ok(RetrieveReport {
        outcome,
        objects: log.entries(),
    })
}

/// Process exit code for a retrieve outcome
pub fn exit_code(outcome: &RetrieveOutcome) -> u8 {
    match outcome {
        RetrieveOutcome::Success => 0,
        RetrieveOutcome::PartialSuccess(_) => 2,
        _ => 1,
    }
}
