//! `logflowd`: a per-node log-shipping agent for container platforms using
//! the JSON-file log driver. See `SPEC_FULL.md` at the workspace root for
//! the full module inventory; `main.rs` is a thin process-entry shim over
//! [`run`].

pub mod annotation;
pub mod config;
pub mod cursor;
pub mod error;
pub mod exporter;
pub mod governor;
pub mod hub;
pub mod identity;
pub mod k8s;
pub mod kv;
pub mod lines;
pub mod parser;
pub mod record;
pub mod shutdown;
pub mod spool;
pub mod supervisor;
pub mod tailer;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::error::LogflowError;
use crate::governor::{Governor, NumFilesRegistry, ParserRegistry};
use crate::k8s::MetadataClient;
use crate::shutdown::ShutdownTx;
use crate::supervisor::Supervisor;
use snafu::IntoError;

pub struct Cli {
    pub config_path: PathBuf,
    pub containers_dir: Option<PathBuf>,
    pub spool_dir: Option<PathBuf>,
}

/// Wires up the governor, records channel, exporter, and supervisor, then
/// runs until `ctrl_c`/`SIGTERM` (spec §A.1), joining every task with a
/// bounded drain timeout.
pub async fn run(cli: Cli) -> Result<(), LogflowError> {
    let mut config = match Config::load(&cli.config_path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %cli.config_path.display(), "config file not found, using defaults");
            Config::default()
        }
        Err(e) => return Err(error::ConfigReadSnafu { path: cli.config_path.clone() }.into_error(e)),
    };
    if let Some(dir) = cli.containers_dir {
        config.containers_dir = dir;
    }
    if let Some(dir) = cli.spool_dir {
        config.spool_dir = dir;
    }

    let (shutdown_tx, shutdown_rx) = ShutdownTx::new();

    let numfiles = Arc::new(NumFilesRegistry::new());
    let parsers = Arc::new(ParserRegistry::new());
    let governor = Arc::new(Governor::new(config.max_docker_files, config.max_files, numfiles, parsers));

    let metadata = match MetadataClient::discover() {
        Ok(m) => Arc::new(m),
        Err(e) => {
            tracing::warn!(error = %e, "failed to initialize cluster metadata client, continuing without it");
            Arc::new(MetadataClient::unavailable())
        }
    };

    let (records_tx, records_rx) = hub::channel();
    let hub = hub::RecordsHub::new(records_rx);

    let supervisor = Arc::new(Supervisor::new(
        config.containers_dir.clone(),
        config.spool_dir.clone(),
        config.dot_replacer.clone(),
        config.default_annotation.clone(),
        governor,
        metadata,
        records_tx,
    ));

    let exporter = exporter::Exporter::new(hub, &config);

    let supervisor_task = tokio::spawn({
        let supervisor = supervisor.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { supervisor.run(shutdown_rx).await }
    });
    let exporter_task = tokio::spawn(exporter.run(shutdown_rx.clone()));

    wait_for_termination().await;
    tracing::info!("shutdown signal received, draining");
    shutdown_tx.shutdown();

    let drain = tokio::time::timeout(std::time::Duration::from_secs(30), async {
        let _ = supervisor_task.await;
        let _ = exporter_task.await;
    });
    if drain.await.is_err() {
        tracing::warn!("drain timed out, exiting anyway");
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
