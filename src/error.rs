//! Error taxonomy for `logflowd`, partitioned along the four classes in
//! spec §7: programmer-bug (fatal), transient I/O/network, user-facing
//! configuration/annotation mistakes, and everything else that simply
//! bubbles up to the task boundary and ends that task.
//!
//! `snafu` over `thiserror` to match the root `vector` crate's choice.

use std::path::PathBuf;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LogflowError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    ConfigRead { path: PathBuf, source: std::io::Error },

    #[snafu(display("config key {key:?} at {}:{line}: {reason}", path.display()))]
    ConfigParse { path: PathBuf, line: usize, key: String, reason: String },

    #[snafu(display("spool I/O on {}: {source}", dir.display()))]
    SpoolIo { dir: PathBuf, source: std::io::Error },

    #[snafu(display("malformed cursor file {}", path.display()))]
    CursorFormat { path: PathBuf },

    #[snafu(display("annotation config invalid: {reason}"))]
    AnnotationConfig { reason: String },

    #[snafu(display("bulk export transport error: {source}"))]
    ExportTransport { source: hyper::Error },

    #[snafu(display("metadata request failed: {source}"))]
    MetadataTransport { source: hyper::Error },

    #[snafu(display("{reason}"))]
    Fatal { reason: String },
}

pub type Result<T, E = LogflowError> = std::result::Result<T, E>;

/// Logs a programmer-bug class error at `error!` and aborts the process, per
/// spec §7.1. Reserved for invariant violations that indicate a bug in
/// `logflowd` itself, never for environment or operator mistakes.
#[track_caller]
pub fn fatal(reason: impl Into<String>) -> ! {
    let reason = reason.into();
    tracing::error!(location = %std::panic::Location::caller(), %reason, "fatal invariant violation, aborting");
    std::process::abort();
}
