//! Process entry point (SPEC_FULL §A.1): parses the CLI, installs a
//! `tracing-subscriber` `fmt` layer, and hands off to [`logflowd::run`].

use std::path::PathBuf;

use clap::Parser;
use logflowd::Cli as RunCli;
use tracing_subscriber::EnvFilter;

/// Per-node log-shipping agent for the JSON-file container log driver.
#[derive(Parser, Debug)]
#[command(name = "logflowd", version, about)]
struct Args {
    /// Path to the `key = value` configuration file (spec §6).
    #[arg(long, default_value = "/etc/logflowd/logflowd.conf")]
    config: PathBuf,

    /// Directory of `*.log` symlinks the host maintains per container
    /// (overrides the config file's implicit default).
    #[arg(long)]
    containers_dir: Option<PathBuf>,

    /// Spool directory the agent owns (defaults to `<containers-dir>/logflow/`).
    #[arg(long)]
    spool_dir: Option<PathBuf>,

    /// Log level filter, e.g. `info`, `debug`, `logflowd=trace`. Falls
    /// back to `LOGFLOWD_LOG`, then `RUST_LOG`, then `info`.
    #[arg(long, env = "LOGFLOWD_LOG")]
    log_level: Option<String>,

    /// Emit logs as JSON instead of human-readable text.
    #[arg(long)]
    log_format_json: bool,
}

fn main() {
    let args = Args::parse();
    init_logging(args.log_level.as_deref(), args.log_format_json);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let cli = RunCli { config_path: args.config, containers_dir: args.containers_dir, spool_dir: args.spool_dir };

    if let Err(e) = runtime.block_on(logflowd::run(cli)) {
        tracing::error!(error = %e, "logflowd exited with an error");
        std::process::exit(1);
    }
}

fn init_logging(log_level: Option<&str>, json: bool) {
    let filter = match log_level {
        Some(l) => EnvFilter::try_new(l),
        None => EnvFilter::try_from_env("RUST_LOG"),
    }
    .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
