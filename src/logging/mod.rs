//! Logging initialization using `tracing` and `tracing-subscriber`.

use tracing::info;
use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Default to `debug` instead of `info` when `RUST_LOG` is unset.
    pub debug: bool,
}

/// Snapshot of the QID table, emitted when a server shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QidTableSnapshot {
    pub entries: usize,
    pub direct_encodes: u64,
    pub mapped_encodes: u64,
    pub salt_rerolls: u64,
    pub releases: u64,
}

/// Per-connection request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub fids_open: usize,
}

/// Initialize global tracing subscriber. Safe to call multiple times; subsequent
/// calls will no-op.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let default_level = if config.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match config.format {
        LogFormat::Human => {
            let _ = builder.finish().try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().finish().try_init();
        }
    };

    Ok(())
}

pub fn log_qid_table_metrics(snapshot: QidTableSnapshot) {
    info!(
        target = "unionfs::qid",
        entries = snapshot.entries,
        direct_encodes = snapshot.direct_encodes,
        mapped_encodes = snapshot.mapped_encodes,
        salt_rerolls = snapshot.salt_rerolls,
        releases = snapshot.releases,
        "qid_table_metrics"
    );
}

pub fn log_session_metrics(session: &str, snapshot: SessionSnapshot) {
    info!(
        target = "unionfs::session",
        session,
        requests = snapshot.requests,
        errors = snapshot.errors,
        fids_open = snapshot.fids_open,
        "session_metrics"
    );
}
