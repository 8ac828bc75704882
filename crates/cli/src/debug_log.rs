//! Per-invocation trace log
//!
//! Every run writes a full trace to `<tmp>/bam-<uuid>.log` while the console
//! only shows warnings (or debug output with `--verbose`). The path is printed
//! when a command fails.

use std::path::PathBuf;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer as _, fmt};

/// Default file filter; `RUST_LOG` replaces it
const FILE_FILTER: &str = "warn,bam=trace,bam_core=trace,bam_transport=trace,bam_server=trace";

/// Live logging for one run; dropping it flushes the trace file
pub struct LogSession {
    pub log_path: PathBuf,
    pub guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Install the file and console subscribers
pub fn init(verbose: bool) -> LogSession {
    let dir = std::env::temp_dir();
    let name = format!("bam-{}.log", uuid::Uuid::new_v4());
    let log_path = dir.join(&name);

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(&dir, &name));
    let file_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(FILE_FILTER));
    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_names(true)
        .with_line_number(true)
        .with_filter(file_filter);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .with_filter(if verbose {
            LevelFilter::DEBUG
        } else {
            LevelFilter::WARN
        });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .init();

    LogSession { log_path, guard }
}
