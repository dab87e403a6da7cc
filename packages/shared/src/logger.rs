//! Logging setup utilities for the wsrelay binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Error messages.
pub const LOG_ERR: u32 = 1 << 0;
/// Warnings.
pub const LOG_WARN: u32 = 1 << 1;
/// Lifecycle notices.
pub const LOG_NOTICE: u32 = 1 << 2;
/// Informational messages.
pub const LOG_INFO: u32 = 1 << 3;
/// Debug output.
pub const LOG_DEBUG: u32 = 1 << 4;
/// Protocol parser tracing.
pub const LOG_PARSER: u32 = 1 << 5;
/// Handshake header dumps.
pub const LOG_HEADER: u32 = 1 << 6;
/// Extension negotiation tracing.
pub const LOG_EXT: u32 = 1 << 7;
/// Client-side tracing.
pub const LOG_CLIENT: u32 = 1 << 8;
/// Latency measurements.
pub const LOG_LATENCY: u32 = 1 << 9;
/// User-facing banner and status lines.
pub const LOG_USER: u32 = 1 << 10;

/// Default verbosity: user, error, warning and notice output.
pub const DEFAULT_LOG_MASK: u32 = LOG_USER | LOG_ERR | LOG_WARN | LOG_NOTICE;

/// Map a libwebsockets-style log bitmask onto a `tracing` level directive.
///
/// The most verbose bit that is set wins. A mask of zero silences logging.
///
/// # Examples
///
/// ```
/// use wsrelay_shared::logger::{DEFAULT_LOG_MASK, LOG_DEBUG, level_from_mask};
///
/// assert_eq!(level_from_mask(DEFAULT_LOG_MASK), "info");
/// assert_eq!(level_from_mask(LOG_DEBUG), "debug");
/// ```
pub fn level_from_mask(mask: u32) -> &'static str {
    const TRACE_BITS: u32 = LOG_PARSER | LOG_HEADER | LOG_EXT | LOG_CLIENT | LOG_LATENCY;

    if mask & TRACE_BITS != 0 {
        "trace"
    } else if mask & LOG_DEBUG != 0 {
        "debug"
    } else if mask & (LOG_INFO | LOG_NOTICE | LOG_USER) != 0 {
        "info"
    } else if mask & LOG_WARN != 0 {
        "warn"
    } else if mask & LOG_ERR != 0 {
        "error"
    } else {
        "off"
    }
}

/// Build the default filter directive for the given crates.
fn default_directive(targets: &[&str], default_log_level: &str) -> String {
    targets
        .iter()
        .map(|target| format!("{}={}", target.replace('-', "_"), default_log_level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialize the tracing subscriber with the specified default log level.
///
/// Logs go to stderr so they never interleave with the console prompt on
/// stdout. The level can be overridden using the `RUST_LOG` environment
/// variable.
///
/// # Arguments
///
/// * `targets` - Crate and binary names whose events should be shown
/// * `default_log_level` - The default log level (e.g., "debug", "info", "warn", "error")
///
/// # Examples
///
/// ```no_run
/// use wsrelay_shared::logger::setup_logger;
///
/// setup_logger(&["wsrelay-server"], "info");
/// ```
pub fn setup_logger(targets: &[&str], default_log_level: &str) {
    let directive = default_directive(targets, default_log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| directive.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
