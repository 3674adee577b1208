//! Logging bootstrap for the rampart binary.

use std::env;

use tracing::Level;
use tracing_subscriber::EnvFilter;

use rampart_service::config::{Config, LogFormat};

fn get_rust_log(level: &str) -> String {
    match level {
        "off" => String::new(),
        "error" | "warn" | "info" => level.to_owned(),
        "debug" | "trace" => {
            format!("info,rampart={level},rampart_service={level}")
        }
        // anything else is taken as a ready-made filter expression
        custom => custom.to_owned(),
    }
}

/// Resolves `Auto` against whether the process is attached to a
/// terminal.
fn effective_format(format: LogFormat) -> LogFormat {
    match format {
        LogFormat::Auto if console::user_attended() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        other => other,
    }
}

/// Initializes logging for rampart.
///
/// A `RUST_LOG` environment variable wins when present; otherwise the
/// configured level seeds the filter. `RUST_BACKTRACE` is toggled from
/// the `enable_backtraces` config value.
pub fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        env::set_var("RUST_BACKTRACE", "1");
    }

    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", get_rust_log(&config.logging.level));
    }

    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
    match effective_format(config.logging.format) {
        LogFormat::Json => builder.json().init(),
        LogFormat::Simplified => builder.compact().init(),
        // Auto was resolved above; what remains is the tty format
        _ => builder.pretty().init(),
    }
}

/// Logs a fatal error through the subscriber when one can observe it,
/// falling back to stderr during early startup.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::event_enabled!(Level::ERROR) {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}
