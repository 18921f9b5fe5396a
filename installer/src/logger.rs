//! Component-tagged logging on top of `tracing`.
//!
//! Call sites pass a short context tag (`"scanner"`, `"install"`, ...) so the
//! output can be filtered per subsystem. The subscriber is installed once by
//! [`init`]; before that every call is a cheap no-op.

use std::sync::{Mutex, OnceLock};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app_dirs;
use crate::config::LogSettings;

/// Environment variable that overrides the configured filter directive
pub const LOG_ENV: &str = "ACINSTALLER_LOG";

const DEFAULT_CONTEXT: &str = "general";

static FILE_GUARD: OnceLock<Mutex<Option<WorkerGuard>>> = OnceLock::new();

/// Install the global subscriber. Subsequent calls are ignored.
pub fn init(settings: &LogSettings) {
    FILE_GUARD.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(settings.level.as_str()));
        let console = fmt::layer().with_target(false);

        if settings.to_file {
            let dir = app_dirs::get_logs_dir();
            if std::fs::create_dir_all(&dir).is_ok() {
                let appender = tracing_appender::rolling::daily(&dir, app_dirs::LOG_FILE_NAME);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let file = fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(writer);
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(console)
                    .with(file)
                    .try_init();
                return Mutex::new(Some(guard));
            }
        }

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .try_init();
        Mutex::new(None)
    });
}

pub fn log_info(msg: &str, context: Option<&str>) {
    tracing::info!(context = context.unwrap_or(DEFAULT_CONTEXT), "{}", msg);
}

pub fn log_warning(msg: &str, context: Option<&str>) {
    tracing::warn!(context = context.unwrap_or(DEFAULT_CONTEXT), "{}", msg);
}

pub fn log_error(msg: &str, context: Option<&str>) {
    tracing::error!(context = context.unwrap_or(DEFAULT_CONTEXT), "{}", msg);
}

/// Debug-level message with optional free-form details (paths, sizes, ...)
pub fn log_debug(msg: &str, context: Option<&str>, details: Option<&str>) {
    let context = context.unwrap_or(DEFAULT_CONTEXT);
    match details {
        Some(details) => tracing::debug!(context, details, "{}", msg),
        None => tracing::debug!(context, "{}", msg),
    }
}

/// Shorthand for `logger::log_debug(msg, Some(context), None)`
#[macro_export]
macro_rules! log_debug {
    ($msg:expr, $context:expr) => {
        $crate::logger::log_debug(&$msg, Some($context), None)
    };
    ($msg:expr, $context:expr, $details:expr) => {
        $crate::logger::log_debug(
            &$msg,
            Some($context),
            Some(::std::convert::AsRef::<str>::as_ref(&$details)),
        )
    };
}
