//! Logging utilities

use crate::Result;
use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Initialize logging: console plus a daily-rolling file.
///
/// `RUST_LOG` overrides `log_level` when set.
pub fn init<P: AsRef<Path>>(log_level: &str, log_file: P) -> Result<()> {
    let log_file = log_file.as_ref();
    let directory = log_file.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(directory)?;

    let file_appender = RollingFileAppender::new(
        Rotation::DAILY,
        directory,
        log_file.file_name().unwrap_or(std::ffi::OsStr::new("funding_arb.log")),
    );

    let console_layer = fmt::layer().with_target(true).with_thread_ids(true).with_line_number(true);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

/// Log a funding spread with structured fields
#[macro_export]
macro_rules! log_spread {
    ($level:ident, $symbol:expr, $short_exchange:expr, $long_exchange:expr, $annualized_pct:expr, $($field:tt)*) => {
        tracing::$level!(
            symbol = %$symbol,
            short_exchange = %$short_exchange,
            long_exchange = %$long_exchange,
            annualized_pct = %$annualized_pct,
            $($field)*
        );
    };
}

/// Log a paired position with structured fields
#[macro_export]
macro_rules! log_position {
    ($level:ident, $symbol:expr, $long_exchange:expr, $short_exchange:expr, $notional:expr, $($field:tt)*) => {
        tracing::$level!(
            symbol = %$symbol,
            long_exchange = %$long_exchange,
            short_exchange = %$short_exchange,
            notional_usd = %$notional,
            $($field)*
        );
    };
}

/// Log a circuit breaker or other risk event with structured fields
#[macro_export]
macro_rules! log_risk {
    ($level:ident, $risk_type:expr, $action:expr, $symbol:expr, $($field:tt)*) => {
        tracing::$level!(
            risk_type = %$risk_type,
            action = %$action,
            symbol = %$symbol,
            $($field)*
        );
    };
}

/// Log the outcome of a two-leg execution with structured fields
#[macro_export]
macro_rules! log_execution {
    ($level:ident, $action:expr, $symbol:expr, $success:expr, $($field:tt)*) => {
        tracing::$level!(
            action = %$action,
            symbol = %$symbol,
            success = $success,
            $($field)*
        );
    };
}
