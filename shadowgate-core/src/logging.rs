use crate::config::LogLevel;
use crate::error::{Error, Result};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static INIT: Once = Once::new();

/// Initialize logging system
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level);
    });

    result
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let tracing_level = match level {
        LogLevel::Silent => return Ok(()), // Don't initialize logging
        LogLevel::Error => Level::ERROR,
        LogLevel::Warning => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(
            format!("shadowgate_core={}", tracing_level)
                .parse()
                .map_err(|e| Error::config(format!("Invalid log directive: {}", e)))?,
        )
        .add_directive(
            "tokio=warn"
                .parse()
                .map_err(|e| Error::config(format!("Invalid log directive: {}", e)))?,
        );

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .compact()
        .with_filter(filter);

    // try_init so an embedding application's subscriber wins.
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
    Ok(())
}

/// Log an error with context, severity keyed off the error category.
pub fn log_error(error: &Error, context: Option<&str>) {
    let level = match error.code() {
        "CONFIG" => Level::ERROR,
        "NETWORK" | "IO" | "CANT_CONNECT" => Level::WARN,
        "CLIENT_DISCONNECTED" | "REMOTE_DISCONNECTED" => Level::DEBUG,
        _ => Level::WARN,
    };

    match level {
        Level::ERROR => {
            if let Some(ctx) = context {
                tracing::error!("{}: {}", ctx, error);
            } else {
                tracing::error!("{}", error);
            }
        }
        Level::WARN => {
            if let Some(ctx) = context {
                tracing::warn!("{}: {}", ctx, error);
            } else {
                tracing::warn!("{}", error);
            }
        }
        _ => {
            if let Some(ctx) = context {
                tracing::debug!("{}: {}", ctx, error);
            } else {
                tracing::debug!("{}", error);
            }
        }
    }
}
