//! Logging setup shared by the calibration and capture binaries.
//!
//! Console output (and optionally a log file) is filtered by `RUST_LOG`. When
//! the variable is unset, events at `info` and above are shown, which is the
//! level the tools report their progress at.

use time::{UtcOffset, format_description::well_known::Iso8601};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
};

/// Filter directive used when `RUST_LOG` is not set.
pub const DEFAULT_DIRECTIVE: &str = "info";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cannot determine local UTC offset: {0}")]
    Offset(String),
    #[error("cannot create log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid RUST_LOG directive: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),
    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Keeps logging alive for the lifetime of `main`.
pub struct Guard {
    _private: (),
}

impl Drop for Guard {
    fn drop(&mut self) {
        tracing::trace!("logging guard dropped");
    }
}

/// Log to the console only.
pub fn init() -> Result<Guard, Error> {
    initiate_logging::<&str>(None, false)
}

fn env_filter() -> Result<EnvFilter, Error> {
    match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => Ok(EnvFilter::try_new(directives)?),
        _ => Ok(EnvFilter::new(DEFAULT_DIRECTIVE)),
    }
}

/// Start logging to file and console, both optional.
pub fn initiate_logging<P: AsRef<std::path::Path>>(
    path: Option<P>,
    disable_console: bool,
) -> Result<Guard, Error> {
    // Fixed offset from the timezone in effect when logging starts.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())
            .map_err(|e| Error::Offset(e.to_string()))?,
        Iso8601::DEFAULT,
    );

    let file_layer = match &path {
        Some(path) => {
            let path = path.as_ref();
            let file = std::fs::File::create(path).map_err(|source| Error::LogFile {
                path: path.display().to_string(),
                source,
            })?;
            Some(
                fmt::layer()
                    .with_timer(timer.clone())
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_target(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };

    let console_layer = if disable_console {
        None
    } else {
        Some(
            fmt::layer()
                .with_timer(timer)
                .with_ansi(!cfg!(windows))
                .with_target(true),
        )
    };

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter()?);
    tracing::subscriber::set_global_default(collector)?;

    let log_var = match std::env::var("RUST_LOG") {
        Ok(var) => format!(" with RUST_LOG=\"{var}\"."),
        Err(_) => format!(" with default filter \"{DEFAULT_DIRECTIVE}\"."),
    };
    if let Some(path) = &path {
        tracing::debug!(
            "Logging initiated to file \"{}\"{log_var}",
            path.as_ref().display()
        );
    }
    if !disable_console {
        tracing::debug!("Logging initiated to console{log_var}");
    }

    Ok(Guard { _private: () })
}
