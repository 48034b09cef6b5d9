//! Initialize a global [tracing] subscriber for a long running program.
//!
//! The filter comes from the `RUST_LOG` environment variable when it is set
//! and from a default supplied by the program otherwise, so binaries never
//! need to modify their own environment. Output goes to the console and,
//! optionally, is appended to a log file.

use std::path::{Path, PathBuf};

use time::{UtcOffset, format_description::well_known::Iso8601};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
};

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

/// Where log output goes and what is logged when `RUST_LOG` is unset.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Filter directives used when `RUST_LOG` is not set, e.g. `"myprog=info,warn"`.
    pub default_filter: String,
    /// File to append log lines to.
    pub log_file: Option<PathBuf>,
    /// Whether to log to stderr.
    pub console: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            default_filter: "info".into(),
            log_file: None,
            console: true,
        }
    }
}

struct Guard {
    log_file: Option<PathBuf>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(path) = &self.log_file {
            tracing::debug!("closing log file \"{}\"", path.display());
        }
    }
}

/// Log to the console with `default_filter` unless `RUST_LOG` is set.
pub fn init(default_filter: &str) -> Result<impl Drop> {
    initiate_logging(&LogOptions {
        default_filter: default_filter.into(),
        ..Default::default()
    })
}

/// Build the filter, preferring `RUST_LOG` over `default_filter`.
pub fn env_filter(default_filter: &str) -> EnvFilter {
    match std::env::var("RUST_LOG") {
        Ok(var) if !var.is_empty() => EnvFilter::new(var),
        _ => EnvFilter::new(default_filter),
    }
}

fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

/// Start logging to file and console, both optional.
pub fn initiate_logging(opts: &LogOptions) -> Result<impl Drop + use<>> {
    // Create a fixed offset time formatter based on the timezone at the
    // time this line of code runs.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file_layer = match &opts.log_file {
        Some(path) => {
            let file_writer = std::sync::Mutex::new(open_append(path)?);
            Some(
                fmt::layer()
                    .with_timer(timer.clone())
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };

    let console_layer = opts.console.then(|| {
        fmt::layer()
            .with_timer(timer)
            .with_writer(std::io::stderr)
            .with_file(true)
            .with_line_number(true)
    });

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(env_filter(&opts.default_filter));
    tracing::subscriber::set_global_default(collector)?;

    let source = match std::env::var("RUST_LOG") {
        Ok(var) if !var.is_empty() => format!("RUST_LOG=\"{var}\""),
        _ => format!("default filter \"{}\"", opts.default_filter),
    };
    if let Some(path) = &opts.log_file {
        tracing::debug!("Logging appended to \"{}\" with {source}.", path.display());
    }
    if opts.console {
        tracing::debug!("Logging to console with {source}.");
    }

    Ok(Guard {
        log_file: opts.log_file.clone(),
    })
}
