//! Utility functions shared by the command-line tools

use std::fs;
use std::io::{self, IsTerminal};
use std::path::Path;

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins when set; otherwise the level follows `verbosity`
/// (0 = info, 1 = debug, 2+ = trace). `json_output` switches to one JSON
/// object per event.
pub fn init_logging(verbosity: u8, quiet: bool, json_output: bool) -> Result<()> {
    let default_level = if quiet {
        "error"
    } else {
        match verbosity {
            0 => "udtrain=info,warn",
            1 => "udtrain=debug,info",
            2 => "udtrain=trace,debug",
            _ => "trace",
        }
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(json_layer).try_init()?;
    } else {
        let fmt_layer = fmt::layer()
            .with_target(verbosity > 0)
            .with_ansi(io::stderr().is_terminal())
            .with_writer(io::stderr)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).try_init()?;
    }

    Ok(())
}

/// Ensure directory exists
pub fn ensure_dir_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Make a revision name usable as a single path component
pub fn revision_slug(revision: &str) -> String {
    let trimmed = revision.trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    last.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}
