use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. Stdout carries the event feed, so logs go to stderr,
/// plus a plain-text copy appended to `log_file` when one is configured.
///
/// Returns the log file actually opened.
pub fn init_logging(debug: bool, log_file: Option<&Path>) -> Option<PathBuf> {
    let level = resolve_level(debug, std::env::var("PIECEMEAL_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let opened = log_file.and_then(|path| match open_log_file(path) {
        Ok(file) => Some((path.to_path_buf(), file)),
        Err(err) => {
            eprintln!("log_file_error: {}: {err}", path.display());
            None
        }
    });
    let (opened_path, file_layer) = match opened {
        Some((path, file)) => (
            Some(path),
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            ),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .ok()?;
    opened_path
}

fn resolve_level(debug: bool, env_level: Option<String>) -> String {
    match env_level {
        Some(level) if !level.trim().is_empty() => level,
        _ if debug || env_flag("PIECEMEAL_DEBUG") => "debug".to_string(),
        _ => "info".to_string(),
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).is_ok_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}
