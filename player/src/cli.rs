//! Command-line surface. This module's only job is to turn argv into a
//! typed [`Args`] and fill in the one default (`--start-interval`) that
//! depends on the loaded recording.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::Serialize;

/// Replay a captured Shiny session against a target application with N
/// concurrent workers for a bounded duration.
#[derive(Parser, Debug, Clone, Serialize)]
#[command(name = "shinycannon", rename_all = "kebab-case")]
pub struct Args {
    /// Path to the recording file produced by the capture tool.
    pub recording_path: PathBuf,

    /// Base URL of the application under test.
    pub app_url: String,

    /// Number of concurrent virtual users.
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Minutes to keep restarting sessions after ramp-up. 0 means run each
    /// worker for exactly one session.
    #[arg(long, default_value_t = 0.0)]
    pub loaded_duration_minutes: f64,

    /// Directory to write session CSVs, the recording copy, and the
    /// version stamp into. Defaults to a timestamped directory.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Allow reusing a non-empty `--output-dir`.
    #[arg(long)]
    pub overwrite_output: bool,

    /// Write a full debug trace to `<output-dir>/debug.log`.
    #[arg(long)]
    pub debug_log: bool,

    /// Milliseconds between consecutive worker starts during ramp-up.
    /// Defaults to the recording's duration divided by `--workers`.
    #[arg(long)]
    pub start_interval: Option<u64>,

    /// Console log verbosity.
    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[value(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// `SHINYCANNON_USER` / `SHINYCANNON_PASS`. Both must be present to enable
/// the login flow; their absence just means `maybe_login` is a no-op.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn from_env() -> Option<Self> {
        let user = std::env::var("SHINYCANNON_USER").ok()?;
        let password = std::env::var("SHINYCANNON_PASS").ok()?;
        Some(Self { user, password })
    }
}
