//! Entry point: parse args, prepare the output directory, load the
//! recording, and hand off to the endurance orchestrator.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::prelude::*;

use core::error::{ShinyError, ShinyResult};
use core::event::Recording;

use shinycannon_player::cli::{Args, Credentials};
use shinycannon_player::orchestrator;

const USER_AGENT_PREFIX: &str = "shinycannon";

fn default_output_dir() -> PathBuf {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs();
    PathBuf::from(format!("shinycannon-output-{now}"))
}

fn init_tracing(args: &Args, output_dir: &std::path::Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let console_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.as_filter()));
    let console_layer = tracing_subscriber::fmt::layer().with_filter(console_filter);

    if !args.debug_log {
        tracing_subscriber::registry().with(console_layer).init();
        return None;
    }

    let file_appender = tracing_appender::rolling::never(output_dir, "debug.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let debug_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(tracing_subscriber::EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(debug_layer)
        .init();
    Some(guard)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ShinyResult<()> {
    let args = Args::parse();

    let output_dir = args.output_dir.clone().unwrap_or_else(default_output_dir);
    orchestrator::validate_output_dir(&output_dir, args.overwrite_output)?;

    let _debug_log_guard = init_tracing(&args, &output_dir);

    std::fs::copy(&args.recording_path, output_dir.join("recording.log")).map_err(|e| {
        ShinyError::Config(format!(
            "failed to copy recording {} into output dir: {e}",
            args.recording_path.display()
        ))
    })?;
    std::fs::write(
        output_dir.join("shinycannon-version.txt"),
        env!("CARGO_PKG_VERSION"),
    )?;

    let recording = Recording::load(&args.recording_path)?;
    tracing::info!(
        events = recording.events.len(),
        duration_ms = recording.duration_ms(),
        "loaded recording"
    );

    let warmup_interval_ms = args
        .start_interval
        .unwrap_or_else(|| orchestrator::default_warmup_interval_ms(&recording, args.workers));

    let argv_comment = std::env::args().collect::<Vec<_>>().join(" ");
    let args_json_comment = serde_json::to_string(&args)?;

    let credentials = Credentials::from_env();
    if credentials.is_none()
        && (std::env::var("SHINYCANNON_USER").is_ok() || std::env::var("SHINYCANNON_PASS").is_ok())
    {
        tracing::warn!(
            "only one of SHINYCANNON_USER/SHINYCANNON_PASS is set; the login flow stays disabled"
        );
    }

    let config = orchestrator::EnduranceConfig {
        num_workers: args.workers,
        warmup_interval_ms,
        loaded_duration_minutes: args.loaded_duration_minutes,
        output_dir,
        app_url: args.app_url.clone(),
        credentials,
        user_agent: format!("{USER_AGENT_PREFIX}/{}", env!("CARGO_PKG_VERSION")),
        argv_comment,
        args_json_comment,
    };

    orchestrator::run(config, Arc::new(recording)).await?;

    // The websocket client leaves non-daemon timer tasks running after the
    // last connection closes; without an explicit exit the process would
    // hang instead of returning control to the shell.
    std::process::exit(0);
}
