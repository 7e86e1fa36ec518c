//! The endurance orchestrator: ramps `num_workers` up at a staggered
//! cadence, keeps each one restarting sessions in place for
//! `loaded_duration_minutes`, then drains and reports final stats.
//!
//! Workers are `tokio` tasks rather than OS threads — the workspace already
//! runs on a multi-threaded runtime, so a task per worker gets the same
//! parallelism a one-thread-per-worker model would, without a second
//! runtime per thread. The two countdown latches (`warmup_latch`,
//! `finished_latch`) have no ready-made equivalent in `std`/`tokio`, so
//! they're built directly on `tokio::sync::Notify`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use core::event::{Event, Recording};
use core::stats::Stats;

use crate::cli::Credentials;
use crate::output::SessionWriter;
use crate::session::Session;

/// A counter that starts at `n` and lets any number of tasks wait until it
/// has been decremented to zero. Unlike a `Barrier`, decrementing and
/// waiting are different operations: the orchestrator's main task waits,
/// worker tasks count down.
struct CountdownLatch {
    remaining: AtomicU64,
    notify: tokio::sync::Notify,
}

impl CountdownLatch {
    fn new(n: u64) -> Self {
        Self {
            remaining: AtomicU64::new(n),
            notify: tokio::sync::Notify::new(),
        }
    }

    fn count_down(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.notify.notified();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct EnduranceConfig {
    pub num_workers: usize,
    pub warmup_interval_ms: u64,
    pub loaded_duration_minutes: f64,
    pub output_dir: PathBuf,
    pub app_url: String,
    pub credentials: Option<Credentials>,
    pub user_agent: String,
    pub argv_comment: String,
    pub args_json_comment: String,
}

/// Runs the full endurance workload and returns once every worker has
/// drained. Does not itself exit the process — force-terminating
/// (required because the WebSocket client leaves non-daemon timers
/// running) is `main`'s job, after this returns.
pub async fn run(config: EnduranceConfig, recording: Arc<Recording>) -> core::error::ShinyResult<()> {
    let stats = Arc::new(Stats::new());
    let keep_working = Arc::new(AtomicBool::new(true));
    let session_num = Arc::new(AtomicU64::new(0));
    let warmup_latch = Arc::new(CountdownLatch::new(config.num_workers as u64));
    let finished_latch = Arc::new(CountdownLatch::new(config.num_workers as u64));
    let keep_showing_stats = Arc::new(AtomicBool::new(true));

    let ticker = {
        let stats = stats.clone();
        let keep_showing_stats = keep_showing_stats.clone();
        tokio::spawn(async move {
            while keep_showing_stats.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_secs(5)).await;
                if keep_showing_stats.load(Ordering::Relaxed) {
                    tracing::info!("{}", stats.snapshot());
                }
            }
        })
    };

    let mut worker_handles = Vec::with_capacity(config.num_workers);
    for worker_id in 0..config.num_workers {
        let stagger_ms = worker_id as u64 * config.warmup_interval_ms;
        let recording = recording.clone();
        let stats = stats.clone();
        let keep_working = keep_working.clone();
        let session_num = session_num.clone();
        let warmup_latch = warmup_latch.clone();
        let finished_latch = finished_latch.clone();
        let output_dir = config.output_dir.clone();
        let app_url = config.app_url.clone();
        let credentials = config.credentials.clone();
        let user_agent = config.user_agent.clone();
        let argv_comment = config.argv_comment.clone();
        let args_json_comment = config.args_json_comment.clone();

        worker_handles.push(tokio::spawn(async move {
            run_worker(WorkerArgs {
                worker_id,
                stagger_ms,
                recording,
                stats,
                keep_working,
                session_num,
                warmup_latch,
                finished_latch,
                output_dir,
                app_url,
                credentials,
                user_agent,
                argv_comment,
                args_json_comment,
            })
            .await;
        }));
    }

    warmup_latch.wait().await;
    if config.loaded_duration_minutes > 0.0 {
        let millis = (config.loaded_duration_minutes * 60_000.0) as u64;
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }
    keep_working.store(false, Ordering::Release);

    finished_latch.wait().await;
    keep_showing_stats.store(false, Ordering::Release);
    ticker.abort();

    for handle in worker_handles {
        let _ = handle.await;
    }

    tracing::info!(final_stats = %stats.snapshot(), "endurance run complete");
    Ok(())
}

struct WorkerArgs {
    worker_id: usize,
    stagger_ms: u64,
    recording: Arc<Recording>,
    stats: Arc<Stats>,
    keep_working: Arc<AtomicBool>,
    session_num: Arc<AtomicU64>,
    warmup_latch: Arc<CountdownLatch>,
    finished_latch: Arc<CountdownLatch>,
    output_dir: PathBuf,
    app_url: String,
    credentials: Option<Credentials>,
    user_agent: String,
    argv_comment: String,
    args_json_comment: String,
}

async fn run_worker(args: WorkerArgs) {
    let mut iteration: u64 = 0;

    run_one_iteration(
        &args,
        iteration,
        args.stagger_ms as i64,
        Some(&args.warmup_latch),
        args.credentials.clone(),
    )
    .await;
    iteration += 1;

    while args.keep_working.load(Ordering::Acquire) {
        run_one_iteration(&args, iteration, 0, None, args.credentials.clone()).await;
        iteration += 1;
    }

    args.finished_latch.count_down();
}

async fn run_one_iteration(
    args: &WorkerArgs,
    iteration: u64,
    start_delay_ms: i64,
    warmup_latch: Option<&CountdownLatch>,
    credentials: Option<Credentials>,
) {
    let session_id = args.session_num.fetch_add(1, Ordering::Relaxed);

    let session = match Session::new(
        session_id,
        args.worker_id,
        iteration,
        &args.app_url,
        credentials,
        &args.user_agent,
    ) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(session_id, worker_id = args.worker_id, error = %e, "failed to build session");
            if let Some(latch) = warmup_latch {
                latch.count_down();
            }
            return;
        }
    };

    let mut writer = match SessionWriter::create(
        &args.output_dir,
        session_id,
        args.worker_id,
        iteration,
        &args.argv_comment,
        &args.args_json_comment,
    ) {
        Ok(writer) => writer,
        Err(e) => {
            tracing::error!(session_id, worker_id = args.worker_id, error = %e, "failed to open session output file");
            if let Some(latch) = warmup_latch {
                latch.count_down();
            }
            return;
        }
    };

    let events: &[Event] = &args.recording.events;
    let stats = args.stats.clone();

    let result = session
        .run(events, &mut writer, &stats, start_delay_ms, || {
            if let Some(latch) = warmup_latch {
                latch.count_down();
            }
        })
        .await;

    if let Err(e) = result {
        tracing::warn!(
            session_id,
            worker_id = args.worker_id,
            iteration,
            error = %e,
            "session failed"
        );
    } else {
        tracing::debug!(session_id, worker_id = args.worker_id, iteration, "session done");
    }
}

/// `--start-interval`'s default: the recording's wall-clock span divided
/// evenly across the workers, so the whole ramp-up takes about as long as
/// one full playback.
pub fn default_warmup_interval_ms(recording: &Recording, num_workers: usize) -> u64 {
    if num_workers == 0 {
        return 0;
    }
    (recording.duration_ms() / num_workers as i64).max(0) as u64
}

pub fn validate_output_dir(path: &Path, overwrite: bool) -> core::error::ShinyResult<()> {
    if path.exists() {
        let has_entries = std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        if has_entries && !overwrite {
            return Err(core::error::ShinyError::Config(format!(
                "output dir {} already exists and is not empty (pass --overwrite-output to reuse it)",
                path.display()
            )));
        }
    }
    std::fs::create_dir_all(path)?;
    Ok(())
}
