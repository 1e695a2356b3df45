//! Common library for `osync` - one-directional synchronization of a local tree into a remote
//! object store
//!
//! This crate holds the synchronization pipeline and the process harness around it. The remote
//! side is reached exclusively through [`store::RemoteStore`].
//!
//! # Pipeline
//!
//! [`sync()`] runs the stages in strict sequence, each one a [`queue::BoundedQueue`] drained before
//! the next starts:
//!
//! - [`walk`] enumerates local regular files and [`path`] maps each to its remote path
//! - [`compare`] classifies every file using [`oracle`] (size, or MD5 with `--md5`)
//! - [`upload`] streams the files that need it
//! - [`reconcile`] deletes remote objects that have no local counterpart (`--delete`, `--just-delete`)
//!
//! # Error Handling
//!
//! Per-item failures never abort a stage; they are recorded in the run's [`RunState`] and listed in
//! the final [`Report`]. The process exit status is nonzero iff that list is non-empty.
//!
//! # Introspection
//!
//! [`RunState::snapshot`] can be polled at any time. [`run`] wires it to periodic progress output
//! and, on Unix, to `SIGUSR1`.

use std::sync::Arc;

use anyhow::Context;

pub mod compare;
pub mod config;
pub mod item_log;
pub mod oracle;
pub mod path;
pub mod progress;
pub mod queue;
pub mod reconcile;
pub mod state;
pub mod summary;
pub mod sync;
pub mod upload;
pub mod walk;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, ProgressSettings, ProgressType, RuntimeConfig, ThrottleConfig};
pub use item_log::ItemLog;
pub use oracle::CompareMode;
pub use state::{RunState, StatusSnapshot};
pub use summary::{Report, Summary};
pub use sync::{DeleteMode, Settings, parse_header, sync};

fn init_tracing(output: &OutputConfig) {
    let filter = if output.quiet {
        tracing_subscriber::EnvFilter::new("off")
    } else {
        let level = match output.verbose {
            0 => tracing::level_filters::LevelFilter::ERROR,
            1 => tracing::level_filters::LevelFilter::INFO,
            2 => tracing::level_filters::LevelFilter::DEBUG,
            _ => tracing::level_filters::LevelFilter::TRACE,
        };
        tracing_subscriber::EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy()
    };
    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("failed to initialize logging: {error}");
    }
}

fn build_runtime(config: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.max_workers > 0 {
        builder.worker_threads(config.max_workers);
    }
    if config.max_blocking_threads > 0 {
        builder.max_blocking_threads(config.max_blocking_threads);
    }
    builder.build().context("failed to create tokio runtime")
}

/// 80% of the soft `RLIMIT_NOFILE`.
fn default_max_open_files() -> anyhow::Result<usize> {
    let (soft, _hard) = nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)
        .context("failed to query the open files limit")?;
    let soft = usize::try_from(soft).unwrap_or(usize::MAX);
    Ok(soft / 10 * 8)
}

/// Applies the throttle settings; must be called from within the runtime.
fn configure_throttle(config: &ThrottleConfig) -> anyhow::Result<()> {
    let max_open_files = match config.max_open_files {
        Some(max_open_files) => max_open_files,
        None => default_max_open_files()?,
    };
    tracing::debug!("max open files: {}", max_open_files);
    throttle::set_max_open_files(max_open_files);
    if config.ops_throttle > 0 {
        let (tokens, interval) = throttle::request_rate_to_tokens(config.ops_throttle);
        tracing::debug!("request throttle: {} per {:?}", tokens, interval);
        throttle::init_request_tokens(tokens);
        tokio::spawn(throttle::run_request_replenish(interval));
    }
    Ok(())
}

struct ProgressTask {
    bar: Option<indicatif::ProgressBar>,
    task: tokio::task::JoinHandle<()>,
}

impl ProgressTask {
    fn start(settings: &ProgressSettings, state: Arc<RunState>) -> anyhow::Result<Self> {
        use std::io::IsTerminal;
        let (progress_type, delay) = settings.resolve(std::io::stderr().is_terminal())?;
        if progress_type == ProgressType::ProgressBar {
            let bar = indicatif::ProgressBar::new_spinner();
            bar.set_style(
                indicatif::ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
                    .context("invalid progress bar template")?,
            );
            let task_bar = bar.clone();
            let task = tokio::spawn(async move {
                let printer = progress::ProgressPrinter::new(&state);
                loop {
                    task_bar.set_message(printer.line());
                    task_bar.tick();
                    tokio::time::sleep(delay).await;
                }
            });
            Ok(Self {
                bar: Some(bar),
                task,
            })
        } else {
            let task = tokio::spawn(async move {
                let mut printer = progress::ProgressPrinter::new(&state);
                loop {
                    tokio::time::sleep(delay).await;
                    eprintln!("{}", printer.print());
                }
            });
            Ok(Self { bar: None, task })
        }
    }

    fn stop(self) {
        self.task.abort();
        if let Some(bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}

#[cfg(unix)]
fn spawn_status_dump(state: Arc<RunState>) -> Option<tokio::task::JoinHandle<()>> {
    let mut signals =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1()) {
            Ok(signals) => signals,
            Err(error) => {
                tracing::warn!("cannot listen for SIGUSR1: {}", error);
                return None;
            }
        };
    Some(tokio::spawn(async move {
        while signals.recv().await.is_some() {
            eprint!("{}", state.snapshot());
        }
    }))
}

#[cfg(not(unix))]
fn spawn_status_dump(_state: Arc<RunState>) -> Option<tokio::task::JoinHandle<()>> {
    None
}

/// Runs `func` on a freshly built runtime with logging, throttling and progress reporting set up.
///
/// Returns `None` if `func` (or the setup) failed; the error has been printed unless quiet. On
/// success the result is printed when a summary was requested.
pub fn run<T, Fut>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle_config: ThrottleConfig,
    state: Arc<RunState>,
    func: impl FnOnce() -> Fut,
) -> Option<T>
where
    T: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    init_tracing(&output);
    let res = build_runtime(&runtime).and_then(|runtime| {
        runtime.block_on(async move {
            configure_throttle(&throttle_config)?;
            let progress_task = match &progress {
                Some(settings) => Some(ProgressTask::start(settings, Arc::clone(&state))?),
                None => None,
            };
            let status_dump = spawn_status_dump(Arc::clone(&state));
            let res = func().await;
            if let Some(progress_task) = progress_task {
                progress_task.stop();
            }
            if let Some(status_dump) = status_dump {
                status_dump.abort();
            }
            res
        })
    });
    match res {
        Ok(result) => {
            if output.print_summary || output.verbose > 0 {
                println!("{result}");
            }
            Some(result)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
