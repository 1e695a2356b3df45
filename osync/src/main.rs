use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "osync",
    version,
    about = "Synchronize a local directory into a remote object store",
    long_about = "`osync` uploads every file under LOCAL_DIR that is missing or stale under REMOTE_DIR
and, optionally, deletes remote objects that have no local counterpart. Nothing is ever
downloaded and local files are never modified.

A file is considered stale when its size differs from the remote object, or with --md5 when
its MD5 digest differs. Every processed item is reported on its own line; failures are
collected and listed at the end, and the exit code is 1 if there were any.

EXAMPLES:
    # Upload new and changed files
    osync --store file:///srv/objects ~/photos /stor/photos

    # Preview what a full mirror would do
    osync --store s3://bucket ~/photos /photos --md5 --delete --dry-run"
)]
struct Args {
    // Sync options
    /// Remote store to sync into
    ///
    /// `file:///path` (or a plain directory path) uses a local directory as the object store,
    /// `memory:` an empty in-process store. `s3://bucket` and `gs://bucket` are available when
    /// built with the `object-store` feature and take credentials from the environment.
    #[arg(long, value_name = "URL", help_heading = "Sync options")]
    store: String,

    /// Maximum number of outstanding remote operations in each stage
    #[arg(
        short = 'c',
        long,
        default_value = "50",
        value_name = "N",
        help_heading = "Sync options"
    )]
    concurrency: usize,

    /// Number of copies to keep of each uploaded object
    #[arg(long, default_value = "2", value_name = "N", help_heading = "Sync options")]
    copies: u32,

    /// Compare MD5 digests instead of sizes
    #[arg(short = 'm', long, help_heading = "Sync options")]
    md5: bool,

    /// Show what would be uploaded and deleted without changing anything
    #[arg(short = 'n', long, help_heading = "Sync options")]
    dry_run: bool,

    /// Delete remote objects that do not exist locally, after uploading
    #[arg(short = 'd', long, help_heading = "Sync options")]
    delete: bool,

    /// Only delete remote objects that do not exist locally, upload nothing
    #[arg(short = 'j', long, help_heading = "Sync options")]
    just_delete: bool,

    /// Extra header sent with every upload, "Name: value" (can be specified multiple times)
    #[arg(short = 'H', long = "header", value_name = "HEADER", action = clap::ArgAction::Append, help_heading = "Sync options")]
    headers: Vec<String>,

    // Progress & output
    /// Write per-item lines to this file instead of stdout; the file must not exist
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    log: Option<std::path::PathBuf>,

    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print the summary at the end even with --quiet
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't print per-item lines, logs or the final summary
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of open files, 0 means no limit, leaving unspecified means using 80% of max open files system limit
    #[arg(long, value_name = "N", help_heading = "Performance & throttling")]
    max_open_files: Option<usize>,

    /// Throttle the number of remote requests per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    ops_throttle: usize,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Local directory to sync from
    #[arg()]
    local_dir: std::path::PathBuf,

    /// Remote directory to sync into
    #[arg()]
    remote_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoreUrl {
    Directory(std::path::PathBuf),
    Memory,
    #[cfg(feature = "object-store")]
    Object(String),
}

fn parse_store_url(url: &str) -> Result<StoreUrl> {
    if url == "memory:" {
        return Ok(StoreUrl::Memory);
    }
    if let Some(path) = url.strip_prefix("file://") {
        if path.is_empty() {
            return Err(anyhow!("store URL {url:?} has no path"));
        }
        return Ok(StoreUrl::Directory(std::path::PathBuf::from(path)));
    }
    if url.starts_with("s3://") || url.starts_with("gs://") {
        #[cfg(feature = "object-store")]
        return Ok(StoreUrl::Object(url.to_string()));
        #[cfg(not(feature = "object-store"))]
        return Err(anyhow!(
            "store URL {url:?} requires osync to be built with the `object-store` feature"
        ));
    }
    if url.contains("://") {
        return Err(anyhow!("unsupported store URL {url:?}"));
    }
    Ok(StoreUrl::Directory(std::path::PathBuf::from(url)))
}

impl Args {
    fn settings(&self) -> Result<common::Settings> {
        let headers = self
            .headers
            .iter()
            .map(|header| common::parse_header(header.as_str()))
            .collect::<Result<Vec<_>>>()?;
        let delete = if self.just_delete {
            common::DeleteMode::Only
        } else if self.delete {
            common::DeleteMode::AfterSync
        } else {
            common::DeleteMode::Never
        };
        let settings = common::Settings {
            concurrency: self.concurrency,
            copies: self.copies,
            compare: if self.md5 {
                common::CompareMode::Checksum
            } else {
                common::CompareMode::Size
            },
            dry_run: self.dry_run,
            delete,
            headers,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn progress_requested(&self) -> bool {
        self.progress || self.progress_type.is_some() || self.progress_delay.is_some()
    }
}

#[instrument(skip(state))]
async fn async_main(args: Args, state: Arc<common::RunState>) -> Result<common::Report> {
    let settings = args.settings()?;
    let store_url = parse_store_url(&args.store)?;
    let log = common::ItemLog::new(args.log.as_deref(), args.quiet).await?;
    let report = match store_url {
        StoreUrl::Directory(root) => {
            let metadata = tokio::fs::metadata(&root)
                .await
                .with_context(|| format!("store directory {root:?} is not accessible"))?;
            if !metadata.is_dir() {
                return Err(anyhow!("store directory {root:?} is not a directory"));
            }
            let store = Arc::new(store::FsStore::new(root));
            common::sync(store, &args.local_dir, &args.remote_dir, &settings, state, log).await
        }
        StoreUrl::Memory => {
            let store = Arc::new(store::MemoryStore::new());
            common::sync(store, &args.local_dir, &args.remote_dir, &settings, state, log).await
        }
        #[cfg(feature = "object-store")]
        StoreUrl::Object(url) => {
            let store = Arc::new(store::ObjectStoreClient::from_url(&url)?);
            common::sync(store, &args.local_dir, &args.remote_dir, &settings, state, log).await
        }
    };
    Ok(report)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let state = Arc::new(common::RunState::new());
    let func = {
        let args = args.clone();
        let state = Arc::clone(&state);
        || async_main(args, state)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary || !args.quiet,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_open_files: args.max_open_files,
        ops_throttle: args.ops_throttle,
    };
    let res = common::run(
        if args.progress_requested() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay.clone(),
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        state,
        func,
    );
    let Some(report) = res else {
        std::process::exit(1);
    };
    if !report.success() {
        std::process::exit(report.exit_code());
    }
    Ok(())
}
