//! Pipeline orchestration
//!
//! A run goes through up to four stages, each finishing completely before the next begins:
//!
//! 1. **enumerate** - walk the local sync root and map every regular file to its remote path
//! 2. **compare** - classify each file as unchanged, needing upload, or failed
//! 3. **upload** - upload every file that needs it
//! 4. **reconcile** - list the remote sync root and delete objects with no local counterpart
//!
//! With [`DeleteMode::Only`] stages 2 and 3 are skipped; with [`DeleteMode::Never`] stage 4 is.
//! Per-item failures are recorded in [`RunState`] and never stop sibling items. The remote store
//! is closed exactly once, on every path out of [`sync`].

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::instrument;

use crate::item_log::ItemLog;
use crate::oracle::CompareMode;
use crate::path::FileRecord;
use crate::state::{RunState, Stage};
use crate::summary::Report;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum DeleteMode {
    /// Never delete remote objects.
    #[default]
    Never,
    /// Delete remote orphans once uploads are done.
    AfterSync,
    /// Only delete remote orphans, do not compare or upload.
    Only,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Ceiling on outstanding operations within each stage.
    pub concurrency: usize,
    /// Replication factor requested for uploaded objects.
    pub copies: u32,
    pub compare: CompareMode,
    /// Classify and log everything but issue no upload or delete calls.
    pub dry_run: bool,
    pub delete: DeleteMode,
    /// Extra headers sent with every upload.
    pub headers: Vec<(String, String)>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: 50,
            copies: 2,
            compare: CompareMode::default(),
            dry_run: false,
            delete: DeleteMode::default(),
            headers: vec![],
        }
    }
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

fn validate_header_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(is_token_char) {
        return Err(anyhow!("invalid header name {name:?}"));
    }
    Ok(())
}

/// Parses a `Name: value` header.
pub fn parse_header(header: &str) -> Result<(String, String)> {
    let (name, value) = header
        .split_once(':')
        .with_context(|| format!("invalid header {header:?}, expected \"Name: value\""))?;
    let name = name.trim();
    validate_header_name(name)?;
    Ok((name.to_string(), value.trim().to_string()))
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(anyhow!("concurrency must be at least 1"));
        }
        if self.copies == 0 {
            return Err(anyhow!("copies must be at least 1"));
        }
        for (name, _) in &self.headers {
            validate_header_name(name)?;
        }
        Ok(())
    }
}

/// Everything a stage worker needs, cheap to clone into each worker.
pub struct RunContext<S> {
    pub store: Arc<S>,
    pub state: Arc<RunState>,
    pub log: ItemLog,
    pub settings: Arc<Settings>,
}

impl<S> Clone for RunContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
            log: self.log.clone(),
            settings: Arc::clone(&self.settings),
        }
    }
}

/// Failure of a single item, rendered into the run's error list.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub code: String,
    pub message: String,
}

impl ItemFailure {
    #[must_use]
    pub fn describe(&self, action: &str, remote_path: &str, progress: (u64, u64)) -> String {
        format!(
            "{action} {remote_path} failed ({}): {} [{}/{}]",
            self.code, self.message, progress.0, progress.1
        )
    }
}

impl From<store::Error> for ItemFailure {
    fn from(error: store::Error) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

impl From<crate::oracle::ReadError> for ItemFailure {
    fn from(error: crate::oracle::ReadError) -> Self {
        Self {
            code: error.code(),
            message: error.to_string(),
        }
    }
}

#[instrument(skip(ctx))]
async fn enumerate<S>(
    ctx: &RunContext<S>,
    local_root: &std::path::Path,
    remote_root: &str,
) -> Result<Vec<Arc<FileRecord>>> {
    let entries = crate::walk::walk(local_root).await?;
    let mut files = Vec::with_capacity(entries.len());
    for (local_path, metadata) in entries {
        ctx.state.files_found.inc();
        match FileRecord::new(local_root, remote_root, local_path, &metadata) {
            Ok(file) => files.push(Arc::new(file)),
            Err(error) => {
                ctx.state.files_rejected.inc();
                tracing::warn!("skipping: {}", error);
            }
        }
    }
    Ok(files)
}

async fn run_stages<S: store::RemoteStore>(
    ctx: &RunContext<S>,
    local_root: &std::path::Path,
    remote_root: &str,
) -> Result<()> {
    let files = enumerate(ctx, local_root, remote_root).await?;
    if files.is_empty() {
        tracing::info!("no files found under {:?}, nothing to do", local_root);
        return Ok(());
    }
    if ctx.settings.delete != DeleteMode::Only {
        ctx.state.enter_stage(Stage::Compare);
        let candidates = crate::compare::compare(ctx, files.clone()).await?;
        if candidates.is_empty() {
            tracing::info!("all {} files are up to date", files.len());
        } else {
            ctx.state.enter_stage(Stage::Upload);
            crate::upload::upload(ctx, candidates).await?;
        }
    }
    if ctx.settings.delete != DeleteMode::Never {
        ctx.state.enter_stage(Stage::Reconcile);
        let local_paths: std::collections::HashSet<String> =
            files.iter().map(|file| file.remote_path.clone()).collect();
        crate::reconcile::reconcile(ctx, remote_root, &local_paths).await?;
    }
    Ok(())
}

/// Synchronizes `local_root` into `remote_root` on `store`.
///
/// Never fails: every problem, fatal or not, ends up in the returned report's error list.
#[instrument(skip(store, settings, state, log))]
pub async fn sync<S: store::RemoteStore>(
    store: Arc<S>,
    local_root: &std::path::Path,
    remote_root: &str,
    settings: &Settings,
    state: Arc<RunState>,
    log: ItemLog,
) -> Report {
    let remote_root = crate::path::normalize_remote_root(remote_root);
    let ctx = RunContext {
        store,
        state,
        log,
        settings: Arc::new(settings.clone()),
    };
    if let Err(error) = run_stages(&ctx, local_root, &remote_root).await {
        ctx.state.record_error(format!("{error:#}"));
    }
    ctx.state.enter_stage(Stage::Done);
    ctx.store.close().await;
    if let Err(error) = ctx.log.flush().await {
        tracing::warn!("{:#}", error);
    }
    Report {
        summary: ctx.state.summary(),
        errors: ctx.state.errors(),
    }
}
