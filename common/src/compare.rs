use std::sync::Arc;

use anyhow::Result;
use tracing::instrument;

use crate::item_log::Outcome;
use crate::oracle::{self, Verdict};
use crate::path::FileRecord;
use crate::queue::BoundedQueue;
use crate::sync::{ItemFailure, RunContext};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Classification {
    UpToDate,
    NeedsUpload,
    ComparisonError,
}

async fn lookup<S: store::RemoteStore>(
    ctx: &RunContext<S>,
    file: &FileRecord,
) -> Result<Verdict, ItemFailure> {
    throttle::request_token().await;
    match ctx.store.info(&file.remote_path).await {
        Ok(info) => Ok(oracle::is_up_to_date(file, &info, ctx.settings.compare).await?),
        Err(error) if error.is_not_found() => {
            tracing::debug!("{}: not present remotely", file.remote_path);
            Ok(Verdict::NeedsUpload)
        }
        Err(error) => Err(error.into()),
    }
}

/// Classifies one file and records the outcome.
pub async fn classify<S: store::RemoteStore>(
    ctx: &RunContext<S>,
    file: &FileRecord,
) -> Classification {
    let verdict = lookup(ctx, file).await;
    let progress = ctx.state.compare.tick();
    let (classification, outcome) = match verdict {
        Ok(Verdict::UpToDate) => {
            ctx.state.files_unchanged.inc();
            (Classification::UpToDate, Outcome::Unchanged)
        }
        Ok(Verdict::NeedsUpload) => {
            ctx.state.upload_candidates.inc();
            (Classification::NeedsUpload, Outcome::UploadNeeded)
        }
        Err(failure) => {
            ctx.state.compare_failed.inc();
            ctx.state
                .record_error(failure.describe("compare", &file.remote_path, progress));
            (Classification::ComparisonError, Outcome::CompareFailed)
        }
    };
    ctx.log
        .record(progress, outcome, &file.remote_path, ctx.settings.dry_run)
        .await;
    classification
}

/// Runs the comparison stage and returns the upload candidates, ordered by remote path.
#[instrument(skip_all, fields(files = files.len()))]
pub async fn compare<S: store::RemoteStore>(
    ctx: &RunContext<S>,
    files: Vec<Arc<FileRecord>>,
) -> Result<Vec<Arc<FileRecord>>> {
    ctx.state.compare.start(files.len() as u64);
    let queue = BoundedQueue::new(
        "compare",
        ctx.settings.concurrency,
        Arc::clone(&ctx.state.in_flight),
    );
    let results = queue
        .run_all(files, |file: Arc<FileRecord>| {
            let ctx = ctx.clone();
            async move {
                let classification = classify(&ctx, &file).await;
                (file, classification)
            }
        })
        .await?;
    let mut candidates: Vec<_> = results
        .into_iter()
        .filter(|(_, classification)| *classification == Classification::NeedsUpload)
        .map(|(file, _)| file)
        .collect();
    candidates.sort_by(|a, b| a.remote_path.cmp(&b.remote_path));
    tracing::info!("{} files need uploading", candidates.len());
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use store::Op;

    #[tokio::test]
    async fn classifies_each_file() -> anyhow::Result<()> {
        let tmp = testutils::local_tree(&[
            ("new.txt", b"new"),
            ("same.txt", b"same"),
            ("grown.txt", b"grown"),
            ("broken.txt", b"x"),
        ])
        .await?;
        let store = testutils::memory_store(&[("/r/same.txt", b"same"), ("/r/grown.txt", b"gr")]);
        store.fail(Op::Info, "/r/broken.txt", "InternalError");
        let ctx = testutils::context(&store, &crate::sync::Settings::default());
        let files = testutils::records(tmp.path(), "/r").await?;
        let candidates = compare(&ctx, files).await?;
        let paths: Vec<_> = candidates.iter().map(|f| f.remote_path.as_str()).collect();
        assert_eq!(paths, vec!["/r/grown.txt", "/r/new.txt"]);
        assert_eq!(ctx.state.files_unchanged.get(), 1);
        assert_eq!(ctx.state.upload_candidates.get(), 2);
        assert_eq!(ctx.state.compare_failed.get(), 1);
        assert_eq!(ctx.state.compare.get(), (4, 4));
        let errors = ctx.state.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("compare /r/broken.txt failed (InternalError)"));
        assert_eq!(ctx.log.lines().len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_file_is_a_comparison_error() -> anyhow::Result<()> {
        let tmp = testutils::local_tree(&[("a.txt", b"abc")]).await?;
        let store = testutils::memory_store(&[("/r/a.txt", b"abd")]);
        let settings = crate::sync::Settings {
            compare: oracle::CompareMode::Checksum,
            ..Default::default()
        };
        let ctx = testutils::context(&store, &settings);
        let files = testutils::records(tmp.path(), "/r").await?;
        tokio::fs::remove_file(tmp.path().join("a.txt")).await?;
        assert_eq!(classify(&ctx, &files[0]).await, Classification::ComparisonError);
        assert!(ctx.state.errors()[0].contains("NotFound"));
        Ok(())
    }
}
