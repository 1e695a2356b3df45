//! Remote reconciliation
//!
//! Lists every object below the remote sync root and deletes the ones whose path is not the
//! remote path of some local file. Membership is tested against all local files, not only the
//! upload candidates. A failed listing ends the stage without deleting anything.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use tracing::instrument;

use crate::item_log::Outcome;
use crate::queue::BoundedQueue;
use crate::sync::{ItemFailure, RunContext};

/// Remote objects below `remote_root` missing from `local_paths`, sorted.
pub async fn find_orphans<S: store::RemoteStore>(
    ctx: &RunContext<S>,
    remote_root: &str,
    local_paths: &HashSet<String>,
) -> store::Result<Vec<String>> {
    throttle::request_token().await;
    let mut entries = ctx.store.list_tree(remote_root, ctx.settings.concurrency);
    let mut orphans = vec![];
    let mut first = true;
    while let Some(entry) = entries.next().await {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) if first && error.is_not_found() => {
                tracing::info!("{} does not exist remotely, nothing to delete", remote_root);
                break;
            }
            Err(error) => return Err(error),
        };
        first = false;
        if !entry.is_object() {
            continue;
        }
        ctx.state.remote_objects_listed.inc();
        let path = entry.path();
        if !local_paths.contains(&path) {
            tracing::debug!("{}: no local counterpart", path);
            orphans.push(path);
        }
    }
    orphans.sort();
    Ok(orphans)
}

pub async fn delete_one<S: store::RemoteStore>(ctx: &RunContext<S>, remote_path: &str) -> bool {
    let result: Result<(), ItemFailure> = if ctx.settings.dry_run {
        Ok(())
    } else {
        throttle::request_token().await;
        match ctx.store.unlink(remote_path).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => {
                tracing::debug!("{}: already gone", remote_path);
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    };
    let progress = ctx.state.reconcile.tick();
    let outcome = match result {
        Ok(()) => {
            ctx.state.objects_deleted.inc();
            Outcome::Deleted
        }
        Err(failure) => {
            ctx.state.delete_failed.inc();
            ctx.state
                .record_error(failure.describe("delete", remote_path, progress));
            Outcome::DeleteFailed
        }
    };
    ctx.log
        .record(progress, outcome, remote_path, ctx.settings.dry_run)
        .await;
    outcome == Outcome::Deleted
}

#[instrument(skip(ctx, local_paths), fields(local = local_paths.len()))]
pub async fn reconcile<S: store::RemoteStore>(
    ctx: &RunContext<S>,
    remote_root: &str,
    local_paths: &HashSet<String>,
) -> Result<()> {
    let orphans = match find_orphans(ctx, remote_root, local_paths).await {
        Ok(orphans) => orphans,
        Err(error) => {
            ctx.state.record_error(format!(
                "list {remote_root} failed ({}): {}, no objects were deleted",
                error.code(),
                error
            ));
            return Ok(());
        }
    };
    ctx.state.delete_candidates.add(orphans.len() as u64);
    ctx.state.reconcile.start(orphans.len() as u64);
    tracing::info!("{} remote objects have no local counterpart", orphans.len());
    let queue = BoundedQueue::new(
        "delete",
        ctx.settings.concurrency,
        Arc::clone(&ctx.state.in_flight),
    );
    queue
        .run_all(orphans, |remote_path: String| {
            let ctx = ctx.clone();
            async move { delete_one(&ctx, &remote_path).await }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;
    use store::Op;

    fn paths(paths: &[&str]) -> HashSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn only_unmatched_objects_are_orphans() -> anyhow::Result<()> {
        let store = testutils::memory_store(&[
            ("/r/a", b"1"),
            ("/r/sub/b", b"2"),
            ("/r/sub/c", b"3"),
            ("/rr/a", b"4"),
        ]);
        store.mkdir("/r/empty");
        let ctx = testutils::context(&store, &crate::sync::Settings::default());
        let orphans =
            find_orphans(&ctx, "/r", &paths(&["/r/a", "/r/sub/b", "/r/local-only"])).await?;
        assert_eq!(orphans, vec!["/r/sub/c"]);
        assert_eq!(ctx.state.remote_objects_listed.get(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn missing_remote_root_is_empty() -> anyhow::Result<()> {
        let store = testutils::memory_store(&[]);
        let ctx = testutils::context(&store, &crate::sync::Settings::default());
        reconcile(&ctx, "/nowhere", &paths(&["/nowhere/a"])).await?;
        assert!(ctx.state.errors().is_empty());
        assert_eq!(ctx.state.delete_candidates.get(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn vanished_object_counts_as_deleted() -> anyhow::Result<()> {
        let store = testutils::memory_store(&[]);
        let ctx = testutils::context(&store, &crate::sync::Settings::default());
        assert!(delete_one(&ctx, "/r/already-gone").await);
        assert_eq!(store.calls(Op::Unlink), 1);
        assert!(ctx.state.errors().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn list_error_deletes_nothing() -> anyhow::Result<()> {
        let store = testutils::memory_store(&[("/r/x", b"x")]);
        store.fail(Op::List, "/r", "ServiceUnavailable");
        let ctx = testutils::context(&store, &crate::sync::Settings::default());
        reconcile(&ctx, "/r", &paths(&[])).await?;
        assert_eq!(store.calls(Op::Unlink), 0);
        assert_eq!(
            ctx.state.errors(),
            vec!["list /r failed (ServiceUnavailable): injected List failure, no objects were deleted"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn failure_after_partial_listing_deletes_nothing() -> anyhow::Result<()> {
        for code in ["NotFound", "ServiceUnavailable"] {
            let store = testutils::memory_store(&[
                ("/r/a", b"a"),
                ("/r/sub/b", b"b"),
                ("/r/z", b"z"),
            ]);
            store.fail(Op::List, "/r/sub", code);
            let ctx = testutils::context(&store, &crate::sync::Settings::default());
            reconcile(&ctx, "/r", &paths(&[])).await?;
            assert_eq!(ctx.state.remote_objects_listed.get(), 1);
            assert_eq!(ctx.state.delete_candidates.get(), 0);
            assert_eq!(store.calls(Op::Unlink), 0);
            assert!(store.get("/r/a").is_some());
            let errors = ctx.state.errors();
            assert_eq!(errors.len(), 1);
            assert!(errors[0].starts_with(&format!("list /r failed ({code}):")));
            assert!(errors[0].ends_with("no objects were deleted"));
        }
        Ok(())
    }
}
