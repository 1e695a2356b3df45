use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncReadExt;
use tracing::instrument;

use crate::item_log::Outcome;
use crate::path::FileRecord;
use crate::queue::BoundedQueue;
use crate::sync::{ItemFailure, RunContext};

async fn put_file<S: store::RemoteStore>(
    ctx: &RunContext<S>,
    file: &FileRecord,
) -> Result<(), ItemFailure> {
    let _open_file_guard = throttle::open_file_permit().await;
    let body = tokio::fs::File::open(&file.local_path)
        .await
        .map_err(|error| ItemFailure {
            code: format!("{:?}", error.kind()),
            message: format!("cannot open {:?}: {}", file.local_path, error),
        })?;
    let options = store::PutOptions {
        size: file.size,
        copies: ctx.settings.copies,
        create_missing_parents: true,
        headers: ctx.settings.headers.clone(),
    };
    throttle::request_token().await;
    // never send more than the size announced to the store
    ctx.store
        .put(&file.remote_path, Box::pin(body.take(file.size)), &options)
        .await?;
    Ok(())
}

/// Uploads one file and records the outcome; returns whether it was uploaded.
pub async fn upload_one<S: store::RemoteStore>(ctx: &RunContext<S>, file: &FileRecord) -> bool {
    let result = if ctx.settings.dry_run {
        Ok(())
    } else {
        put_file(ctx, file).await
    };
    let progress = ctx.state.upload.tick();
    let outcome = match result {
        Ok(()) => {
            ctx.state.files_uploaded.inc();
            ctx.state.bytes_uploaded.add(file.size);
            Outcome::Uploaded
        }
        Err(failure) => {
            ctx.state.upload_failed.inc();
            ctx.state
                .record_error(failure.describe("upload", &file.remote_path, progress));
            Outcome::UploadFailed
        }
    };
    ctx.log
        .record(progress, outcome, &file.remote_path, ctx.settings.dry_run)
        .await;
    outcome == Outcome::Uploaded
}

#[instrument(skip_all, fields(candidates = candidates.len()))]
pub async fn upload<S: store::RemoteStore>(
    ctx: &RunContext<S>,
    candidates: Vec<Arc<FileRecord>>,
) -> Result<()> {
    ctx.state.upload.start(candidates.len() as u64);
    let queue = BoundedQueue::new(
        "upload",
        ctx.settings.concurrency,
        Arc::clone(&ctx.state.in_flight),
    );
    let results = queue
        .run_all(candidates, |file: Arc<FileRecord>| {
            let ctx = ctx.clone();
            async move { upload_one(&ctx, &file).await }
        })
        .await?;
    let uploaded = results.iter().filter(|uploaded| **uploaded).count();
    tracing::info!("uploaded {} of {} files", uploaded, results.len());
    Ok(())
}
