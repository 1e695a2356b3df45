//! Helpers shared by the pipeline tests.

use std::sync::Arc;

use crate::item_log::ItemLog;
use crate::path::FileRecord;
use crate::state::RunState;
use crate::summary::Report;
use crate::sync::{RunContext, Settings};

/// Creates a temporary directory holding `files`, given as `(relative path, contents)`.
pub async fn local_tree(files: &[(&str, &[u8])]) -> anyhow::Result<tempfile::TempDir> {
    let tmp = tempfile::tempdir()?;
    for (name, data) in files {
        let path = tmp.path().join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
    }
    Ok(tmp)
}

/// A memory store pre-seeded with `objects`, given as `(remote path, contents)`.
pub fn memory_store(objects: &[(&str, &[u8])]) -> Arc<store::MemoryStore> {
    let store = store::MemoryStore::new();
    for (path, data) in objects {
        store.insert(path, data.to_vec());
    }
    Arc::new(store)
}

/// A fresh run context capturing item lines in memory.
pub fn context(
    store: &Arc<store::MemoryStore>,
    settings: &Settings,
) -> RunContext<store::MemoryStore> {
    RunContext {
        store: Arc::clone(store),
        state: Arc::new(RunState::new()),
        log: ItemLog::capture(),
        settings: Arc::new(settings.clone()),
    }
}

/// File records for everything under `root`, mapped below `remote_root`.
pub async fn records(
    root: &std::path::Path,
    remote_root: &str,
) -> anyhow::Result<Vec<Arc<FileRecord>>> {
    let mut files = vec![];
    for (path, metadata) in crate::walk::walk(root).await? {
        files.push(Arc::new(FileRecord::new(root, remote_root, path, &metadata)?));
    }
    Ok(files)
}

/// Runs a full sync and returns its report and item lines.
pub async fn run_sync(
    store: &Arc<store::MemoryStore>,
    root: &std::path::Path,
    remote_root: &str,
    settings: &Settings,
) -> (Report, Vec<String>) {
    let log = ItemLog::capture();
    let report = crate::sync::sync(
        Arc::clone(store),
        root,
        remote_root,
        settings,
        Arc::new(RunState::new()),
        log.clone(),
    )
    .await;
    (report, log.lines())
}
