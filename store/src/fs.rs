use base64::Engine;
use futures::StreamExt;

use crate::{
    ByteStream, EntryStream, EntryType, Error, ObjectInfo, PutOptions, RemoteEntry, RemoteStore,
    Result,
};

const LIST_CHANNEL_CAPACITY: usize = 1024;
const TEMP_SUFFIX: &str = ".osync-tmp";

/// A local directory used as an object namespace.
///
/// Remote path `/a/b.txt` maps to `<root>/a/b.txt`. Digests are computed from the stored bytes on
/// every `info` call; replica count and headers have no meaning here and are ignored.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: std::path::PathBuf,
}

fn resolve(base: &std::path::Path, path: &str) -> Result<std::path::PathBuf> {
    let mut resolved = base.to_path_buf();
    for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
        if component == ".." {
            return Err(Error::remote(
                "InvalidPath",
                format!("{path}: parent references are not allowed"),
            ));
        }
        resolved.push(component);
    }
    Ok(resolved)
}

fn not_found_or(error: std::io::Error, path: &str) -> Error {
    if error.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(path.to_string())
    } else {
        Error::Io(error)
    }
}

async fn file_md5(path: &std::path::Path) -> std::io::Result<String> {
    let digest = crate::md5_file(path).await?;
    Ok(base64::engine::general_purpose::STANDARD.encode(digest))
}

async fn read_children(base: &std::path::Path, dir: String) -> Result<Vec<RemoteEntry>> {
    let local_dir = resolve(base, &dir)?;
    let mut entries = tokio::fs::read_dir(&local_dir)
        .await
        .map_err(|err| not_found_or(err, &dir))?;
    let mut children = vec![];
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        let entry_type = if file_type.is_dir() {
            EntryType::Directory
        } else if file_type.is_file() {
            EntryType::Object
        } else {
            tracing::debug!("skipping non-regular entry {:?}", entry.path());
            continue;
        };
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            tracing::warn!("skipping entry with non UTF-8 name {:?}", entry.path());
            continue;
        };
        if name.ends_with(TEMP_SUFFIX) {
            continue;
        }
        children.push(RemoteEntry {
            parent: dir.clone(),
            name,
            entry_type,
        });
    }
    Ok(children)
}

async fn walk_tree(
    base: &std::path::Path,
    root: &str,
    concurrency: usize,
    tx: &tokio::sync::mpsc::Sender<Result<RemoteEntry>>,
) -> Result<()> {
    let trimmed = root.trim_end_matches('/');
    let root = if trimmed.is_empty() { "/" } else { trimmed };
    let metadata = tokio::fs::symlink_metadata(resolve(base, root)?)
        .await
        .map_err(|err| not_found_or(err, root))?;
    if !metadata.is_dir() {
        return Err(Error::remote(
            "NotADirectory",
            format!("{root} is not a directory"),
        ));
    }
    let mut pending = vec![root.to_string()];
    while !pending.is_empty() {
        let batch = std::mem::take(&mut pending);
        let mut reads = futures::stream::iter(batch.into_iter().map(|dir| read_children(base, dir)))
            .buffer_unordered(concurrency);
        while let Some(children) = reads.next().await {
            for entry in children? {
                if entry.entry_type == EntryType::Directory {
                    pending.push(entry.path());
                }
                if tx.send(Ok(entry)).await.is_err() {
                    // listing was abandoned by the consumer
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

impl FsStore {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

impl RemoteStore for FsStore {
    async fn info(&self, path: &str) -> Result<ObjectInfo> {
        let local = resolve(&self.root, path)?;
        let metadata = tokio::fs::symlink_metadata(&local)
            .await
            .map_err(|err| not_found_or(err, path))?;
        if !metadata.is_file() {
            return Err(Error::remote(
                "NotAnObject",
                format!("{path} is not an object"),
            ));
        }
        let content_md5 = file_md5(&local)
            .await
            .map_err(|err| not_found_or(err, path))?;
        Ok(ObjectInfo {
            content_length: metadata.len().to_string(),
            content_md5: Some(content_md5),
            opaque_etag: None,
        })
    }

    async fn put(&self, path: &str, mut body: ByteStream, options: &PutOptions) -> Result<()> {
        let local = resolve(&self.root, path)?;
        let (Some(parent), Some(name)) = (local.parent(), local.file_name()) else {
            return Err(Error::remote(
                "InvalidPath",
                format!("{path} does not name an object"),
            ));
        };
        if !tokio::fs::try_exists(parent).await? {
            if !options.create_missing_parents {
                return Err(Error::remote(
                    "DirectoryDoesNotExist",
                    format!("parent of {path} does not exist"),
                ));
            }
            tokio::fs::create_dir_all(parent).await?;
        }
        tracing::trace!(
            "put {path}: copies={} headers={:?} (ignored by directory store)",
            options.copies,
            options.headers
        );
        let mut temp_name = std::ffi::OsString::from(".");
        temp_name.push(name);
        temp_name.push(TEMP_SUFFIX);
        let temp = parent.join(temp_name);
        let written = {
            let mut file = tokio::fs::File::create(&temp).await?;
            let written = tokio::io::copy(&mut body, &mut file).await;
            match written {
                Ok(written) => {
                    tokio::io::AsyncWriteExt::flush(&mut file).await?;
                    written
                }
                Err(error) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&temp).await;
                    return Err(error.into());
                }
            }
        };
        if written != options.size {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(Error::remote(
                "BadRequest",
                format!(
                    "{path}: declared {} bytes but body has {written}",
                    options.size
                ),
            ));
        }
        tokio::fs::rename(&temp, &local).await?;
        Ok(())
    }

    fn list_tree(&self, root: &str, concurrency: usize) -> EntryStream {
        let (tx, mut rx) = tokio::sync::mpsc::channel(LIST_CHANNEL_CAPACITY);
        let base = self.root.clone();
        let root = root.to_string();
        tokio::spawn(async move {
            if let Err(error) = walk_tree(&base, &root, concurrency.max(1), &tx).await {
                let _ = tx.send(Err(error)).await;
            }
        });
        futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let local = resolve(&self.root, path)?;
        let metadata = tokio::fs::symlink_metadata(&local)
            .await
            .map_err(|err| not_found_or(err, path))?;
        if metadata.is_dir() {
            return Err(Error::remote(
                "NotAnObject",
                format!("{path} is a directory"),
            ));
        }
        tokio::fs::remove_file(&local)
            .await
            .map_err(|err| not_found_or(err, path))
    }

    async fn close(&self) {
        tracing::debug!("closing directory store at {:?}", self.root);
    }
}
