//! Local tree enumeration
//!
//! Produces every regular file below the sync root together with its metadata. Symlinks and
//! special files are not synced and are skipped. A directory below the root that cannot be read
//! is skipped with a warning; failing to read the root itself is an error.

use anyhow::{Context, Result};
use tracing::instrument;

#[instrument]
pub async fn walk(root: &std::path::Path) -> Result<Vec<(std::path::PathBuf, std::fs::Metadata)>> {
    let root_metadata = tokio::fs::metadata(root)
        .await
        .with_context(|| format!("cannot read sync root {root:?}"))?;
    if !root_metadata.is_dir() {
        return Err(anyhow::anyhow!("sync root {root:?} is not a directory"));
    }
    let mut files = vec![];
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(error) if dir == root => {
                return Err(error).with_context(|| format!("cannot read sync root {root:?}"));
            }
            Err(error) => {
                tracing::warn!("skipping unreadable directory {:?}: {}", &dir, &error);
                continue;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!("failed reading entries of {:?}: {}", &dir, &error);
                    break;
                }
            };
            let path = entry.path();
            // symlink_metadata: symlinks must not be followed
            let metadata = match tokio::fs::symlink_metadata(&path).await {
                Ok(metadata) => metadata,
                Err(error) => {
                    tracing::warn!("skipping {:?}: {}", &path, &error);
                    continue;
                }
            };
            if metadata.is_dir() {
                pending.push(path);
            } else if metadata.is_file() {
                tracing::trace!("found {:?} ({} bytes)", &path, metadata.len());
                files.push((path, metadata));
            } else {
                tracing::debug!("skipping {:?}: not a regular file", &path);
            }
        }
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    tracing::info!("found {} files under {:?}", files.len(), root);
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn finds_nested_regular_files() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path();
        tokio::fs::create_dir_all(root.join("a/b")).await?;
        tokio::fs::create_dir(root.join("empty")).await?;
        tokio::fs::write(root.join("top.txt"), b"1").await?;
        tokio::fs::write(root.join("a/mid.txt"), b"22").await?;
        tokio::fs::write(root.join("a/b/deep.txt"), b"333").await?;
        let files = walk(root).await?;
        let found: Vec<_> = files
            .iter()
            .map(|(path, metadata)| {
                (
                    path.strip_prefix(root).unwrap().to_path_buf(),
                    metadata.len(),
                )
            })
            .collect();
        assert_eq!(
            found,
            vec![
                (std::path::PathBuf::from("a/b/deep.txt"), 3),
                (std::path::PathBuf::from("a/mid.txt"), 2),
                (std::path::PathBuf::from("top.txt"), 1),
            ]
        );
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    #[traced_test]
    async fn skips_symlinks() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path();
        tokio::fs::write(root.join("real.txt"), b"data").await?;
        tokio::fs::symlink(root.join("real.txt"), root.join("link.txt")).await?;
        tokio::fs::symlink(root, root.join("loop")).await?;
        let files = walk(root).await?;
        assert_eq!(files.len(), 1);
        assert!(files[0].0.ends_with("real.txt"));
        assert!(logs_contain("not a regular file"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let error = walk(&tmp.path().join("nope")).await.unwrap_err();
        assert!(format!("{error:#}").contains("cannot read sync root"));
    }

    #[tokio::test]
    async fn file_root_is_an_error() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let file = tmp.path().join("file.txt");
        tokio::fs::write(&file, b"x").await?;
        assert!(walk(&file).await.is_err());
        Ok(())
    }
}
