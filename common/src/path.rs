//! Mapping of local files to remote object paths
//!
//! A local file's relative path is derived component by component from the sync root and joined
//! with `/`, the remote separator. Names are carried over verbatim: no case folding, no unicode
//! normalization and no escaping of characters such as `\`. Paths that cannot be represented as
//! UTF-8 are rejected.

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("{path:?} is not under the sync root {root:?}")]
    OutsideRoot {
        path: std::path::PathBuf,
        root: std::path::PathBuf,
    },
    #[error("{0:?} is not valid UTF-8")]
    NonUtf8(std::path::PathBuf),
    #[error("{0:?} is the sync root itself")]
    IsRoot(std::path::PathBuf),
}

/// One local file taking part in a sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub local_path: std::path::PathBuf,
    pub size: u64,
    pub mtime: Option<std::time::SystemTime>,
    /// Local path relative to the sync root, `/`-separated; the join key between both sides.
    pub relative_path: String,
    pub remote_path: String,
}

impl FileRecord {
    pub fn new(
        local_root: &std::path::Path,
        remote_root: &str,
        local_path: std::path::PathBuf,
        metadata: &std::fs::Metadata,
    ) -> Result<Self, MapError> {
        let relative_path = relative_path(local_root, &local_path)?;
        let remote_path = store::join(&normalize_remote_root(remote_root), &relative_path);
        Ok(Self {
            local_path,
            size: metadata.len(),
            mtime: metadata.modified().ok(),
            relative_path,
            remote_path,
        })
    }
}

impl std::fmt::Display for FileRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.remote_path)
    }
}

/// Canonical form of the remote sync root: leading `/`, no trailing `/` (except for `/` itself).
#[must_use]
pub fn normalize_remote_root(remote_root: &str) -> String {
    let trimmed = remote_root.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

pub fn relative_path(
    local_root: &std::path::Path,
    local_path: &std::path::Path,
) -> Result<String, MapError> {
    let outside = || MapError::OutsideRoot {
        path: local_path.to_path_buf(),
        root: local_root.to_path_buf(),
    };
    let stripped = local_path.strip_prefix(local_root).map_err(|_| outside())?;
    let mut parts = vec![];
    for component in stripped.components() {
        match component {
            std::path::Component::Normal(name) => parts.push(
                name.to_str()
                    .ok_or_else(|| MapError::NonUtf8(local_path.to_path_buf()))?,
            ),
            std::path::Component::CurDir => {}
            _ => return Err(outside()),
        }
    }
    if parts.is_empty() {
        return Err(MapError::IsRoot(local_path.to_path_buf()));
    }
    Ok(parts.join("/"))
}

/// Maps an absolute local path to its remote object path.
pub fn map(
    local_root: &std::path::Path,
    remote_root: &str,
    local_path: &std::path::Path,
) -> Result<String, MapError> {
    let relative = relative_path(local_root, local_path)?;
    Ok(store::join(&normalize_remote_root(remote_root), &relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn maps_nested_paths() -> Result<(), MapError> {
        let root = std::path::Path::new("/home/me/photos");
        assert_eq!(
            map(root, "/stor/photos", &root.join("2024/a.jpg"))?,
            "/stor/photos/2024/a.jpg"
        );
        assert_eq!(
            map(root, "/stor/photos/", &root.join("a.jpg"))?,
            "/stor/photos/a.jpg"
        );
        assert_eq!(map(root, "stor", &root.join("a.jpg"))?, "/stor/a.jpg");
        assert_eq!(map(root, "/", &root.join("a.jpg"))?, "/a.jpg");
        Ok(())
    }

    #[test]
    fn rejects_paths_outside_root() {
        let root = std::path::Path::new("/home/me/photos");
        assert!(matches!(
            map(root, "/stor", std::path::Path::new("/home/me/photos2/a.jpg")),
            Err(MapError::OutsideRoot { .. })
        ));
        assert!(matches!(
            map(root, "/stor", &root.join("../secret")),
            Err(MapError::OutsideRoot { .. })
        ));
        assert!(matches!(map(root, "/stor", root), Err(MapError::IsRoot(_))));
    }

    #[test]
    fn keeps_names_verbatim() -> Result<(), MapError> {
        let root = std::path::Path::new("/data");
        assert_eq!(
            map(root, "/r", &root.join("we\\ird name.txt"))?,
            "/r/we\\ird name.txt"
        );
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn rejects_non_utf8() {
        use std::os::unix::ffi::OsStrExt;
        let root = std::path::Path::new("/data");
        let name = std::ffi::OsStr::from_bytes(b"bad\xffname");
        assert!(matches!(
            map(root, "/r", &root.join(name)),
            Err(MapError::NonUtf8(_))
        ));
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9_ -][a-zA-Z0-9._ -]{0,7}"
            .prop_filter("not a dot segment", |s| s != "." && s != "..")
    }

    proptest! {
        #[test]
        fn mapping_is_a_pure_function_of_the_relative_path(
            first in proptest::collection::vec(segment(), 1..5),
            second in proptest::collection::vec(segment(), 1..5),
        ) {
            let root = std::path::Path::new("/sync/root");
            let first_path = first.iter().fold(root.to_path_buf(), |acc, s| acc.join(s));
            let second_path = second.iter().fold(root.to_path_buf(), |acc, s| acc.join(s));
            let first_remote = map(root, "/remote", &first_path).unwrap();
            let second_remote = map(root, "/remote", &second_path).unwrap();
            prop_assert_eq!(&first_remote, &format!("/remote/{}", first.join("/")));
            prop_assert_eq!(first_remote == second_remote, first == second);
        }
    }
}
