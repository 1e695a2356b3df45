//! Remote object store client interface for osync
//!
//! The sync pipeline talks to the remote side exclusively through the [`RemoteStore`] trait. A
//! store exposes a hierarchical namespace of `/`-separated paths holding directory-like
//! containers and objects; each object carries a size and (optionally) a content digest.
//!
//! # Implementations
//!
//! - [`MemoryStore`] - in-process namespace with call accounting and failure injection, used by
//!   tests and by the `memory:` store URL
//! - [`FsStore`] - a local directory acting as the object namespace
//! - `ObjectStoreClient` (feature `object-store`) - S3 and GCS through the `object_store` crate
//!
//! # Metadata encoding
//!
//! [`ObjectInfo`] carries metadata the way object stores report it over HTTP: the size is the
//! textual `content-length` and the digest is the base64 `content-md5`. Interpreting them is left
//! to the caller.

use std::future::Future;

mod fs;
mod memory;
#[cfg(feature = "object-store")]
mod object;

pub use fs::FsStore;
pub use memory::{MemoryStore, Op};
#[cfg(feature = "object-store")]
pub use object::ObjectStoreClient;

use base64::Engine;
use md5::Digest;

/// Errors reported by a remote store.
///
/// # Logging Convention
/// Display renders the human-readable message only; pair it with [`Error::code`] when the failure
/// code matters.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}: not found")]
    NotFound(String),
    #[error("{message}")]
    Remote { code: String, message: String },
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

fn io_code(error: &std::io::Error) -> String {
    format!("{:?}", error.kind())
}

impl Error {
    #[must_use]
    pub fn remote(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Remote {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Short machine-readable failure code.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            Error::NotFound(_) => "NotFound".to_string(),
            Error::Remote { code, .. } => code.clone(),
            Error::Io(error) => io_code(error),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Object metadata as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Object size in bytes, as text.
    pub content_length: String,
    /// Base64-encoded MD5 of the object contents, absent for e.g. empty objects on some stores.
    pub content_md5: Option<String>,
    /// Entity tag that is not an MD5 digest (multipart uploads, GCS generations). When set, the
    /// object has contents whose digest the store does not expose.
    pub opaque_etag: Option<String>,
}

impl ObjectInfo {
    /// Metadata of an object whose ETag doubles as its MD5 only for single-part uploads.
    #[must_use]
    pub fn from_etag(size: u64, etag: Option<&str>) -> Self {
        let content_md5 = etag.and_then(hex_md5_to_content_md5);
        let opaque_etag = match (&content_md5, etag) {
            (None, Some(etag)) => Some(etag.to_string()),
            _ => None,
        };
        Self {
            content_length: size.to_string(),
            content_md5,
            opaque_etag,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryType {
    Object,
    Directory,
}

/// One entry produced by [`RemoteStore::list_tree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub parent: String,
    pub name: String,
    pub entry_type: EntryType,
}

impl RemoteEntry {
    #[must_use]
    pub fn path(&self) -> String {
        join(&self.parent, &self.name)
    }

    #[must_use]
    pub fn is_object(&self) -> bool {
        self.entry_type == EntryType::Object
    }
}

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Exact number of bytes the body will produce.
    pub size: u64,
    /// Number of replicas the store should keep.
    pub copies: u32,
    /// Create any missing parent containers instead of failing.
    pub create_missing_parents: bool,
    /// Extra request headers, passed through untouched.
    pub headers: Vec<(String, String)>,
}

pub type ByteStream = std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>;
pub type EntryStream = futures::stream::BoxStream<'static, Result<RemoteEntry>>;

/// The operations osync needs from a remote object store.
///
/// All methods may be called concurrently from many tasks.
pub trait RemoteStore: Send + Sync + 'static {
    /// Fetch metadata of the object at `path`, [`Error::NotFound`] if there is none.
    fn info(&self, path: &str) -> impl Future<Output = Result<ObjectInfo>> + Send;

    /// Store `body` as the object at `path`, replacing any previous object.
    fn put(
        &self,
        path: &str,
        body: ByteStream,
        options: &PutOptions,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Recursively list everything below `root`.
    ///
    /// The stream ends after the first error it yields.
    fn list_tree(&self, root: &str, concurrency: usize) -> EntryStream;

    /// Remove the object at `path`.
    fn unlink(&self, path: &str) -> impl Future<Output = Result<()>> + Send;

    /// Release the connection; called exactly once per run.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Joins a remote parent path and a child name with a single `/`.
#[must_use]
pub fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Splits a remote path into `(parent, name)`; the parent of a top-level name is `/`.
#[must_use]
pub fn split(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(idx) => (trimmed[..idx].to_string(), trimmed[idx + 1..].to_string()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

/// Base64 `content-md5` value for the given bytes.
#[must_use]
pub fn content_md5(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(md5::Md5::digest(data))
}

/// Streams a file through MD5 and returns the raw 16-byte digest.
pub async fn md5_file(path: &std::path::Path) -> std::io::Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = md5::Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

/// Converts a hex MD5 (as found in S3 ETags) to the base64 `content-md5` encoding.
///
/// Returns `None` for anything that is not a plain 16-byte hex digest, e.g. multipart ETags.
#[must_use]
pub fn hex_md5_to_content_md5(etag: &str) -> Option<String> {
    let hex_digest = etag.trim_matches('"');
    let bytes = hex::decode(hex_digest).ok()?;
    if bytes.len() != 16 {
        return None;
    }
    Some(base64::engine::general_purpose::STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_split() {
        assert_eq!(join("/a/b", "c.txt"), "/a/b/c.txt");
        assert_eq!(join("/a/b/", "c.txt"), "/a/b/c.txt");
        assert_eq!(join("/", "c.txt"), "/c.txt");
        assert_eq!(split("/a/b/c.txt"), ("/a/b".to_string(), "c.txt".to_string()));
        assert_eq!(split("/c.txt"), ("/".to_string(), "c.txt".to_string()));
        assert_eq!(split("/a/b/"), ("/a".to_string(), "b".to_string()));
    }

    #[test]
    fn md5_encodings() {
        assert_eq!(content_md5(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
        assert_eq!(
            hex_md5_to_content_md5("\"d41d8cd98f00b204e9800998ecf8427e\"").as_deref(),
            Some("1B2M2Y8AsgTpgAmY7PhCfg==")
        );
        assert_eq!(hex_md5_to_content_md5("abc-2"), None);
        assert_eq!(hex_md5_to_content_md5("00ff"), None);
    }

    #[test]
    fn etags_map_to_digests() {
        let single = ObjectInfo::from_etag(0, Some("\"d41d8cd98f00b204e9800998ecf8427e\""));
        assert_eq!(single.content_md5.as_deref(), Some("1B2M2Y8AsgTpgAmY7PhCfg=="));
        assert_eq!(single.opaque_etag, None);
        let multipart =
            ObjectInfo::from_etag(10_485_760, Some("\"9b2cf535f27731c974343645a3985328-2\""));
        assert_eq!(multipart.content_md5, None);
        assert_eq!(
            multipart.opaque_etag.as_deref(),
            Some("\"9b2cf535f27731c974343645a3985328-2\"")
        );
        let gcs = ObjectInfo::from_etag(5, Some("CKih16GjycICEAE="));
        assert_eq!(gcs.content_length, "5");
        assert_eq!(gcs.content_md5, None);
        assert_eq!(gcs.opaque_etag.as_deref(), Some("CKih16GjycICEAE="));
        let untagged = ObjectInfo::from_etag(0, None);
        assert_eq!(untagged.content_md5, None);
        assert_eq!(untagged.opaque_etag, None);
    }

    #[test]
    fn error_codes() {
        assert_eq!(Error::NotFound("/x".into()).code(), "NotFound");
        assert!(Error::NotFound("/x".into()).is_not_found());
        let error = Error::remote("ServiceUnavailable", "try again later");
        assert_eq!(error.code(), "ServiceUnavailable");
        assert_eq!(error.to_string(), "try again later");
        let io = Error::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(io.code(), "PermissionDenied");
        assert!(!io.is_not_found());
    }
}
