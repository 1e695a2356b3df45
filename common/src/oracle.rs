//! Deciding whether a local file and its remote copy are the same
//!
//! Size mode compares the local size with the remote `content-length`; checksum mode compares
//! hex MD5 digests, streaming the local file. A missing remote object never reaches the oracle,
//! the comparison stage classifies it as needing upload on its own.
//!
//! A non-empty object whose store does not expose its digest (an opaque ETag) is compared by size
//! even in checksum mode.

use base64::Engine;

use crate::path::FileRecord;

/// MD5 of the empty byte sequence, used when the remote object carries no digest.
pub const EMPTY_MD5_HEX: &str = "d41d8cd98f00b204e9800998ecf8427e";

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum CompareMode {
    #[default]
    Size,
    Checksum,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    UpToDate,
    NeedsUpload,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("failed reading {path:?}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("undecodable content-md5 {0:?}")]
    RemoteDigest(String),
}

impl ReadError {
    /// Failure code used in error lines, in the same vocabulary as `store::Error::code`.
    #[must_use]
    pub fn code(&self) -> String {
        match self {
            ReadError::Read { source, .. } => format!("{:?}", source.kind()),
            ReadError::RemoteDigest(_) => "BadDigest".to_string(),
        }
    }
}

/// Streams the local file through MD5, holding an open-file permit meanwhile.
pub async fn local_md5_hex(path: &std::path::Path) -> Result<String, ReadError> {
    let _open_file_guard = throttle::open_file_permit().await;
    let digest = store::md5_file(path)
        .await
        .map_err(|source| ReadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(hex::encode(digest))
}

/// Hex form of the remote digest.
///
/// An object without any digest counts as empty content. `None` means the object has contents
/// the store carries no digest for.
pub fn remote_md5_hex(info: &store::ObjectInfo) -> Result<Option<String>, ReadError> {
    match &info.content_md5 {
        None if info.opaque_etag.is_some() && remote_size(info) != Some(0) => Ok(None),
        None => Ok(Some(EMPTY_MD5_HEX.to_string())),
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .ok()
            .filter(|bytes| bytes.len() == 16)
            .map(|bytes| Some(hex::encode(bytes)))
            .ok_or_else(|| ReadError::RemoteDigest(encoded.clone())),
    }
}

/// Remote size, `None` if the store reported something that is not a number.
#[must_use]
pub fn remote_size(info: &store::ObjectInfo) -> Option<u64> {
    info.content_length.trim().parse().ok()
}

fn size_verdict(file: &FileRecord, info: &store::ObjectInfo) -> Verdict {
    match remote_size(info) {
        Some(size) if size == file.size => Verdict::UpToDate,
        Some(_) => Verdict::NeedsUpload,
        None => {
            tracing::warn!(
                "{}: unparsable content-length {:?}, assuming it differs",
                file.remote_path,
                info.content_length
            );
            Verdict::NeedsUpload
        }
    }
}

pub async fn is_up_to_date(
    file: &FileRecord,
    info: &store::ObjectInfo,
    mode: CompareMode,
) -> Result<Verdict, ReadError> {
    match mode {
        CompareMode::Size => Ok(size_verdict(file, info)),
        CompareMode::Checksum => {
            let Some(remote) = remote_md5_hex(info)? else {
                tracing::warn!(
                    "{}: store exposes no md5 (etag {:?}), comparing sizes",
                    file.remote_path,
                    info.opaque_etag.as_deref().unwrap_or_default()
                );
                return Ok(size_verdict(file, info));
            };
            let local = local_md5_hex(&file.local_path).await?;
            tracing::debug!("{}: local md5 {}, remote md5 {}", file.remote_path, local, remote);
            if local == remote {
                Ok(Verdict::UpToDate)
            } else {
                Ok(Verdict::NeedsUpload)
            }
        }
    }
}
