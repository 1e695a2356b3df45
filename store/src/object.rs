use std::sync::Arc;

use futures::StreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use tokio::io::AsyncWriteExt;

use crate::{
    ByteStream, EntryStream, EntryType, Error, ObjectInfo, PutOptions, RemoteEntry, RemoteStore,
    Result,
};

/// S3 or GCS bucket accessed through the `object_store` crate.
///
/// Credentials and region come from the environment (`AWS_*` / `GOOGLE_*` variables). Object
/// stores have no real directories, so listings only contain objects and parents are implicit.
#[derive(Debug)]
pub struct ObjectStoreClient {
    inner: Arc<dyn ObjectStore>,
}

fn map_error(error: object_store::Error) -> Error {
    match error {
        object_store::Error::NotFound { path, .. } => Error::NotFound(format!("/{path}")),
        object_store::Error::Generic { store, source } => {
            Error::remote(format!("{store}Error"), source.to_string())
        }
        other => Error::remote("ObjectStoreError", other.to_string()),
    }
}

fn object_path(path: &str) -> Result<ObjectPath> {
    ObjectPath::parse(path.trim_start_matches('/'))
        .map_err(|err| Error::remote("InvalidPath", err.to_string()))
}

fn attributes(headers: &[(String, String)]) -> object_store::Attributes {
    use object_store::{Attribute, AttributeValue};
    let mut attributes = object_store::Attributes::new();
    for (name, value) in headers {
        let attribute = match name.to_ascii_lowercase().as_str() {
            "content-type" => Attribute::ContentType,
            "content-encoding" => Attribute::ContentEncoding,
            "content-disposition" => Attribute::ContentDisposition,
            "content-language" => Attribute::ContentLanguage,
            "cache-control" => Attribute::CacheControl,
            _ => Attribute::Metadata(name.clone().into()),
        };
        attributes.insert(attribute, AttributeValue::from(value.clone()));
    }
    attributes
}

impl ObjectStoreClient {
    /// Builds a client for `s3://bucket` or `gs://bucket` URLs.
    pub fn from_url(url: &str) -> Result<Self> {
        let inner: Arc<dyn ObjectStore> = if url.starts_with("s3://") {
            Arc::new(
                object_store::aws::AmazonS3Builder::from_env()
                    .with_url(url)
                    .build()
                    .map_err(map_error)?,
            )
        } else if url.starts_with("gs://") {
            Arc::new(
                object_store::gcp::GoogleCloudStorageBuilder::from_env()
                    .with_url(url)
                    .build()
                    .map_err(map_error)?,
            )
        } else {
            return Err(Error::remote(
                "UnsupportedUrl",
                format!("{url} is neither an s3:// nor a gs:// url"),
            ));
        };
        Ok(Self { inner })
    }
}

impl RemoteStore for ObjectStoreClient {
    async fn info(&self, path: &str) -> Result<ObjectInfo> {
        let meta = self
            .inner
            .head(&object_path(path)?)
            .await
            .map_err(map_error)?;
        Ok(ObjectInfo::from_etag(meta.size, meta.e_tag.as_deref()))
    }

    async fn put(&self, path: &str, mut body: ByteStream, options: &PutOptions) -> Result<()> {
        if options.copies > 1 {
            tracing::debug!(
                "{path}: {} copies requested, replication is managed by the bucket",
                options.copies
            );
        }
        let mut writer =
            object_store::buffered::BufWriter::new(Arc::clone(&self.inner), object_path(path)?)
                .with_attributes(attributes(&options.headers));
        let written = match tokio::io::copy(&mut body, &mut writer).await {
            Ok(written) => written,
            Err(error) => {
                let _ = writer.abort().await;
                return Err(error.into());
            }
        };
        if written != options.size {
            let _ = writer.abort().await;
            return Err(Error::remote(
                "BadRequest",
                format!(
                    "{path}: declared {} bytes but body has {written}",
                    options.size
                ),
            ));
        }
        writer.shutdown().await?;
        Ok(())
    }

    fn list_tree(&self, root: &str, _concurrency: usize) -> EntryStream {
        let prefix = match object_path(root) {
            Ok(prefix) => prefix,
            Err(error) => return futures::stream::once(async move { Err(error) }).boxed(),
        };
        self.inner
            .list(Some(&prefix))
            .map(|meta| {
                let meta = meta.map_err(map_error)?;
                let (parent, name) = crate::split(&format!("/{}", meta.location));
                Ok(RemoteEntry {
                    parent,
                    name,
                    entry_type: EntryType::Object,
                })
            })
            .boxed()
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        self.inner
            .delete(&object_path(path)?)
            .await
            .map_err(map_error)
    }

    async fn close(&self) {
        tracing::debug!("closing object store client {}", self.inner);
    }
}
