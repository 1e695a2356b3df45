use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use enum_map::{Enum, EnumMap};
use futures::StreamExt;
use tokio::io::AsyncReadExt;

use crate::{
    ByteStream, EntryStream, EntryType, Error, ObjectInfo, PutOptions, RemoteEntry, RemoteStore,
    Result,
};

/// Store operations, used for call accounting and failure injection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Enum)]
pub enum Op {
    Info,
    Put,
    List,
    Unlink,
}

#[derive(Debug, Clone)]
struct Object {
    data: Vec<u8>,
    with_md5: bool,
    copies: u32,
    headers: Vec<(String, String)>,
}

#[derive(Debug, Default)]
struct Namespace {
    objects: BTreeMap<String, Object>,
    dirs: BTreeSet<String>,
    failures: HashMap<(Op, String), String>,
}

impl Namespace {
    fn add_ancestors(&mut self, path: &str) {
        let mut parent = crate::split(path).0;
        while parent != "/" && self.dirs.insert(parent.clone()) {
            parent = crate::split(&parent).0;
        }
    }

    fn injected(&self, op: Op, path: &str) -> Option<Error> {
        self.failures
            .get(&(op, path.to_string()))
            .map(|code| match code.as_str() {
                "NotFound" => Error::NotFound(path.to_string()),
                _ => Error::remote(code.clone(), format!("injected {op:?} failure")),
            })
    }
}

/// In-process object store.
///
/// Besides holding objects it counts calls per operation, tracks the peak number of outstanding
/// operations, and can be told to fail a given operation on a given path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    namespace: std::sync::Mutex<Namespace>,
    calls: EnumMap<Op, AtomicUsize>,
    close_calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    latency_ms: AtomicU64,
}

struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn namespace(&self) -> std::sync::MutexGuard<'_, Namespace> {
        self.namespace
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Stores an object directly, bypassing call accounting.
    pub fn insert(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.insert_object(path, data, true);
    }

    /// Stores an object whose metadata will not carry a `content-md5`.
    pub fn insert_without_md5(&self, path: &str, data: impl Into<Vec<u8>>) {
        self.insert_object(path, data, false);
    }

    fn insert_object(&self, path: &str, data: impl Into<Vec<u8>>, with_md5: bool) {
        let mut namespace = self.namespace();
        namespace.add_ancestors(path);
        namespace.objects.insert(
            path.to_string(),
            Object {
                data: data.into(),
                with_md5,
                copies: 1,
                headers: vec![],
            },
        );
    }

    /// Creates an empty directory (and its ancestors).
    pub fn mkdir(&self, path: &str) {
        let mut namespace = self.namespace();
        namespace.add_ancestors(path);
        namespace.dirs.insert(path.trim_end_matches('/').to_string());
    }

    /// Makes every subsequent `op` on `path` fail with the given code.
    pub fn fail(&self, op: Op, path: &str, code: &str) {
        self.namespace()
            .failures
            .insert((op, path.to_string()), code.to_string());
    }

    /// Delays every operation, which makes concurrency observable in tests.
    pub fn set_latency(&self, latency: std::time::Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::Release);
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.namespace().objects.get(path).map(|obj| obj.data.clone())
    }

    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.namespace().objects.contains_key(path)
    }

    #[must_use]
    pub fn object_paths(&self) -> Vec<String> {
        self.namespace().objects.keys().cloned().collect()
    }

    #[must_use]
    pub fn headers_of(&self, path: &str) -> Option<Vec<(String, String)>> {
        self.namespace()
            .objects
            .get(path)
            .map(|obj| obj.headers.clone())
    }

    #[must_use]
    pub fn copies_of(&self, path: &str) -> Option<u32> {
        self.namespace().objects.get(path).map(|obj| obj.copies)
    }

    #[must_use]
    pub fn calls(&self, op: Op) -> usize {
        self.calls[op].load(Ordering::Acquire)
    }

    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Acquire)
    }

    /// Highest number of operations that were outstanding at the same time.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    async fn begin(&self, op: Op) -> ActiveGuard<'_> {
        self.calls[op].fetch_add(1, Ordering::AcqRel);
        let now_active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now_active, Ordering::AcqRel);
        let guard = ActiveGuard {
            active: &self.active,
        };
        let latency = self.latency_ms.load(Ordering::Acquire);
        if latency > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(latency)).await;
        }
        guard
    }

    /// Entries below `root` in path order. A listing failure injected on a subdirectory ends the
    /// listing right after that directory's entry.
    fn list_entries(&self, root: &str) -> Vec<Result<RemoteEntry>> {
        let namespace = self.namespace();
        if let Some(error) = namespace.injected(Op::List, root) {
            return vec![Err(error)];
        }
        let root = root.trim_end_matches('/');
        if !root.is_empty() && !namespace.dirs.contains(root) {
            return vec![Err(Error::NotFound(root.to_string()))];
        }
        let prefix = format!("{root}/");
        let mut entries = vec![];
        for dir in namespace.dirs.iter().filter(|dir| dir.starts_with(&prefix)) {
            let (parent, name) = crate::split(dir);
            entries.push(RemoteEntry {
                parent,
                name,
                entry_type: EntryType::Directory,
            });
        }
        for path in namespace.objects.keys().filter(|p| p.starts_with(&prefix)) {
            let (parent, name) = crate::split(path);
            entries.push(RemoteEntry {
                parent,
                name,
                entry_type: EntryType::Object,
            });
        }
        entries.sort_by_key(RemoteEntry::path);
        let mut listing = vec![];
        for entry in entries {
            let failure = match entry.entry_type {
                EntryType::Directory => namespace.injected(Op::List, &entry.path()),
                EntryType::Object => None,
            };
            listing.push(Ok(entry));
            if let Some(error) = failure {
                listing.push(Err(error));
                break;
            }
        }
        listing
    }
}

impl RemoteStore for MemoryStore {
    async fn info(&self, path: &str) -> Result<ObjectInfo> {
        let _active = self.begin(Op::Info).await;
        let namespace = self.namespace();
        if let Some(error) = namespace.injected(Op::Info, path) {
            return Err(error);
        }
        match namespace.objects.get(path) {
            Some(obj) => Ok(ObjectInfo {
                content_length: obj.data.len().to_string(),
                content_md5: obj.with_md5.then(|| crate::content_md5(&obj.data)),
                opaque_etag: None,
            }),
            None => Err(Error::NotFound(path.to_string())),
        }
    }

    async fn put(&self, path: &str, mut body: ByteStream, options: &PutOptions) -> Result<()> {
        let _active = self.begin(Op::Put).await;
        if let Some(error) = self.namespace().injected(Op::Put, path) {
            return Err(error);
        }
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        if data.len() as u64 != options.size {
            return Err(Error::remote(
                "BadRequest",
                format!(
                    "{path}: declared {} bytes but body has {}",
                    options.size,
                    data.len()
                ),
            ));
        }
        let mut namespace = self.namespace();
        let parent = crate::split(path).0;
        if parent != "/" && !namespace.dirs.contains(&parent) {
            if !options.create_missing_parents {
                return Err(Error::remote(
                    "DirectoryDoesNotExist",
                    format!("{parent} does not exist"),
                ));
            }
            namespace.add_ancestors(path);
        }
        namespace.objects.insert(
            path.to_string(),
            Object {
                data,
                with_md5: true,
                copies: options.copies,
                headers: options.headers.clone(),
            },
        );
        Ok(())
    }

    fn list_tree(&self, root: &str, _concurrency: usize) -> EntryStream {
        self.calls[Op::List].fetch_add(1, Ordering::AcqRel);
        futures::stream::iter(self.list_entries(root)).boxed()
    }

    async fn unlink(&self, path: &str) -> Result<()> {
        let _active = self.begin(Op::Unlink).await;
        let mut namespace = self.namespace();
        if let Some(error) = namespace.injected(Op::Unlink, path) {
            return Err(error);
        }
        match namespace.objects.remove(path) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(path.to_string())),
        }
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn body(data: &'static [u8]) -> ByteStream {
        Box::pin(data)
    }

    #[tokio::test]
    async fn info_reports_size_and_md5() -> Result<()> {
        let store = MemoryStore::new();
        store.insert("/stor/a.txt", "hello");
        let info = store.info("/stor/a.txt").await?;
        assert_eq!(info.content_length, "5");
        assert_eq!(info.content_md5.as_deref(), Some("XUFAKrxLKna5cZ2REBfFkg=="));
        assert!(store.info("/stor/b.txt").await.unwrap_err().is_not_found());
        assert_eq!(store.calls(Op::Info), 2);
        Ok(())
    }

    #[tokio::test]
    async fn put_requires_parent_unless_asked_to_create() -> Result<()> {
        let store = MemoryStore::new();
        let options = PutOptions {
            size: 3,
            copies: 2,
            create_missing_parents: false,
            headers: vec![],
        };
        let error = store
            .put("/stor/x/y.txt", body(b"abc"), &options)
            .await
            .unwrap_err();
        assert_eq!(error.code(), "DirectoryDoesNotExist");
        let options = PutOptions {
            create_missing_parents: true,
            headers: vec![("content-type".into(), "text/plain".into())],
            ..options
        };
        store.put("/stor/x/y.txt", body(b"abc"), &options).await?;
        assert_eq!(store.get("/stor/x/y.txt").as_deref(), Some(&b"abc"[..]));
        assert_eq!(store.copies_of("/stor/x/y.txt"), Some(2));
        assert_eq!(
            store.headers_of("/stor/x/y.txt"),
            Some(vec![("content-type".to_string(), "text/plain".to_string())])
        );
        Ok(())
    }

    #[tokio::test]
    async fn put_rejects_size_mismatch() {
        let store = MemoryStore::new();
        let options = PutOptions {
            size: 10,
            copies: 1,
            create_missing_parents: true,
            headers: vec![],
        };
        let error = store.put("/a", body(b"abc"), &options).await.unwrap_err();
        assert_eq!(error.code(), "BadRequest");
        assert!(!store.contains("/a"));
    }

    #[tokio::test]
    async fn list_tree_yields_dirs_and_objects() -> Result<()> {
        let store = MemoryStore::new();
        store.insert("/stor/root/a.txt", "a");
        store.insert("/stor/root/sub/b.txt", "b");
        store.insert("/stor/other/c.txt", "c");
        let mut paths: Vec<(String, EntryType)> = store
            .list_tree("/stor/root", 4)
            .map_ok(|entry| (entry.path(), entry.entry_type))
            .try_collect()
            .await?;
        paths.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            paths,
            vec![
                ("/stor/root/a.txt".to_string(), EntryType::Object),
                ("/stor/root/sub".to_string(), EntryType::Directory),
                ("/stor/root/sub/b.txt".to_string(), EntryType::Object),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = MemoryStore::new();
        store.insert("/stor/root/a.txt", "a");
        store.fail(Op::Info, "/stor/root/a.txt", "ServiceUnavailable");
        store.fail(Op::List, "/stor/root", "AuthorizationFailed");
        let error = store.info("/stor/root/a.txt").await.unwrap_err();
        assert_eq!(error.code(), "ServiceUnavailable");
        let listed: Vec<_> = store.list_tree("/stor/root", 1).collect().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].as_ref().unwrap_err().code(), "AuthorizationFailed");
    }

    #[tokio::test]
    async fn listing_fails_below_root() {
        let store = MemoryStore::new();
        store.insert("/stor/root/a.txt", "a");
        store.insert("/stor/root/sub/b.txt", "b");
        store.insert("/stor/root/z.txt", "z");
        store.fail(Op::List, "/stor/root/sub", "NotFound");
        let listed: Vec<_> = store.list_tree("/stor/root", 1).collect().await;
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].as_ref().unwrap().path(), "/stor/root/a.txt");
        assert_eq!(listed[1].as_ref().unwrap().path(), "/stor/root/sub");
        assert!(listed[2].as_ref().unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn unlink_and_close() -> Result<()> {
        let store = MemoryStore::new();
        store.insert("/stor/a", "a");
        store.unlink("/stor/a").await?;
        assert!(!store.contains("/stor/a"));
        assert!(store.unlink("/stor/a").await.unwrap_err().is_not_found());
        store.close().await;
        assert_eq!(store.close_calls(), 1);
        Ok(())
    }
}
