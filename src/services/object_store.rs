//! src/services/object_store.rs
//!
//! Blob storage capability used by the orchestrator. The orchestrator only
//! sees the `ObjectStore` trait; `LocalObjectStore` is the on-disk backend,
//! sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Readable blob body handed back by [`ObjectStore::get`].
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// A blob as seen by a bucket listing.
#[derive(Clone, Debug)]
pub struct StoredObject {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// Named blobs in named buckets.
///
/// Calls are not retried internally. `delete` of a key that does not exist
/// succeeds, so deleting the same key repeatedly is safe.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Create the bucket if it is missing.
    async fn ensure_bucket(&self, bucket: &str) -> ObjectStoreResult<()>;

    /// Store `bytes` under `key`, replacing any previous blob.
    async fn put(&self, bucket: &str, key: &str, bytes: Bytes) -> ObjectStoreResult<()>;

    /// Open a blob for reading. Missing blobs yield `NotFound`.
    async fn get(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectReader>;

    /// Remove a blob. Missing blobs are not an error.
    async fn delete(&self, bucket: &str, key: &str) -> ObjectStoreResult<()>;

    /// Every blob currently stored in `bucket`.
    async fn list(&self, bucket: &str) -> ObjectStoreResult<Vec<StoredObject>>;

    /// Cheap write/read/delete round trip used by readiness checks.
    async fn probe(&self) -> ObjectStoreResult<()>;
}

const MAX_OBJECT_KEY_LEN: usize = 1024;
const TMP_PREFIX: &str = ".tmp-";

/// Object store on the local filesystem.
///
/// Writes land in a temporary file that is fsynced and renamed into place,
/// so readers never observe a half-written blob.
#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Reject keys that could escape the bucket directory.
    ///
    /// Keys are flat: no separators, no `..`, no control bytes.
    fn ensure_key_safe(key: &str) -> ObjectStoreResult<()> {
        let invalid = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with(TMP_PREFIX)
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'/' || b == b'\\');
        if invalid {
            return Err(ObjectStoreError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    fn ensure_bucket_safe(bucket: &str) -> ObjectStoreResult<()> {
        let valid = !bucket.is_empty()
            && bucket
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
            && !bucket.starts_with('.');
        if valid {
            Ok(())
        } else {
            Err(ObjectStoreError::InvalidKey(bucket.to_string()))
        }
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard directory names for an object key.
    ///
    /// First two bytes of MD5(bucket/key) as lowercase hex (00-ff).
    fn object_shards(bucket: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket, key);
        let mut path = self.bucket_root(bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn write_atomically(&self, file_path: &Path, bytes: &[u8]) -> ObjectStoreResult<()> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            ObjectStoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));

        if let Err(err) = write_and_sync(&tmp_path, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(file_path).await?;
                fs::rename(&tmp_path, file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(ObjectStoreError::Io(err));
            }
        }
        Ok(())
    }

    /// Remove empty directories from `start` up to (not including) `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

async fn write_and_sync(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Child directories of `dir`; a missing `dir` counts as empty.
async fn child_dirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> ObjectStoreResult<()> {
        Self::ensure_bucket_safe(bucket)?;
        fs::create_dir_all(self.bucket_root(bucket)).await?;
        Ok(())
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Bytes) -> ObjectStoreResult<()> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(bucket, key);
        self.write_atomically(&file_path, &bytes).await?;
        debug!(bucket, key, size = bytes.len(), "stored object");
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> ObjectStoreResult<ObjectReader> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(bucket, key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ObjectStoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                ObjectStoreError::Io(err)
            }
        })?;
        Ok(Box::new(file))
    }

    async fn delete(&self, bucket: &str, key: &str) -> ObjectStoreResult<()> {
        Self::ensure_bucket_safe(bucket)?;
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(bucket, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
                return Ok(());
            }
            Err(err) => return Err(ObjectStoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    async fn list(&self, bucket: &str) -> ObjectStoreResult<Vec<StoredObject>> {
        Self::ensure_bucket_safe(bucket)?;
        let mut objects = Vec::new();
        for shard_a in child_dirs(&self.bucket_root(bucket)).await? {
            for shard_b in child_dirs(&shard_a).await? {
                let mut entries = fs::read_dir(&shard_b).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if name.starts_with(TMP_PREFIX) {
                        continue;
                    }
                    let meta = entry.metadata().await?;
                    if !meta.is_file() {
                        continue;
                    }
                    objects.push(StoredObject {
                        key: name,
                        last_modified: DateTime::<Utc>::from(meta.modified()?),
                    });
                }
            }
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn probe(&self) -> ObjectStoreResult<()> {
        fs::create_dir_all(&self.base_path).await?;
        let tmp_path = self
            .base_path
            .join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read_back = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read_back? == b"readyz" {
            Ok(())
        } else {
            Err(ObjectStoreError::Unavailable(
                "probe file content mismatch".into(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn read_all(mut reader: ObjectReader) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.expect("read blob");
        buf
    }

    #[tokio::test]
    async fn put_get_delete_cycle() {
        let dir = TempDir::new().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        store.ensure_bucket("images").await.expect("bucket");

        store
            .put("images", "abc.png", Bytes::from_static(b"\x89PN"))
            .await
            .expect("put");
        let reader = store.get("images", "abc.png").await.expect("get");
        assert_eq!(read_all(reader).await, b"\x89PN");

        store.delete("images", "abc.png").await.expect("delete");
        let err = store.get("images", "abc.png").await.err().expect("missing");
        assert!(matches!(err, ObjectStoreError::NotFound { .. }));

        // shard directories are pruned back to the bucket root
        let remaining = child_dirs(&dir.path().join("images")).await.expect("dirs");
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn delete_of_absent_key_is_ok() {
        let dir = TempDir::new().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        store.delete("images", "never-written.png").await.expect("delete");
        store.delete("images", "never-written.png").await.expect("delete again");
    }

    #[tokio::test]
    async fn put_overwrites_existing_blob() {
        let dir = TempDir::new().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        store.put("images", "k.gif", Bytes::from_static(b"one")).await.expect("put");
        store.put("images", "k.gif", Bytes::from_static(b"two")).await.expect("put");
        let reader = store.get("images", "k.gif").await.expect("get");
        assert_eq!(read_all(reader).await, b"two");
    }

    #[tokio::test]
    async fn rejects_unsafe_keys() {
        let dir = TempDir::new().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        for key in ["", "../escape", "a/b.png", ".tmp-x", "bad\u{7}"] {
            let err = store
                .put("images", key, Bytes::from_static(b"x"))
                .await
                .expect_err("unsafe key");
            assert!(matches!(err, ObjectStoreError::InvalidKey(_)), "{key:?}");
        }
        let err = store
            .put("../up", "ok.png", Bytes::from_static(b"x"))
            .await
            .expect_err("unsafe bucket");
        assert!(matches!(err, ObjectStoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn list_reports_stored_keys_only() {
        let dir = TempDir::new().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        assert!(store.list("images").await.expect("empty list").is_empty());

        store.put("images", "b.png", Bytes::from_static(b"b")).await.expect("put");
        store.put("images", "a.png", Bytes::from_static(b"a")).await.expect("put");
        store.put("other", "c.png", Bytes::from_static(b"c")).await.expect("put");

        let keys: Vec<String> = store
            .list("images")
            .await
            .expect("list")
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["a.png".to_string(), "b.png".to_string()]);
    }

    #[tokio::test]
    async fn probe_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let store = LocalObjectStore::new(dir.path().join("fresh"));
        store.probe().await.expect("probe");
    }
}
