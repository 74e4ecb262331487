use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::paths::AppPaths;

// Path-addressed blob storage.
//
// Markers are tiny JSON documents addressed by a slash-separated key such as
// `fv_json/{dataset}/active_export.json`. Writes overwrite, reads of a missing
// key are `Ok(None)`, and `list` enumerates the direct children of a
// directory-like prefix together with their creation timestamps.

/// Metadata returned by `list` for a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub key: String,
    pub size_bytes: u64,
    /// Creation time in milliseconds since the epoch (modification time when
    /// the filesystem does not record birth time).
    pub created_at_ms: i64,
}

/// Errors emitted by blob storage operations.
#[derive(Debug, Error)]
pub enum BlobError {
    #[error("invalid blob key `{0}`")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for BlobError {
    fn from(e: std::io::Error) -> Self {
        BlobError::Io(e.to_string())
    }
}

/// Validate a blob key: relative, slash separated, no empty, hidden, or
/// parent-directory segments.
pub fn validate_key(key: &str) -> Result<(), BlobError> {
    let trimmed = key.strip_suffix('/').unwrap_or(key);
    if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.contains('\\') {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    let valid = trimmed
        .split('/')
        .all(|segment| !segment.is_empty() && !segment.starts_with('.'));
    if !valid {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Trait abstracting over blob storage backends.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`, replacing any previous content.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError>;

    /// Return the content stored under `key`, or `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobError>;

    /// Delete the blob if present. Returns Ok(true) if deleted, Ok(false) if it
    /// did not exist.
    async fn delete(&self, key: &str) -> Result<bool, BlobError>;

    /// List the blobs stored directly under the directory-like `prefix`.
    /// A missing prefix yields an empty list.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>, BlobError>;
}

/// Durability policy for filesystem writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurableWrite {
    /// No explicit fsync (fastest, least durable).
    None,
    /// Fsync the file only (good for most cases).
    FileOnly,
    /// Fsync file and parent directory (recommended for production).
    FileAndDir,
}

/// Filesystem blob store implementation using the AppPaths layout.
///
/// Write strategy:
/// - Content is written to a temp file under `blobs/.tmp`, then renamed over
///   the final path, so readers never observe a partially written marker.
/// - Size verification: compare written bytes to file metadata before rename.
///
/// Read strategy:
/// - Read paths are computed without creating directories.
#[derive(Debug, Clone, bon::Builder)]
pub struct FsBlobStore {
    paths: AppPaths,
    #[builder(default = DurableWrite::FileOnly)]
    durability: DurableWrite,
}

impl FsBlobStore {
    fn root(&self) -> Result<PathBuf, BlobError> {
        self.paths
            .blobs_dir()
            .map_err(|e| BlobError::Io(e.to_string()))
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobError> {
        validate_key(key)?;
        let mut path = self.root()?;
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        Ok(path)
    }

    /// Fsync a directory by opening and syncing it.
    async fn fsync_dir(&self, dir_path: &Path) {
        // Directory fsync is best-effort; some platforms don't support it.
        match fs::File::open(dir_path).await {
            Ok(dir_file) => {
                if let Err(e) = dir_file.sync_all().await {
                    tracing::warn!("directory fsync unsupported or failed: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!("failed to open directory for fsync: {}", e);
            }
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        let final_path = self.path_for(key)?;
        let parent = final_path
            .parent()
            .ok_or_else(|| BlobError::InvalidKey(key.to_string()))?
            .to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| BlobError::Io(format!("create parent dir: {}", e)))?;

        let temp_dir = self
            .paths
            .blob_tmp_dir()
            .map_err(|e| BlobError::Io(e.to_string()))?;
        let temp_file = tempfile::NamedTempFile::new_in(&temp_dir)
            .map_err(|e| BlobError::Io(format!("create temp file: {}", e)))?;
        let temp_path = temp_file.into_temp_path();

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| BlobError::Io(format!("open temp file: {}", e)))?;
        file.write_all(&data)
            .await
            .map_err(|e| BlobError::Io(format!("write temp file: {}", e)))?;
        if self.durability != DurableWrite::None {
            file.sync_all()
                .await
                .map_err(|e| BlobError::Io(format!("fsync file: {}", e)))?;
        }
        drop(file);

        let metadata = fs::metadata(&temp_path)
            .await
            .map_err(|e| BlobError::Io(format!("stat temp file: {}", e)))?;
        if metadata.len() != data.len() as u64 {
            return Err(BlobError::Io(format!(
                "size mismatch: wrote {} bytes, file is {}",
                data.len(),
                metadata.len()
            )));
        }

        fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| BlobError::Io(format!("rename failed: {}", e)))?;
        // The temp path no longer exists; keep the guard from deleting the
        // renamed file's old name.
        let _ = temp_path.keep();

        if self.durability == DurableWrite::FileAndDir {
            self.fsync_dir(&parent).await;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, BlobError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(buf) => Ok(Some(Bytes::from(buf))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BlobError::Io(format!("read blob: {}", e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, BlobError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BlobError::Io(format!("delete blob: {}", e))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>, BlobError> {
        let dir = self.path_for(prefix)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BlobError::Io(format!("list blobs: {}", e))),
        };

        let base = prefix.trim_end_matches('/');
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let created = metadata.created().or_else(|_| metadata.modified())?;
            out.push(BlobMeta {
                key: format!("{base}/{name}"),
                size_bytes: metadata.len(),
                created_at_ms: system_time_ms(created),
            });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

fn system_time_ms(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fs_store(temp: &TempDir) -> FsBlobStore {
        let paths = AppPaths::new(temp.path()).unwrap();
        FsBlobStore::builder().paths(paths).build()
    }

    #[test]
    fn test_validate_key_rejections() {
        assert!(validate_key("fv_json/ds-1/active_export.json").is_ok());
        assert!(validate_key("fv_done_json/ds-1/").is_ok());

        for bad in ["", "/abs/key", "a//b", "a/../b", "a/.hidden", "a\\b", ".tmp/x"] {
            assert!(
                matches!(validate_key(bad), Err(BlobError::InvalidKey(_))),
                "key `{bad}` should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_fs_blob_store_put_get_delete() {
        let temp = TempDir::new().unwrap();
        let store = fs_store(&temp);
        let key = "fv_json/ds-1/active_export.json";

        store.put(key, Bytes::from_static(b"{\"a\":1}")).await.unwrap();
        let got = store.get(key).await.unwrap().expect("blob present");
        assert_eq!(got.as_ref(), b"{\"a\":1}");

        assert!(store.delete(key).await.unwrap());
        assert!(store.get(key).await.unwrap().is_none());

        // Delete again (idempotent)
        assert!(!store.delete(key).await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_blob_store_put_overwrites() {
        let temp = TempDir::new().unwrap();
        let store = fs_store(&temp);
        let key = "fv_json/ds-1/active_export.json";

        store.put(key, Bytes::from_static(b"first")).await.unwrap();
        store.put(key, Bytes::from_static(b"second")).await.unwrap();

        let got = store.get(key).await.unwrap().unwrap();
        assert_eq!(got.as_ref(), b"second");
        let listed = store.list("fv_json/ds-1/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size_bytes, 6);
    }

    #[tokio::test]
    async fn test_fs_blob_store_list_direct_children() {
        let temp = TempDir::new().unwrap();
        let store = fs_store(&temp);

        store.put("fv_done_json/ds-1/b.json", Bytes::from_static(b"b")).await.unwrap();
        store.put("fv_done_json/ds-1/a.json", Bytes::from_static(b"a")).await.unwrap();
        store.put("fv_done_json/ds-2/c.json", Bytes::from_static(b"c")).await.unwrap();

        let listed = store.list("fv_done_json/ds-1").await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["fv_done_json/ds-1/a.json", "fv_done_json/ds-1/b.json"]);
        assert!(listed.iter().all(|m| m.created_at_ms > 0));
    }

    #[tokio::test]
    async fn test_fs_blob_store_missing_prefix_lists_empty() {
        let temp = TempDir::new().unwrap();
        let store = fs_store(&temp);

        let listed = store.list("fv_done_json/unknown/").await.unwrap();
        assert!(listed.is_empty());
        assert!(store.get("fv_json/unknown/active_export.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fs_blob_store_invalid_key() {
        let temp = TempDir::new().unwrap();
        let store = fs_store(&temp);

        let result = store.put("../escape.json", Bytes::new()).await;
        assert!(matches!(result, Err(BlobError::InvalidKey(_))));
        let result = store.get("a//b").await;
        assert!(matches!(result, Err(BlobError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_fs_blob_store_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let paths = AppPaths::new(temp.path()).unwrap();
        let store = FsBlobStore::builder()
            .paths(paths.clone())
            .durability(DurableWrite::FileAndDir)
            .build();

        store.put("x/y.json", Bytes::from_static(b"{}")).await.unwrap();

        let tmp_dir = paths.blob_tmp_dir().unwrap();
        let leftover = std::fs::read_dir(tmp_dir).unwrap().count();
        assert_eq!(leftover, 0);
    }
}
