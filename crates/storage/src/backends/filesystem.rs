//! Local filesystem storage backend.
//!
//! Multipart uploads are staged under `.multipart/{upload_id}/` inside the
//! storage root; completion concatenates the parts into a temp file next to
//! the destination, fsyncs it, and renames it into place.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, CompletedPart, ObjectMeta, ObjectStore};
use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::ContentHash;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Default chunk size for streaming reads (64 KiB).
const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Staging directory for in-progress multipart uploads, relative to the root.
const MULTIPART_DIR: &str = ".multipart";

/// File inside a staging directory recording the destination key.
const MULTIPART_KEY_FILE: &str = "key";

/// Local filesystem object store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(MULTIPART_DIR)).await?;
        Ok(Self { root })
    }

    /// Get the full path for a key, with path traversal protection.
    ///
    /// This is an async wrapper around `key_path_sync` that uses `spawn_blocking`
    /// to avoid blocking the Tokio runtime during filesystem operations like
    /// `canonicalize` and `symlink_metadata`.
    async fn key_path(&self, key: &str) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || Self::key_path_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    /// Synchronous key path validation with path traversal protection.
    ///
    /// Returns an error if the key would escape the storage root, or if it
    /// points into the multipart staging area.
    fn key_path_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.contains("..") || key.starts_with('/') || key.starts_with('\\') {
            return Err(StorageError::InvalidKey(format!(
                "path traversal not allowed: {key}"
            )));
        }
        if key == MULTIPART_DIR || key.starts_with(&format!("{MULTIPART_DIR}/")) {
            return Err(StorageError::InvalidKey(format!("reserved prefix: {key}")));
        }

        for component in Path::new(key).components() {
            if !matches!(component, std::path::Component::Normal(_)) {
                return Err(StorageError::InvalidKey(format!(
                    "contains unsafe path component: {key}"
                )));
            }
        }

        let path = root.join(key);

        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        // Existing paths (or symlinks, even broken ones) must resolve inside the root.
        match std::fs::symlink_metadata(&path) {
            Ok(meta) => {
                let canonical = path.canonicalize().map_err(|e| {
                    if meta.file_type().is_symlink() {
                        StorageError::InvalidKey(format!(
                            "symlink target missing or invalid: {key}"
                        ))
                    } else {
                        StorageError::Io(std::io::Error::new(
                            e.kind(),
                            format!("failed to canonicalize path: {e}"),
                        ))
                    }
                })?;

                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes storage root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(StorageError::Io(std::io::Error::new(
                    err.kind(),
                    format!("failed to stat path: {err}"),
                )));
            }
        }

        // New paths: the nearest existing ancestor must resolve inside the root,
        // so files can't be created through a symlinked directory.
        let mut ancestor = path.as_path();
        while let Some(parent) = ancestor.parent() {
            match std::fs::symlink_metadata(parent) {
                Ok(meta) => {
                    let parent_canonical = parent.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "ancestor symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(std::io::Error::new(
                                e.kind(),
                                format!("failed to canonicalize ancestor: {e}"),
                            ))
                        }
                    })?;

                    if !parent_canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "ancestor path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StorageError::Io(std::io::Error::new(
                        err.kind(),
                        format!("failed to stat ancestor: {err}"),
                    )));
                }
            }
            ancestor = parent;
        }

        Ok(path)
    }

    /// Staging directory for a multipart upload. Upload ids are UUIDs we minted.
    fn staging_dir(&self, upload_id: &str) -> StorageResult<PathBuf> {
        let id = Uuid::parse_str(upload_id)
            .map_err(|_| StorageError::NotFound(format!("multipart upload {upload_id}")))?;
        Ok(self.root.join(MULTIPART_DIR).join(id.to_string()))
    }

    /// Resolve a staging directory and verify it belongs to `key`.
    async fn open_staging(&self, key: &str, upload_id: &str) -> StorageResult<PathBuf> {
        let dir = self.staging_dir(upload_id)?;
        let recorded = fs::read_to_string(dir.join(MULTIPART_KEY_FILE))
            .await
            .map_err(|e| not_found_or_io(e, &format!("multipart upload {upload_id}")))?;
        if recorded != key {
            return Err(StorageError::InvalidPart(format!(
                "multipart upload {upload_id} belongs to '{recorded}', not '{key}'"
            )));
        }
        Ok(dir)
    }

    /// Ensure parent directory exists.
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

fn not_found_or_io(e: std::io::Error, what: &str) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(what.to_string())
    } else {
        StorageError::Io(e)
    }
}

/// Sibling temp path with a unique suffix, so concurrent writers never collide.
fn temp_path_for(path: &Path) -> PathBuf {
    let temp_name = format!(".tmp.{}", Uuid::new_v4());
    path.with_file_name(
        path.file_name()
            .map(|n| format!("{}{}", n.to_string_lossy(), temp_name))
            .unwrap_or_else(|| temp_name.clone()),
    )
}

/// Write `data` to `path` via temp file, fsync and rename.
async fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let temp_path = temp_path_for(path);
    {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
    }
    fs::rename(&temp_path, path).await?;
    Ok(())
}

fn part_file_name(part_number: i32) -> String {
    format!("{part_number:05}.part")
}

#[async_trait]
impl ObjectStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn create_multipart_upload(&self, key: &str) -> StorageResult<String> {
        // Validate up front so a bad key fails before any part is written.
        self.key_path(key).await?;

        let upload_id = Uuid::new_v4().to_string();
        let dir = self.staging_dir(&upload_id)?;
        fs::create_dir_all(&dir).await?;
        write_atomic(&dir.join(MULTIPART_KEY_FILE), key.as_bytes()).await?;
        Ok(upload_id)
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> StorageResult<CompletedPart> {
        if !(1..=10_000).contains(&part_number) {
            return Err(StorageError::InvalidPart(format!(
                "part number {part_number} outside 1..=10000"
            )));
        }
        let dir = self.open_staging(key, upload_id).await?;
        write_atomic(&dir.join(part_file_name(part_number)), &data).await?;

        Ok(CompletedPart {
            part_number,
            etag: ContentHash::compute(&data).to_hex(),
            size: data.len() as u64,
        })
    }

    #[instrument(skip(self, parts), fields(backend = "filesystem", parts = parts.len()))]
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        use tokio::io::AsyncReadExt;

        if parts.is_empty() {
            return Err(StorageError::InvalidPart(
                "multipart upload needs at least one part".to_string(),
            ));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(StorageError::InvalidPart(
                "parts must be listed in ascending part-number order".to_string(),
            ));
        }

        let dir = self.open_staging(key, upload_id).await?;
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;

        let temp_path = temp_path_for(&path);
        let assemble = async {
            let mut out = fs::File::create(&temp_path).await?;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            for part in parts {
                let part_path = dir.join(part_file_name(part.part_number));
                let mut file = fs::File::open(&part_path).await.map_err(|e| {
                    not_found_or_io(e, &format!("part {} of {upload_id}", part.part_number))
                })?;
                let mut hasher = ContentHash::hasher();
                let mut copied = 0u64;
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    out.write_all(&buf[..n]).await?;
                    copied += n as u64;
                }
                let etag = hasher.finalize().to_hex();
                if etag != part.etag || copied != part.size {
                    return Err(StorageError::InvalidPart(format!(
                        "part {} does not match its recorded etag/size",
                        part.part_number
                    )));
                }
            }
            out.sync_all().await?;
            Ok::<(), StorageError>(())
        };

        if let Err(e) = assemble.await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }
        fs::rename(&temp_path, &path).await?;

        if let Err(e) = fs::remove_dir_all(&dir).await {
            tracing::warn!(upload_id, error = %e, "Failed to remove multipart staging directory");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        let dir = self.open_staging(key, upload_id).await?;
        fs::remove_dir_all(&dir)
            .await
            .map_err(|e| not_found_or_io(e, &format!("multipart upload {upload_id}")))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.key_path(key).await?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_io(e, key))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        Ok(ObjectMeta {
            size: metadata.len(),
            last_modified: metadata.modified().ok().map(|t| t.into()),
            content_type: None,
            etag: None,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.key_path(key).await?;
        let data = fs::read(&path).await.map_err(|e| not_found_or_io(e, key))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        use tokio::io::AsyncReadExt;

        let path = self.key_path(key).await?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(e, key))?;

        // Stream the file in chunks instead of loading entirely into memory
        let stream = async_stream::try_stream! {
            let mut file = file;
            let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                yield Bytes::copy_from_slice(&buf[..n]);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        self.ensure_parent(&path).await?;
        write_atomic(&path, &data).await
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.key_path(key).await?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or_io(e, key))
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    async fn health_check(&self) -> StorageResult<()> {
        let probe = self.root.join(MULTIPART_DIR).join(".health-check");
        write_atomic(&probe, b"health-check").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }
}
