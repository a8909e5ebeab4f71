//! Durable local spool for bytes not yet uploaded as a backend part.
//!
//! Each session owns a directory `{root}/{upload_id}/` holding one file named
//! after the absolute offset of its first byte (`{base_offset}.spool`). When a
//! full part has been uploaded, the unconsumed tail is copied into a successor
//! file and the old one is discarded. Every append is fsynced before the
//! session offset is advanced, so after a crash the spool always holds at
//! least the durable bytes and is truncated back to them on reopen.

use bytes::Bytes;
use ferry_core::{BlockHasher, UploadId};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const READ_BUFFER_SIZE: usize = 1024 * 1024;

pub struct Spool {
    dir: PathBuf,
    base_offset: u64,
    file: File,
    len: u64,
}

impl Spool {
    /// Directory holding the spool files of a session.
    pub fn session_dir(root: &Path, id: &UploadId) -> PathBuf {
        root.join(id.to_string())
    }

    fn file_path(dir: &Path, base_offset: u64) -> PathBuf {
        dir.join(format!("{base_offset}.spool"))
    }

    /// Open the spool starting at `base_offset` and truncate it to `durable_len`.
    ///
    /// Fails with `UnexpectedEof` when the file holds fewer bytes than the
    /// session already acknowledged. Stale spool files left behind by an
    /// interrupted roll are removed.
    pub async fn open(
        root: &Path,
        id: &UploadId,
        base_offset: u64,
        durable_len: u64,
    ) -> io::Result<Self> {
        let dir = Self::session_dir(root, id);
        fs::create_dir_all(&dir).await?;

        let path = Self::file_path(&dir, base_offset);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        let on_disk = file.metadata().await?.len();
        if on_disk < durable_len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "{} holds {on_disk} bytes but {durable_len} were acknowledged",
                    path.display()
                ),
            ));
        }
        if on_disk != durable_len {
            file.set_len(durable_len).await?;
            file.sync_all().await?;
        }

        let spool = Self {
            dir,
            base_offset,
            file,
            len: durable_len,
        };
        spool.remove_stale_files().await?;
        Ok(spool)
    }

    /// Absolute offset of the first spooled byte.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append bytes and fsync them.
    pub async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.len)).await?;
        self.file.write_all(data).await?;
        self.file.sync_data().await?;
        self.len += data.len() as u64;
        Ok(())
    }

    /// Read the first `n` spooled bytes.
    pub async fn read_prefix(&mut self, n: u64) -> io::Result<Bytes> {
        let n = n.min(self.len);
        let mut buf = vec![0u8; n as usize];
        self.file.seek(SeekFrom::Start(0)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Read every spooled byte.
    pub async fn read_all(&mut self) -> io::Result<Bytes> {
        self.read_prefix(self.len).await
    }

    /// Feed the spooled bytes into a hasher in order.
    pub async fn feed(&mut self, hasher: &mut BlockHasher) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0)).await?;
        let mut remaining = self.len;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        while remaining > 0 {
            let want = remaining.min(READ_BUFFER_SIZE as u64) as usize;
            self.file.read_exact(&mut buf[..want]).await?;
            hasher.update(&buf[..want]);
            remaining -= want as u64;
        }
        Ok(())
    }

    /// Write the bytes after the first `consumed` into a new spool file that
    /// starts at `base_offset + consumed`. The current file is left in place
    /// until [`Spool::discard`] is called.
    pub async fn successor(&mut self, consumed: u64) -> io::Result<Spool> {
        let consumed = consumed.min(self.len);
        let base_offset = self.base_offset + consumed;
        let path = Self::file_path(&self.dir, base_offset);

        let mut tail = vec![0u8; (self.len - consumed) as usize];
        self.file.seek(SeekFrom::Start(consumed)).await?;
        self.file.read_exact(&mut tail).await?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.write_all(&tail).await?;
        file.sync_all().await?;

        Ok(Spool {
            dir: self.dir.clone(),
            base_offset,
            file,
            len: tail.len() as u64,
        })
    }

    /// Delete this spool file.
    pub async fn discard(self) {
        let path = Self::file_path(&self.dir, self.base_offset);
        drop(self.file);
        if let Err(e) = fs::remove_file(&path).await
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove spool file");
        }
    }

    async fn remove_stale_files(&self) -> io::Result<()> {
        let current = Self::file_path(&self.dir, self.base_offset);
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path != current && path.extension().is_some_and(|ext| ext == "spool") {
                tracing::debug!(path = %path.display(), "Removing stale spool file");
                fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}

/// Remove every spool file of a session.
pub async fn remove_session_dir(root: &Path, id: &UploadId) {
    let dir = Spool::session_dir(root, id);
    if let Err(e) = fs::remove_dir_all(&dir).await
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(upload_id = %id, error = %e, "Failed to remove session spool directory");
    }
}
