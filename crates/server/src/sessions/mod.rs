//! Upload session manager.
//!
//! Owns the resumable-upload state machine:
//!
//! ```text
//! Created --first chunk--> Receiving --offset == size--> Finalizing
//! Finalizing --> Completed | Duplicate | Failed
//! Created | Receiving --abort / idle TTL--> Aborted | Expired
//! ```
//!
//! Chunk writers on one session are serialized by a per-session async mutex.
//! Received bytes go to a fsynced spool of at most one backend part plus one
//! chunk, and into a running block hasher; full parts are uploaded as soon as
//! they accumulate. The metadata store is the authority for offsets and state:
//! the in-memory handle is only a cache and is rebuilt from the recorded parts
//! and the spool whenever it is missing or suspect.

pub mod admission;
pub mod error;
mod finalize;
pub mod spool;

pub use admission::Admission;
pub use error::{SessionError, SessionResult};

use crate::metrics::{self, BYTES_RECEIVED, CHUNK_DURATION, OFFSET_MISMATCHES, PARTS_UPLOADED};
use crate::notify::NotificationHub;
use bytes::Bytes;
use dashmap::DashMap;
use ferry_core::config::AppConfig;
use ferry_core::hash::encode_digests;
use ferry_core::{BlockHasher, HASH_BLOCK_SIZE, Router, UploadId, UploadSession, UploadState};
use ferry_metadata::MetadataStore;
use ferry_metadata::models::{SessionFinish, UploadPartRow, UploadSessionRow};
use ferry_storage::{CompletedPart, ObjectStore, StorageError};
use spool::Spool;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::Mutex;

const SWEEP_BATCH: u32 = 100;
const RECOVERY_BATCH: u32 = 1000;

/// Settings the session manager needs from the application config.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub spool_dir: PathBuf,
    pub part_size: u64,
    pub session_ttl: time::Duration,
    pub chunk_timeout: Duration,
    pub max_upload_size: u64,
    pub router: Router,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            spool_dir: config.server.spool_dir.clone(),
            part_size: config.multipart.part_size,
            session_ttl: config.server.session_ttl(),
            chunk_timeout: config.server.chunk_timeout(),
            max_upload_size: config.server.max_upload_size,
            router: config.router.router(),
        }
    }
}

/// Result of an accepted chunk.
#[derive(Clone, Debug)]
pub struct ChunkOutcome {
    pub offset: u64,
    pub state: UploadState,
    pub expires_at: OffsetDateTime,
}

/// Live state of a session that is receiving bytes.
struct SessionHandle {
    backend_upload_id: String,
    spool: Spool,
    hasher: BlockHasher,
    parts: Vec<CompletedPart>,
}

type Slot = Arc<Mutex<Option<SessionHandle>>>;

pub struct SessionManager {
    settings: SessionSettings,
    storage: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    admission: Admission,
    notifications: NotificationHub,
    slots: DashMap<UploadId, Slot>,
    hash_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        admission: Admission,
        storage: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        notifications: NotificationHub,
    ) -> Self {
        Self {
            settings,
            storage,
            metadata,
            admission,
            notifications,
            slots: DashMap::new(),
            hash_locks: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Create a session. No backend state is opened until the first chunk.
    pub async fn create(
        &self,
        filename: &str,
        declared_size: i64,
        upload_metadata: BTreeMap<String, String>,
    ) -> SessionResult<UploadSession> {
        if declared_size > 0 && declared_size as u64 > self.settings.max_upload_size {
            return Err(SessionError::TooLarge {
                declared: declared_size as u64,
                max: self.settings.max_upload_size,
            });
        }

        let mut session = UploadSession::new(filename, declared_size, self.settings.session_ttl)?;
        session.metadata = upload_metadata;
        self.metadata
            .create_session(&UploadSessionRow::from(&session))
            .await?;

        metrics::UPLOAD_SESSIONS_CREATED.inc();
        tracing::info!(
            upload_id = %session.id,
            filename = %session.filename,
            declared_size = session.declared_size,
            large = self.settings.router.is_large(session.declared_size),
            "Upload session created"
        );
        Ok(session)
    }

    /// Current state of a session. Never mutates anything.
    pub async fn status(&self, id: UploadId) -> SessionResult<UploadSession> {
        self.load(id).await
    }

    /// Accept a chunk at `offset`.
    ///
    /// A chunk whose offset differs from the session offset is rejected
    /// without touching any state. The chunk that completes the upload also
    /// finalizes the session before returning. A session that already holds
    /// every byte but was never finalized is finalized by the next write,
    /// and an empty write at its final offset reports the outcome.
    pub async fn write_chunk(
        &self,
        id: UploadId,
        offset: u64,
        data: Bytes,
    ) -> SessionResult<ChunkOutcome> {
        Self::check_writable(&self.load(id).await?)?;
        let slot = self.slot(id);
        let mut guard = slot.lock().await;

        let session = self.load(id).await?;
        if let Err(e) = Self::check_writable(&session) {
            drop(guard);
            self.forget_slot(id, &slot);
            return Err(e);
        }

        if session.state == UploadState::Finalizing || session.is_fully_received() {
            let done = self.resume_finalize(&mut guard, session).await?;
            if data.is_empty() && offset == done.received_offset {
                return Ok(ChunkOutcome {
                    offset: done.received_offset,
                    state: done.state,
                    expires_at: done.expires_at,
                });
            }
            return Err(SessionError::NotWritable {
                state: done.state,
                offset: done.received_offset,
            });
        }

        let now = OffsetDateTime::now_utc();
        if session.is_expired_at(now) {
            *guard = None;
            self.expire_locked(&session).await?;
            return Err(SessionError::Gone {
                state: UploadState::Expired,
            });
        }
        if offset != session.received_offset {
            OFFSET_MISMATCHES.inc();
            tracing::debug!(
                upload_id = %id,
                offset,
                current = session.received_offset,
                "Rejected chunk at wrong offset"
            );
            return Err(SessionError::OffsetMismatch {
                current: session.received_offset,
            });
        }
        let len = data.len() as u64;
        if offset + len > session.declared_size {
            return Err(SessionError::ExceedsDeclaredSize {
                offset,
                len,
                declared: session.declared_size,
            });
        }
        if data.is_empty() {
            return Ok(ChunkOutcome {
                offset,
                state: session.state,
                expires_at: session.expires_at,
            });
        }

        let large = self.settings.router.is_large(session.declared_size);
        if large {
            self.admission.acquire(id).await?;
        }

        let started = Instant::now();
        let accepted = tokio::time::timeout(
            self.settings.chunk_timeout,
            self.accept_chunk(&mut guard, &session, data, now),
        )
        .await;
        CHUNK_DURATION.observe(started.elapsed().as_secs_f64());

        let new_offset = match accepted {
            Ok(Ok(new_offset)) => new_offset,
            Ok(Err(SessionError::SpoolLost { id, detail })) => {
                *guard = None;
                tracing::error!(upload_id = %id, detail = %detail, "Session spool lost");
                let current = self.load(id).await?;
                self.fail_locked(&current, format!("spool lost: {detail}"))
                    .await?;
                return Err(SessionError::Gone {
                    state: UploadState::Failed,
                });
            }
            Ok(Err(e)) => {
                *guard = None;
                metrics::record_upload_error("chunk_failed");
                tracing::warn!(upload_id = %id, offset, error = %e, "Chunk write failed");
                return Err(e);
            }
            Err(_) => {
                *guard = None;
                metrics::record_upload_error("chunk_timeout");
                let current = self
                    .load(id)
                    .await
                    .map(|s| s.received_offset)
                    .unwrap_or(offset);
                tracing::warn!(
                    upload_id = %id,
                    offset,
                    current,
                    timeout_ms = self.settings.chunk_timeout.as_millis() as u64,
                    "Chunk I/O timed out"
                );
                return Err(SessionError::Timeout { offset: current });
            }
        };
        if large {
            self.admission.touch(&id);
        }

        if new_offset < session.declared_size {
            return Ok(ChunkOutcome {
                offset: new_offset,
                state: UploadState::Receiving,
                expires_at: now + self.settings.session_ttl,
            });
        }

        // The offset update that reached the declared size moved the session
        // to `finalizing`.
        let session = self.load(id).await?;
        if session.state != UploadState::Finalizing {
            *guard = None;
            return Err(self.conflict(id).await);
        }
        let finished = self.finalize_locked(&mut guard, &session, false).await?;
        Ok(ChunkOutcome {
            offset: finished.received_offset,
            state: finished.state,
            expires_at: finished.expires_at,
        })
    }

    /// Abort a session and release its backend multipart upload.
    ///
    /// Aborting a session that is already aborted, expired or failed is a no-op.
    pub async fn abort(&self, id: UploadId) -> SessionResult<UploadSession> {
        let current = self.load(id).await?;
        match current.state {
            state if state.is_gone() => return Ok(current),
            UploadState::Created | UploadState::Receiving => {}
            state => return Err(SessionError::NotAbortable { state }),
        }
        let slot = self.slot(id);
        let mut guard = slot.lock().await;

        let session = self.load(id).await?;
        match session.state {
            state if state.is_gone() => {
                drop(guard);
                self.forget_slot(id, &slot);
                return Ok(session);
            }
            UploadState::Created | UploadState::Receiving => {}
            state => {
                drop(guard);
                if state.is_success() {
                    self.forget_slot(id, &slot);
                }
                return Err(SessionError::NotAbortable { state });
            }
        }

        *guard = None;
        self.release_backend(&session).await?;
        let aborted = self
            .finish(&session, UploadState::Aborted, session.object_key.clone(), None, None)
            .await?;
        tracing::info!(upload_id = %id, offset = session.received_offset, "Upload session aborted");
        Ok(aborted)
    }

    /// Expire every active session whose TTL has elapsed. Returns how many were expired.
    pub async fn sweep_expired(&self, now: OffsetDateTime) -> SessionResult<usize> {
        let rows = self.metadata.get_expired_sessions(now, SWEEP_BATCH).await?;
        let mut expired = 0;
        for row in rows {
            let id = UploadId::from_uuid(row.upload_id);
            let slot = self.slot(id);
            let mut guard = slot.lock().await;

            // Re-read under the lock; a chunk may have slid the expiry.
            let session = match self.load(id).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(upload_id = %id, error = %e, "Failed to load session for expiry");
                    continue;
                }
            };
            if !session.state.is_active() {
                drop(guard);
                if session.state.is_success() || session.state.is_gone() {
                    self.forget_slot(id, &slot);
                }
                continue;
            }
            // Every byte is stored; recovery finalizes it instead.
            if !session.is_expired_at(now) || session.is_fully_received() {
                continue;
            }

            *guard = None;
            match self.expire_locked(&session).await {
                Ok(()) => expired += 1,
                Err(e) => {
                    tracing::warn!(upload_id = %id, error = %e, "Failed to expire session")
                }
            }
        }
        Ok(expired)
    }

    /// Finalize every session that holds all of its bytes but whose last
    /// activity is before `stalled_before`: ones a previous process left in
    /// `finalizing`, and ones whose finalizing write was cut short.
    pub async fn recover_finalizing(&self, stalled_before: OffsetDateTime) -> SessionResult<usize> {
        let rows = self
            .metadata
            .get_stalled_sessions(stalled_before, RECOVERY_BATCH)
            .await?;
        let mut recovered = 0;
        for row in rows {
            let id = UploadId::from_uuid(row.upload_id);
            let slot = self.slot(id);
            let mut guard = slot.lock().await;

            let session = self.load(id).await?;
            if session.state != UploadState::Finalizing
                && !(session.state == UploadState::Receiving && session.is_fully_received())
            {
                if session.state.is_success() || session.state.is_gone() {
                    drop(guard);
                    self.forget_slot(id, &slot);
                }
                continue;
            }
            match self.resume_finalize(&mut guard, session).await {
                Ok(done) => {
                    recovered += 1;
                    tracing::info!(upload_id = %id, state = %done.state, "Recovered stalled session");
                }
                Err(e) => tracing::error!(upload_id = %id, error = %e, "Recovery finalization failed"),
            }
        }
        Ok(recovered)
    }

    /// Recover sessions that made no progress for twice the chunk timeout.
    pub async fn recover_stalled(&self, now: OffsetDateTime) -> SessionResult<usize> {
        self.recover_finalizing(now - self.settings.chunk_timeout * 2)
            .await
    }

    /// Number of sessions with live in-memory state.
    pub fn live_sessions(&self) -> usize {
        self.slots.len()
    }

    /// Finalize a session that holds every byte. The caller holds the session lock.
    async fn resume_finalize(
        &self,
        slot: &mut Option<SessionHandle>,
        mut session: UploadSession,
    ) -> SessionResult<UploadSession> {
        // The handle may predate an interrupted write; rebuild from durable state.
        *slot = None;
        if session.state == UploadState::Receiving {
            session
                .state
                .transition(UploadState::Finalizing)
                .map_err(|e| SessionError::Corrupt(e.to_string()))?;
            if !self
                .metadata
                .transition_state(
                    *session.id.as_uuid(),
                    UploadState::Receiving.as_str(),
                    UploadState::Finalizing.as_str(),
                    OffsetDateTime::now_utc(),
                )
                .await?
            {
                return Err(self.conflict(session.id).await);
            }
            session = self.load(session.id).await?;
        }
        tracing::info!(upload_id = %session.id, "Resuming interrupted finalization");
        self.finalize_locked(slot, &session, true).await
    }

    // ------------------------------------------------------------------
    // Chunk path
    // ------------------------------------------------------------------

    async fn accept_chunk(
        &self,
        slot: &mut Option<SessionHandle>,
        session: &UploadSession,
        data: Bytes,
        now: OffsetDateTime,
    ) -> SessionResult<u64> {
        let offset = session.received_offset;
        let handle = self.ensure_handle(slot, session).await?;

        // Leftover full parts from a restart or an earlier failed upload.
        self.flush_full_parts(session, handle)
            .await
            .map_err(|e| e.at_offset(offset))?;

        handle.spool.append(&data).await?;
        handle.hasher.update(&data);

        let new_offset = offset + data.len() as u64;
        let advanced = self
            .metadata
            .advance_offset(
                *session.id.as_uuid(),
                offset as i64,
                new_offset as i64,
                now,
                now + self.settings.session_ttl,
            )
            .await?;
        if !advanced {
            return Err(self.conflict(session.id).await);
        }
        BYTES_RECEIVED.inc_by(data.len() as u64);

        // The chunk is durable from here on; a failed part upload reports the
        // new offset so the client resumes after it.
        if new_offset < session.declared_size {
            self.flush_full_parts(session, handle)
                .await
                .map_err(|e| e.at_offset(new_offset))?;
        }
        Ok(new_offset)
    }

    async fn ensure_handle<'a>(
        &self,
        slot: &'a mut Option<SessionHandle>,
        session: &UploadSession,
    ) -> SessionResult<&'a mut SessionHandle> {
        let handle = match slot.take() {
            Some(handle) => handle,
            None => match session.backend_upload_id.clone() {
                Some(backend_upload_id) => self.rebuild_handle(session, backend_upload_id).await?,
                None => self.open_handle(session).await?,
            },
        };
        Ok(slot.insert(handle))
    }

    /// First chunk: open the backend multipart upload and move to `receiving`.
    async fn open_handle(&self, session: &UploadSession) -> SessionResult<SessionHandle> {
        let backend_upload_id = self
            .storage
            .create_multipart_upload(&session.object_key)
            .await
            .map_err(|e| e.into_session_error(session.received_offset))?;

        let began = self
            .metadata
            .begin_receiving(
                *session.id.as_uuid(),
                &backend_upload_id,
                OffsetDateTime::now_utc(),
            )
            .await?;
        if !began {
            if let Err(e) = self
                .storage
                .abort_multipart_upload(&session.object_key, &backend_upload_id)
                .await
            {
                tracing::warn!(upload_id = %session.id, error = %e, "Failed to abort orphaned multipart upload");
            }
            return Err(self.conflict(session.id).await);
        }

        let spool = Spool::open(&self.settings.spool_dir, &session.id, 0, 0).await?;
        tracing::debug!(
            upload_id = %session.id,
            backend_upload_id = %backend_upload_id,
            "Opened backend multipart upload"
        );
        Ok(SessionHandle {
            backend_upload_id,
            spool,
            hasher: BlockHasher::with_block_size(HASH_BLOCK_SIZE),
            parts: Vec::new(),
        })
    }

    /// Rebuild the handle from recorded parts and the durable spool.
    async fn rebuild_handle(
        &self,
        session: &UploadSession,
        backend_upload_id: String,
    ) -> SessionResult<SessionHandle> {
        let rows = self.metadata.get_parts(*session.id.as_uuid()).await?;

        let mut parts = Vec::with_capacity(rows.len());
        let mut digests = Vec::new();
        let mut base_offset = 0u64;
        for (index, row) in rows.iter().enumerate() {
            if row.part_number != index as i32 + 1 {
                return Err(SessionError::Corrupt(format!(
                    "upload {} is missing part {}",
                    session.id,
                    index + 1
                )));
            }
            let size = u64::try_from(row.size_bytes).map_err(|_| {
                SessionError::Corrupt(format!("part {} has negative size", row.part_number))
            })?;
            digests.extend(row.digests()?);
            parts.push(CompletedPart {
                part_number: row.part_number,
                etag: row.etag.clone(),
                size,
            });
            base_offset += size;
        }

        if base_offset > session.received_offset {
            return Err(SessionError::Corrupt(format!(
                "upload {} has {base_offset} bytes in parts but offset {}",
                session.id, session.received_offset
            )));
        }

        let mut hasher = BlockHasher::resume(HASH_BLOCK_SIZE, digests);
        if hasher.bytes_hashed() != base_offset {
            return Err(SessionError::Corrupt(format!(
                "upload {} part digests cover {} bytes, parts hold {base_offset}",
                session.id,
                hasher.bytes_hashed()
            )));
        }

        let durable_len = session.received_offset - base_offset;
        let mut spool = Spool::open(&self.settings.spool_dir, &session.id, base_offset, durable_len)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::NotFound => {
                    SessionError::SpoolLost {
                        id: session.id,
                        detail: e.to_string(),
                    }
                }
                _ => SessionError::Io(e),
            })?;
        spool.feed(&mut hasher).await?;

        tracing::info!(
            upload_id = %session.id,
            parts = parts.len(),
            base_offset,
            spooled = durable_len,
            "Rebuilt session from durable state"
        );
        Ok(SessionHandle {
            backend_upload_id,
            spool,
            hasher,
            parts,
        })
    }

    /// Upload every full part sitting in the spool.
    async fn flush_full_parts(
        &self,
        session: &UploadSession,
        handle: &mut SessionHandle,
    ) -> SessionResult<()> {
        let part_size = self.settings.part_size;
        while handle.spool.len() >= part_size {
            let part_number = handle.parts.len() as i32 + 1;
            let data = handle.spool.read_prefix(part_size).await?;
            let part = self
                .storage
                .upload_part(
                    &session.object_key,
                    &handle.backend_upload_id,
                    part_number,
                    data,
                )
                .await?;

            let first_block = (handle.spool.base_offset() / HASH_BLOCK_SIZE) as usize;
            let block_count = (part_size / HASH_BLOCK_SIZE) as usize;
            let digests = handle
                .hasher
                .sealed_blocks()
                .get(first_block..first_block + block_count)
                .ok_or_else(|| {
                    SessionError::Corrupt(format!(
                        "part {part_number} of upload {} is not fully hashed",
                        session.id
                    ))
                })?;
            let row = UploadPartRow {
                upload_id: *session.id.as_uuid(),
                part_number,
                etag: part.etag.clone(),
                size_bytes: part_size as i64,
                block_digests: encode_digests(digests),
                created_at: OffsetDateTime::now_utc(),
            };

            let next = handle.spool.successor(part_size).await?;
            self.metadata.put_part(&row).await?;
            let previous = std::mem::replace(&mut handle.spool, next);
            previous.discard().await;
            handle.parts.push(part);

            PARTS_UPLOADED.inc();
            tracing::debug!(
                upload_id = %session.id,
                part_number,
                base_offset = handle.spool.base_offset(),
                "Uploaded backend part"
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Terminal transitions
    // ------------------------------------------------------------------

    async fn expire_locked(&self, session: &UploadSession) -> SessionResult<()> {
        self.release_backend(session).await?;
        self.finish(session, UploadState::Expired, session.object_key.clone(), None, None)
            .await?;
        tracing::info!(
            upload_id = %session.id,
            offset = session.received_offset,
            idle_since = %session.last_activity_at,
            "Upload session expired"
        );
        Ok(())
    }

    async fn fail_locked(&self, session: &UploadSession, detail: String) -> SessionResult<()> {
        if let Err(e) = self.release_backend(session).await {
            tracing::warn!(upload_id = %session.id, error = %e, "Failed to abort multipart upload of failed session");
        }
        self.finish(
            session,
            UploadState::Failed,
            session.object_key.clone(),
            None,
            Some(detail),
        )
        .await?;
        Ok(())
    }

    /// Abort the backend multipart upload. An unknown upload counts as released.
    async fn release_backend(&self, session: &UploadSession) -> SessionResult<()> {
        let Some(backend_upload_id) = session.backend_upload_id.as_deref() else {
            return Ok(());
        };
        match self
            .storage
            .abort_multipart_upload(&session.object_key, backend_upload_id)
            .await
        {
            Ok(()) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into_session_error(session.received_offset)),
        }
    }

    /// Move a session into a terminal state and drop everything it held.
    async fn finish(
        &self,
        session: &UploadSession,
        state: UploadState,
        object_key: String,
        content_hash: Option<String>,
        error_detail: Option<String>,
    ) -> SessionResult<UploadSession> {
        session
            .state
            .transition(state)
            .map_err(|e| SessionError::Corrupt(e.to_string()))?;
        let from: Vec<&str> = UploadState::sources(state)
            .into_iter()
            .map(|source| source.as_str())
            .collect();

        let finished_at = OffsetDateTime::now_utc();
        let finish = SessionFinish {
            state,
            object_key,
            content_hash,
            error_detail,
            finished_at,
        };
        if !self
            .metadata
            .finish_session(*session.id.as_uuid(), &from, &finish)
            .await?
        {
            return Err(self.conflict(session.id).await);
        }

        metrics::record_session_finished(state.as_str());
        self.release_local(&session.id).await;

        let mut done = session.clone();
        done.state = state;
        done.object_key = finish.object_key;
        done.error_detail = finish.error_detail;
        done.finished_at = Some(finished_at);
        if let Some(hash) = finish.content_hash.as_deref() {
            done.content_hash = ferry_core::ContentHash::from_hex(hash).ok();
        }
        Ok(done)
    }

    async fn release_local(&self, id: &UploadId) {
        self.admission.release(id);
        spool::remove_session_dir(&self.settings.spool_dir, id).await;
        if let Err(e) = self.metadata.delete_parts(*id.as_uuid()).await {
            tracing::warn!(upload_id = %id, error = %e, "Failed to delete part records");
        }
        self.slots.remove(id);
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn slot(&self, id: UploadId) -> Slot {
        self.slots
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Drop a slot taken for a session found finished under its lock.
    fn forget_slot(&self, id: UploadId, slot: &Slot) {
        self.slots.remove_if(&id, |_, current| Arc::ptr_eq(current, slot));
    }

    fn check_writable(session: &UploadSession) -> SessionResult<()> {
        match session.state {
            state if state.is_gone() => Err(SessionError::Gone { state }),
            UploadState::Completed | UploadState::Duplicate => Err(SessionError::NotWritable {
                state: session.state,
                offset: session.received_offset,
            }),
            _ => Ok(()),
        }
    }

    async fn load(&self, id: UploadId) -> SessionResult<UploadSession> {
        let row = self
            .metadata
            .get_session(*id.as_uuid())
            .await?
            .ok_or(SessionError::NotFound(id))?;
        Ok(row.into_session()?)
    }

    /// Explain a failed compare-and-set by re-reading the session.
    async fn conflict(&self, id: UploadId) -> SessionError {
        match self.load(id).await {
            Ok(session) if session.state.is_gone() => SessionError::Gone {
                state: session.state,
            },
            Ok(session) if !session.state.is_active() => SessionError::NotWritable {
                state: session.state,
                offset: session.received_offset,
            },
            Ok(session) => SessionError::OffsetMismatch {
                current: session.received_offset,
            },
            Err(e) => e,
        }
    }
}

trait IntoSessionError {
    fn into_session_error(self, offset: u64) -> SessionError;
}

impl IntoSessionError for StorageError {
    fn into_session_error(self, offset: u64) -> SessionError {
        if self.is_retryable() {
            SessionError::Backend {
                offset,
                source: self,
            }
        } else {
            SessionError::Storage(self)
        }
    }
}
