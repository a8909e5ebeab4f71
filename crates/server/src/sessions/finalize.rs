//! Finalization: fingerprint, dedup lookup, commit or short-circuit.

use super::spool::Spool;
use super::{SessionError, SessionHandle, SessionManager, SessionResult};
use crate::metrics::{self, BYTES_DEDUPLICATED, FINALIZE_DURATION, PARTS_UPLOADED};
use ferry_core::{ContentHash, FileOutcome, UploadSession, UploadState};
use ferry_metadata::models::DedupRecordRow;
use ferry_storage::{CompletedPart, StorageError};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::Mutex;

impl SessionManager {
    /// Finalize a session in `finalizing`. The caller holds the session lock.
    ///
    /// `recovering` is set when a previous process may already have committed
    /// the backend upload before it stopped.
    pub(super) async fn finalize_locked(
        &self,
        slot: &mut Option<SessionHandle>,
        session: &UploadSession,
        recovering: bool,
    ) -> SessionResult<UploadSession> {
        let started = Instant::now();
        let result = self.try_finalize(slot, session, recovering).await;
        FINALIZE_DURATION.observe(started.elapsed().as_secs_f64());
        *slot = None;

        match result {
            Ok(done) => {
                let outcome = match done.state {
                    UploadState::Duplicate => {
                        FileOutcome::duplicate(&done.filename, &done.object_key)
                    }
                    _ => FileOutcome::completed(&done.filename, &done.object_key),
                };
                self.notifications.record_completion(outcome);
                Ok(done)
            }
            Err(e) => {
                let detail = e.to_string();
                metrics::record_upload_error("finalize_failed");
                tracing::error!(upload_id = %session.id, error = %detail, "Finalization failed");

                self.fail_locked(session, detail.clone()).await?;
                self.notifications
                    .record_completion(FileOutcome::failed(&session.filename, detail.clone()));
                Err(SessionError::FinalizeFailed {
                    offset: session.received_offset,
                    detail,
                })
            }
        }
    }

    async fn try_finalize(
        &self,
        slot: &mut Option<SessionHandle>,
        session: &UploadSession,
        recovering: bool,
    ) -> SessionResult<UploadSession> {
        self.ensure_handle(slot, session).await?;
        let SessionHandle {
            backend_upload_id,
            mut spool,
            hasher,
            mut parts,
        } = slot
            .take()
            .ok_or_else(|| SessionError::Corrupt(format!("no handle for upload {}", session.id)))?;

        if hasher.bytes_hashed() != session.declared_size {
            return Err(SessionError::Corrupt(format!(
                "hashed {} of {} bytes for upload {}",
                hasher.bytes_hashed(),
                session.declared_size,
                session.id
            )));
        }
        let hash = hasher.finalize();
        let hash_hex = hash.to_hex();

        // Sessions with the same content finalize one at a time in this process;
        // the dedup insert below settles races between processes.
        let lock = self
            .hash_locks
            .entry(hash_hex.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;
        let result = self
            .settle(session, &backend_upload_id, &mut spool, &mut parts, hash, recovering)
            .await;
        drop(guard);
        drop(lock);
        self.hash_locks
            .remove_if(&hash_hex, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn settle(
        &self,
        session: &UploadSession,
        backend_upload_id: &str,
        spool: &mut Spool,
        parts: &mut Vec<CompletedPart>,
        hash: ContentHash,
        recovering: bool,
    ) -> SessionResult<UploadSession> {
        let hash_hex = hash.to_hex();

        if let Some(existing) = self.metadata.get_dedup_record(&hash_hex).await? {
            if let Err(e) = self
                .storage
                .abort_multipart_upload(&session.object_key, backend_upload_id)
                .await
                && !matches!(e, StorageError::NotFound(_))
            {
                tracing::warn!(upload_id = %session.id, error = %e, "Failed to abort multipart upload of duplicate");
            }
            return self
                .finish_duplicate(session, existing.object_key, hash_hex)
                .await;
        }

        self.commit(session, backend_upload_id, spool, parts, recovering)
            .await?;

        let record = self
            .metadata
            .insert_dedup_if_absent(&DedupRecordRow {
                content_hash: hash_hex.clone(),
                object_key: session.object_key.clone(),
                size_bytes: session.declared_size as i64,
                first_upload_id: *session.id.as_uuid(),
                first_seen_at: OffsetDateTime::now_utc(),
            })
            .await?;

        if record.first_upload_id != *session.id.as_uuid() {
            // Another process stored the same content first; ours is redundant.
            if let Err(e) = self.storage.delete(&session.object_key).await
                && !matches!(e, StorageError::NotFound(_))
            {
                tracing::warn!(upload_id = %session.id, error = %e, "Failed to delete redundant object");
            }
            return self
                .finish_duplicate(session, record.object_key, hash_hex)
                .await;
        }

        let done = self
            .finish(
                session,
                UploadState::Completed,
                session.object_key.clone(),
                Some(hash_hex),
                None,
            )
            .await?;
        tracing::info!(
            upload_id = %session.id,
            object_key = %done.object_key,
            size = session.declared_size,
            content_hash = %hash,
            "Upload completed"
        );
        Ok(done)
    }

    async fn finish_duplicate(
        &self,
        session: &UploadSession,
        existing_key: String,
        hash_hex: String,
    ) -> SessionResult<UploadSession> {
        let done = self
            .finish(
                session,
                UploadState::Duplicate,
                existing_key,
                Some(hash_hex),
                None,
            )
            .await?;
        BYTES_DEDUPLICATED.inc_by(session.declared_size);
        tracing::info!(
            upload_id = %session.id,
            object_key = %done.object_key,
            size = session.declared_size,
            "Upload matched stored content"
        );
        Ok(done)
    }

    /// Upload the final part and complete the backend multipart upload.
    async fn commit(
        &self,
        session: &UploadSession,
        backend_upload_id: &str,
        spool: &mut Spool,
        parts: &mut Vec<CompletedPart>,
        recovering: bool,
    ) -> SessionResult<()> {
        if recovering && self.storage.exists(&session.object_key).await? {
            tracing::info!(upload_id = %session.id, "Backend upload was already committed");
            return Ok(());
        }

        if !spool.is_empty() {
            let part_number = parts.len() as i32 + 1;
            let data = spool.read_all().await?;
            let part = self
                .storage
                .upload_part(&session.object_key, backend_upload_id, part_number, data)
                .await?;
            parts.push(part);
            PARTS_UPLOADED.inc();
        }

        match self
            .storage
            .complete_multipart_upload(&session.object_key, backend_upload_id, parts)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // A completion whose response was lost leaves the object in place.
                if matches!(self.storage.exists(&session.object_key).await, Ok(true)) {
                    tracing::warn!(
                        upload_id = %session.id,
                        error = %e,
                        "Complete failed but the object exists; treating as committed"
                    );
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }
}
