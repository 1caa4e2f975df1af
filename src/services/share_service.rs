//! src/services/share_service.rs
//!
//! ShareService coordinates the metadata store (SQLite) and the object store
//! for every upload, read and delete. There is no distributed transaction
//! between the two stores, so consistency comes from ordering:
//!
//! - upload writes the blob first, then commits image row + short link in one
//!   metadata transaction; if anything after the blob write fails, the blob is
//!   removed again (compensating delete).
//! - delete removes the blob inside an open metadata transaction, then deletes
//!   the row and commits. A blob that is already gone counts as deleted.
//! - `reconcile` sweeps up whatever the two paths above could still leave
//!   behind after a crash or a failed compensation.

use crate::{
    models::{
        image::{ImageRecord, NewImage, object_key_for},
        short_link::NewShortLink,
        upload::UploadRequest,
    },
    services::{
        clock::{Clock, SystemClock},
        metadata_store::{MetadataStore, is_short_code_conflict},
        object_store::{ObjectReader, ObjectStore, ObjectStoreError},
        short_code::{ShortCodeError, ShortCodeGenerator},
        validation::{self, ValidationError},
    },
};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Metadata transactions retried when the short code loses an insert race.
const MAX_COMMIT_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("validation failed: {}", join_errors(.0))]
    ValidationFailed(Vec<ValidationError>),
    #[error("{0}")]
    NotFoundOrExpired(String),
    #[error("short code space exhausted after {attempts} attempts")]
    CodeSpaceExhausted { attempts: usize },
    #[error("metadata store unavailable: {0}")]
    Metadata(#[from] sqlx::Error),
    #[error("object store unavailable: {0}")]
    ObjectStore(#[from] ObjectStoreError),
}

impl From<ShortCodeError> for ShareError {
    fn from(err: ShortCodeError) -> Self {
        match err {
            ShortCodeError::Exhausted { attempts } => ShareError::CodeSpaceExhausted { attempts },
            ShortCodeError::Metadata(err) => ShareError::Metadata(err),
        }
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type ShareResult<T> = Result<T, ShareError>;

/// Result of a delete. Deleting something that is already gone is not a
/// failure, but callers can still tell the two apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    AlreadyAbsent,
}

/// Per-item result of a batch upload.
#[derive(Debug)]
pub struct UploadOutcome {
    pub file_name: String,
    pub result: ShareResult<String>,
}

/// A live image ready to be streamed back.
pub struct FetchedImage {
    pub record: ImageRecord,
    pub content_type: String,
    pub body: ObjectReader,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub orphaned_blobs_removed: usize,
    pub orphaned_rows_removed: usize,
    pub failures: usize,
}

enum InsertError {
    CodeConflict(String),
    Failed(ShareError),
}

enum CommitAttempt {
    Committed(String),
    CodeConflict(String),
}

#[derive(Clone)]
pub struct ShareService {
    pub metadata: MetadataStore,
    pub objects: Arc<dyn ObjectStore>,
    codes: ShortCodeGenerator,
    clock: Arc<dyn Clock>,
    bucket: String,
}

impl ShareService {
    pub fn new(
        metadata: MetadataStore,
        objects: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            metadata,
            objects,
            codes: ShortCodeGenerator::default(),
            clock: Arc::new(SystemClock),
            bucket: bucket.into(),
        }
    }

    pub fn with_code_generator(mut self, codes: ShortCodeGenerator) -> Self {
        self.codes = codes;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Validate and store a single file. Returns its short code.
    pub async fn upload(&self, request: UploadRequest) -> ShareResult<String> {
        let errors = validation::validate(&request);
        if !errors.is_empty() {
            warn!(file = %request.file_name, "rejected upload: {}", join_errors(&errors));
            return Err(ShareError::ValidationFailed(errors));
        }
        self.store_upload(request).await
    }

    /// Validate every file first, then store each one independently.
    ///
    /// A validation error on any item rejects the whole call before anything
    /// is written. After that each item commits or fails on its own; an
    /// earlier committed item stays committed when a later one fails. A
    /// failing item does not stop the batch: later items are still attempted
    /// and every item gets its own outcome.
    pub async fn upload_batch(&self, requests: Vec<UploadRequest>) -> ShareResult<Vec<UploadOutcome>> {
        if requests.is_empty() {
            return Err(ShareError::ValidationFailed(vec![ValidationError {
                field: "file",
                message: "at least one file is required".into(),
            }]));
        }

        let errors: Vec<ValidationError> = requests.iter().flat_map(validation::validate).collect();
        if !errors.is_empty() {
            warn!(items = requests.len(), "rejected batch upload: {}", join_errors(&errors));
            return Err(ShareError::ValidationFailed(errors));
        }

        info!(items = requests.len(), "all upload items validated");
        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let file_name = request.file_name.clone();
            let result = self.store_upload(request).await;
            if let Err(err) = &result {
                error!(file = %file_name, error = %err, "upload item failed");
            }
            outcomes.push(UploadOutcome { file_name, result });
        }
        Ok(outcomes)
    }

    async fn store_upload(&self, request: UploadRequest) -> ShareResult<String> {
        let unique_link_id = Uuid::new_v4();
        let uploaded_at = self.clock.now();
        let lifetime = Duration::milliseconds((request.duration_minutes * 60_000.0).round() as i64);
        let expires_at = uploaded_at + lifetime;
        let object_key = object_key_for(unique_link_id, &request.file_name);

        self.objects
            .put(&self.bucket, &object_key, request.bytes)
            .await?;

        let image = NewImage {
            unique_link_id,
            original_file_name: request.file_name,
            storage_bucket: self.bucket.clone(),
            storage_object_key: object_key,
            uploaded_at,
            expires_at,
        };

        match self.commit_metadata(&image).await {
            Ok(code) => {
                info!(
                    unique_link_id = %unique_link_id,
                    short_code = %code,
                    expires_at = %expires_at,
                    "image uploaded"
                );
                Ok(code)
            }
            Err(err) => {
                self.compensate_blob(&image.storage_object_key).await;
                Err(err)
            }
        }
    }

    /// Undo a blob write whose metadata never committed.
    async fn compensate_blob(&self, key: &str) {
        match self.objects.delete(&self.bucket, key).await {
            Ok(()) => warn!(bucket = %self.bucket, key, "removed blob after failed metadata commit"),
            Err(err) => error!(
                bucket = %self.bucket,
                key,
                error = %err,
                "compensating delete failed, blob left for reconciliation"
            ),
        }
    }

    async fn commit_metadata(&self, image: &NewImage) -> ShareResult<String> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            match self.try_commit(image).await? {
                CommitAttempt::Committed(code) => return Ok(code),
                CommitAttempt::CodeConflict(code) => warn!(
                    short_code = %code,
                    attempt,
                    "short code taken by a concurrent writer, retrying transaction"
                ),
            }
        }
        error!(
            attempts = MAX_COMMIT_ATTEMPTS,
            "short code conflicted on every metadata transaction"
        );
        Err(ShareError::CodeSpaceExhausted {
            attempts: MAX_COMMIT_ATTEMPTS,
        })
    }

    async fn try_commit(&self, image: &NewImage) -> ShareResult<CommitAttempt> {
        let mut tx = self.metadata.begin().await?;
        let code = match self.insert_rows(&mut tx, image).await {
            Ok(code) => code,
            Err(err) => {
                rollback(tx).await;
                return match err {
                    InsertError::CodeConflict(code) => Ok(CommitAttempt::CodeConflict(code)),
                    InsertError::Failed(err) => Err(err),
                };
            }
        };
        tx.commit().await?;
        Ok(CommitAttempt::Committed(code))
    }

    async fn insert_rows(
        &self,
        conn: &mut SqliteConnection,
        image: &NewImage,
    ) -> Result<String, InsertError> {
        MetadataStore::insert_image(&mut *conn, image)
            .await
            .map_err(|err| InsertError::Failed(err.into()))?;

        let code = match self.codes.generate(&mut *conn).await {
            Ok(code) => code,
            Err(err) => {
                if let ShortCodeError::Exhausted { attempts } = &err {
                    error!(attempts, "short code generation exhausted its attempts");
                }
                return Err(InsertError::Failed(err.into()));
            }
        };

        let link = NewShortLink {
            short_code: code.clone(),
            image_unique_link_id: image.unique_link_id,
            created_at: self.clock.now(),
            expires_at: image.expires_at,
        };
        match MetadataStore::insert_short_link(&mut *conn, &link).await {
            Ok(_) => Ok(code),
            Err(err) if is_short_code_conflict(&err) => Err(InsertError::CodeConflict(code)),
            Err(err) => Err(InsertError::Failed(err.into())),
        }
    }

    /// Map a short code to the image it points at.
    ///
    /// Expired links and links whose image has expired are reported as not
    /// found even if the rows still exist.
    pub async fn resolve_short_link(&self, code: &str) -> ShareResult<Uuid> {
        let now = self.clock.now();
        let link = self
            .metadata
            .find_short_link(code)
            .await?
            .filter(|link| link.expires_at >= now)
            .ok_or_else(|| {
                ShareError::NotFoundOrExpired(format!("short link `{}` not found or expired", code))
            })?;
        let image = self.live_image(link.image_unique_link_id, now).await?;
        Ok(image.unique_link_id)
    }

    /// Open a live image for reading.
    pub async fn fetch_image(&self, unique_link_id: Uuid) -> ShareResult<FetchedImage> {
        let record = self.live_image(unique_link_id, self.clock.now()).await?;
        let body = match self
            .objects
            .get(&record.storage_bucket, &record.storage_object_key)
            .await
        {
            Ok(body) => body,
            Err(ObjectStoreError::NotFound { bucket, key }) => {
                warn!(
                    unique_link_id = %unique_link_id,
                    %bucket,
                    %key,
                    "image row has no blob, leaving it for reconciliation"
                );
                return Err(ShareError::NotFoundOrExpired(format!(
                    "image `{}` not found",
                    unique_link_id
                )));
            }
            Err(err) => return Err(err.into()),
        };

        Ok(FetchedImage {
            content_type: content_type_for(&record.original_file_name),
            record,
            body,
        })
    }

    async fn live_image(&self, unique_link_id: Uuid, now: DateTime<Utc>) -> ShareResult<ImageRecord> {
        match self.metadata.find_image(unique_link_id).await? {
            Some(record) if !record.is_expired_at(now) => Ok(record),
            Some(_) => Err(ShareError::NotFoundOrExpired(format!(
                "image `{}` has expired",
                unique_link_id
            ))),
            None => Err(ShareError::NotFoundOrExpired(format!(
                "image `{}` not found",
                unique_link_id
            ))),
        }
    }

    /// Delete an image, its short link and its blob.
    ///
    /// This is the only deletion routine: interactive deletes, the expiry
    /// reaper and reconciliation all end up here. An identifier that is
    /// already gone yields `AlreadyAbsent`.
    pub async fn delete_image(&self, unique_link_id: Uuid) -> ShareResult<DeleteOutcome> {
        match self.metadata.find_image(unique_link_id).await? {
            Some(record) => self.delete_record(&record).await,
            None => {
                debug!(unique_link_id = %unique_link_id, "delete requested for absent image");
                Ok(DeleteOutcome::AlreadyAbsent)
            }
        }
    }

    async fn delete_record(&self, record: &ImageRecord) -> ShareResult<DeleteOutcome> {
        let mut tx = self.metadata.begin().await?;

        if let Err(err) = self
            .objects
            .delete(&record.storage_bucket, &record.storage_object_key)
            .await
        {
            rollback(tx).await;
            error!(
                unique_link_id = %record.unique_link_id,
                key = %record.storage_object_key,
                error = %err,
                "failed to remove blob"
            );
            return Err(err.into());
        }

        let removed = match MetadataStore::delete_image(&mut tx, record.unique_link_id).await {
            Ok(removed) => removed,
            Err(err) => {
                rollback(tx).await;
                error!(
                    unique_link_id = %record.unique_link_id,
                    error = %err,
                    "failed to remove image metadata"
                );
                return Err(err.into());
            }
        };
        tx.commit().await?;

        if removed {
            info!(unique_link_id = %record.unique_link_id, "image deleted");
            Ok(DeleteOutcome::Deleted)
        } else {
            debug!(unique_link_id = %record.unique_link_id, "image removed concurrently");
            Ok(DeleteOutcome::AlreadyAbsent)
        }
    }

    /// Find blobs without rows and rows without blobs, and remove them.
    ///
    /// Only entries older than `grace` are touched, so uploads and deletes
    /// that are still in flight are left alone.
    pub async fn reconcile(&self, grace: Duration) -> ShareResult<ReconcileReport> {
        let cutoff = self.clock.now() - grace;
        let blobs = self.objects.list(&self.bucket).await?;
        let rows = self.metadata.list_images(&self.bucket).await?;

        let row_keys: HashSet<&str> = rows.iter().map(|r| r.storage_object_key.as_str()).collect();
        let blob_keys: HashSet<&str> = blobs.iter().map(|b| b.key.as_str()).collect();
        let mut report = ReconcileReport::default();

        for blob in &blobs {
            if row_keys.contains(blob.key.as_str()) || blob.last_modified > cutoff {
                continue;
            }
            match self.objects.delete(&self.bucket, &blob.key).await {
                Ok(()) => {
                    warn!(bucket = %self.bucket, key = %blob.key, "removed orphaned blob");
                    report.orphaned_blobs_removed += 1;
                }
                Err(err) => {
                    error!(key = %blob.key, error = %err, "failed to remove orphaned blob");
                    report.failures += 1;
                }
            }
        }

        for row in &rows {
            if blob_keys.contains(row.storage_object_key.as_str()) || row.uploaded_at > cutoff {
                continue;
            }
            match self.delete_record(row).await {
                Ok(_) => {
                    warn!(unique_link_id = %row.unique_link_id, "removed image row without blob");
                    report.orphaned_rows_removed += 1;
                }
                Err(err) => {
                    error!(
                        unique_link_id = %row.unique_link_id,
                        error = %err,
                        "failed to remove image row without blob"
                    );
                    report.failures += 1;
                }
            }
        }

        Ok(report)
    }
}

async fn rollback(tx: Transaction<'static, Sqlite>) {
    if let Err(err) = tx.rollback().await {
        warn!(error = %err, "metadata rollback failed");
    }
}

/// MIME type for a file name, `application/octet-stream` when unknown.
pub fn content_type_for(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
