//! Lifecycle metadata for one uploaded object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A persisted image row.
///
/// The blob itself lives in the object store at
/// `(storage_bucket, storage_object_key)`; this struct only describes it.
/// A row whose `expires_at` has passed is logically deleted even while it
/// still physically exists.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ImageRecord {
    /// Store-assigned key. Never exposed outside the service.
    #[serde(skip_serializing)]
    pub id: i64,

    /// Externally visible identifier, generated at upload time.
    pub unique_link_id: Uuid,

    /// File name as supplied by the uploader.
    pub original_file_name: String,

    /// Bucket holding the blob.
    pub storage_bucket: String,

    /// Object key of the blob, derived from `unique_link_id` + extension.
    pub storage_object_key: String,

    pub uploaded_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,
}

impl ImageRecord {
    /// True once `now` is past the expiration instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// An image row that has not been inserted yet.
#[derive(Clone, Debug)]
pub struct NewImage {
    pub unique_link_id: Uuid,
    pub original_file_name: String,
    pub storage_bucket: String,
    pub storage_object_key: String,
    pub uploaded_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Build the object key for an upload: the link id followed by the original
/// extension (lowercased), e.g. `3f2c...-9a.png`.
pub fn object_key_for(unique_link_id: Uuid, original_file_name: &str) -> String {
    match file_extension(original_file_name) {
        Some(ext) => format!("{}.{}", unique_link_id, ext.to_ascii_lowercase()),
        None => unique_link_id.to_string(),
    }
}

/// Extension of the final path segment without the leading dot.
pub fn file_extension(file_name: &str) -> Option<&str> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    match base.rfind('.') {
        Some(0) | None => None,
        Some(pos) if pos + 1 < base.len() => Some(&base[pos + 1..]),
        Some(_) => None,
    }
}
