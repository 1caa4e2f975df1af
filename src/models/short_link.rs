//! Human-shareable alias for exactly one image.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A persisted short-link row.
///
/// `short_code` is unique among all rows, expired or not. The link is removed
/// by cascade when its image row is deleted.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ShortLinkRecord {
    #[serde(skip_serializing)]
    pub id: i64,

    pub short_code: String,

    /// References `images.unique_link_id`.
    pub image_unique_link_id: Uuid,

    pub created_at: DateTime<Utc>,

    /// Copied from the image at creation time.
    pub expires_at: DateTime<Utc>,
}

/// A short-link row that has not been inserted yet.
#[derive(Clone, Debug)]
pub struct NewShortLink {
    pub short_code: String,
    pub image_unique_link_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
