//! src/services/metadata_store.rs
//!
//! SQLite-backed metadata tables for images and short links.
//!
//! Pool-level methods take `&self`; statements that must run inside the
//! orchestrator's transaction are associated functions taking the
//! transaction's connection (`&mut *tx`).

use crate::models::{
    image::{ImageRecord, NewImage},
    short_link::{NewShortLink, ShortLinkRecord},
};
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

const IMAGE_COLUMNS: &str = "id, unique_link_id, original_file_name, storage_bucket, \
                             storage_object_key, uploaded_at, expires_at";

const SHORT_LINK_COLUMNS: &str = "id, short_code, image_unique_link_id, created_at, expires_at";

#[derive(Clone)]
pub struct MetadataStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl MetadataStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Every statement is idempotent, so this is
    /// safe to run on each startup. Returns the number of statements run.
    pub async fn migrate(&self) -> Result<usize, sqlx::Error> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(statements.len())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.db.begin().await
    }

    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await
            .map(|_| ())
    }

    pub async fn insert_image(
        conn: &mut SqliteConnection,
        image: &NewImage,
    ) -> Result<ImageRecord, sqlx::Error> {
        sqlx::query_as::<_, ImageRecord>(&format!(
            "INSERT INTO images (
                unique_link_id, original_file_name, storage_bucket,
                storage_object_key, uploaded_at, expires_at
             ) VALUES (?, ?, ?, ?, ?, ?)
             RETURNING {IMAGE_COLUMNS}"
        ))
        .bind(image.unique_link_id)
        .bind(&image.original_file_name)
        .bind(&image.storage_bucket)
        .bind(&image.storage_object_key)
        .bind(image.uploaded_at)
        .bind(image.expires_at)
        .fetch_one(&mut *conn)
        .await
    }

    pub async fn insert_short_link(
        conn: &mut SqliteConnection,
        link: &NewShortLink,
    ) -> Result<ShortLinkRecord, sqlx::Error> {
        sqlx::query_as::<_, ShortLinkRecord>(&format!(
            "INSERT INTO short_links (short_code, image_unique_link_id, created_at, expires_at)
             VALUES (?, ?, ?, ?)
             RETURNING {SHORT_LINK_COLUMNS}"
        ))
        .bind(&link.short_code)
        .bind(link.image_unique_link_id)
        .bind(link.created_at)
        .bind(link.expires_at)
        .fetch_one(&mut *conn)
        .await
    }

    /// Whether any row, expired or not, already holds `code`.
    pub async fn short_code_exists(
        conn: &mut SqliteConnection,
        code: &str,
    ) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT EXISTS(SELECT 1 FROM short_links WHERE short_code = ?)")
            .bind(code)
            .fetch_one(&mut *conn)
            .await
            .map(|found| found != 0)
    }

    /// Remove an image row; its short link goes with it by cascade.
    /// Returns false when no row matched.
    pub async fn delete_image(
        conn: &mut SqliteConnection,
        unique_link_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM images WHERE unique_link_id = ?")
            .bind(unique_link_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fetch an image row regardless of expiry.
    pub async fn find_image(&self, unique_link_id: Uuid) -> Result<Option<ImageRecord>, sqlx::Error> {
        sqlx::query_as::<_, ImageRecord>(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE unique_link_id = ?"
        ))
        .bind(unique_link_id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Fetch a short-link row regardless of expiry.
    pub async fn find_short_link(&self, code: &str) -> Result<Option<ShortLinkRecord>, sqlx::Error> {
        sqlx::query_as::<_, ShortLinkRecord>(&format!(
            "SELECT {SHORT_LINK_COLUMNS} FROM short_links WHERE short_code = ?"
        ))
        .bind(code)
        .fetch_optional(&*self.db)
        .await
    }

    /// Image rows whose expiration is strictly before `now`, oldest first.
    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<ImageRecord>, sqlx::Error> {
        sqlx::query_as::<_, ImageRecord>(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE expires_at < ? ORDER BY expires_at ASC"
        ))
        .bind(now)
        .fetch_all(&*self.db)
        .await
    }

    /// Every image row stored for `bucket`.
    pub async fn list_images(&self, bucket: &str) -> Result<Vec<ImageRecord>, sqlx::Error> {
        sqlx::query_as::<_, ImageRecord>(&format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE storage_bucket = ? ORDER BY id ASC"
        ))
        .bind(bucket)
        .fetch_all(&*self.db)
        .await
    }
}

#[cfg(test)]
impl MetadataStore {
    pub async fn count_images(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM images")
            .fetch_one(&*self.db)
            .await
    }

    pub async fn count_short_links(&self) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM short_links")
            .fetch_one(&*self.db)
            .await
    }
}

/// True if the error is a unique-constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// True if the error is a unique violation on `short_links.short_code`.
pub fn is_short_code_conflict(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if is_unique_violation(err) && db_err.message().contains("short_links.short_code")
    )
}
