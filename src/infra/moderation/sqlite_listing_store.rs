// SQLite-backed listing repository.
//
// Tables:
// - listings: listing fields plus status / moderated_at / moderation_reason
// - listing_images: photo URLs owned by a listing

use crate::core::moderation::{
    Listing, ListingImage, ListingRepository, ListingStatus, ModerationError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::path::Path;

/// A listing as submitted by a user, before it gets an id.
#[derive(Debug, Clone, Deserialize)]
pub struct NewListing {
    pub title: String,
    pub description: String,
    pub rent: f64,
    pub room_type: String,
    pub slots_available: u32,
    pub contact: String,
    #[serde(default)]
    pub facebook_profile: Option<String>,
    #[serde(default)]
    pub formatted_address: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

pub struct SqliteListingStore {
    pool: Pool<Sqlite>,
}

fn storage_error(e: sqlx::Error) -> ModerationError {
    ModerationError::StorageError(e.to_string())
}

impl SqliteListingStore {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Ensure the file exists if it's a file path
        let path_str = database_url.trim_start_matches("sqlite://");
        if !database_url.contains(":memory:") && !Path::new(path_str).exists() {
            if let Some(parent) = Path::new(path_str).parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::File::create(path_str)?;
        }

        let conn_str = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite://{}", database_url)
        };

        let pool = SqlitePoolOptions::new().connect(&conn_str).await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                rent REAL NOT NULL,
                room_type TEXT NOT NULL,
                slots_available INTEGER NOT NULL DEFAULT 1,
                contact TEXT NOT NULL,
                facebook_profile TEXT,
                formatted_address TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING'
                    CHECK (status IN ('PENDING', 'APPROVED', 'REJECTED')),
                moderated_at TEXT,
                moderation_reason TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listing_images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                listing_id INTEGER NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
                url TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_listing_images_listing ON listing_images(listing_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a new listing in PENDING state and return its id.
    pub async fn create_listing(&self, listing: &NewListing) -> Result<i64, ModerationError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        let result = sqlx::query(
            r#"
            INSERT INTO listings (
                title, description, rent, room_type, slots_available,
                contact, facebook_profile, formatted_address, status, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', ?)
            "#,
        )
        .bind(&listing.title)
        .bind(&listing.description)
        .bind(listing.rent)
        .bind(&listing.room_type)
        .bind(listing.slots_available as i64)
        .bind(&listing.contact)
        .bind(&listing.facebook_profile)
        .bind(&listing.formatted_address)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(storage_error)?;

        let listing_id = result.last_insert_rowid();

        for url in &listing.image_urls {
            sqlx::query("INSERT INTO listing_images (listing_id, url) VALUES (?, ?)")
                .bind(listing_id)
                .bind(url)
                .execute(&mut *tx)
                .await
                .map_err(storage_error)?;
        }

        tx.commit().await.map_err(storage_error)?;
        Ok(listing_id)
    }

    /// Admin override: put a listing back to PENDING and clear the last result.
    pub async fn reset_to_pending(&self, listing_id: i64) -> Result<bool, ModerationError> {
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET status = 'PENDING', moderated_at = NULL, moderation_reason = NULL
            WHERE id = ?
            "#,
        )
        .bind(listing_id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(result.rows_affected() > 0)
    }

    fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
        value
            .as_deref()
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn map_listing(row: &SqliteRow, images: Vec<ListingImage>) -> Result<Listing, ModerationError> {
        let status_str: String = row.get("status");
        let status = ListingStatus::parse(&status_str).ok_or_else(|| {
            ModerationError::StorageError(format!("unknown listing status {:?}", status_str))
        })?;

        Ok(Listing {
            id: row.get("id"),
            title: row.get("title"),
            description: row.get("description"),
            rent: row.get("rent"),
            room_type: row.get("room_type"),
            slots_available: row.get::<i64, _>("slots_available").max(0) as u32,
            contact: row.get("contact"),
            facebook_profile: row.get("facebook_profile"),
            formatted_address: row.get("formatted_address"),
            images,
            status,
            moderated_at: Self::parse_timestamp(row.get("moderated_at")),
            moderation_reason: row.get("moderation_reason"),
        })
    }
}

#[async_trait]
impl ListingRepository for SqliteListingStore {
    async fn get_listing_with_images_and_address(
        &self,
        listing_id: i64,
    ) -> Result<Option<Listing>, ModerationError> {
        let row = sqlx::query("SELECT * FROM listings WHERE id = ?")
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let image_rows =
            sqlx::query("SELECT id, url FROM listing_images WHERE listing_id = ? ORDER BY id")
                .bind(listing_id)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_error)?;

        let images = image_rows
            .iter()
            .map(|r| ListingImage {
                id: r.get("id"),
                url: r.get("url"),
            })
            .collect();

        Self::map_listing(&row, images).map(Some)
    }

    async fn update_moderation_result(
        &self,
        listing_id: i64,
        status: ListingStatus,
        moderated_at: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<bool, ModerationError> {
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET status = ?, moderated_at = ?, moderation_reason = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(moderated_at.to_rfc3339())
        .bind(reason)
        .bind(listing_id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_unmoderated_ids(&self, limit: u32) -> Result<Vec<i64>, ModerationError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM listings
            WHERE status = 'PENDING' AND moderated_at IS NULL
            ORDER BY created_at, id
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows.iter().map(|r| r.get::<i64, _>("id")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn temp_store() -> SqliteListingStore {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_owned();
        drop(tmp);
        SqliteListingStore::new(path.to_str().unwrap()).await.unwrap()
    }

    fn new_listing(image_urls: Vec<&str>) -> NewListing {
        NewListing {
            title: "Room near campus".to_string(),
            description: "Furnished, wifi included".to_string(),
            rent: 4500.0,
            room_type: "Private room".to_string(),
            slots_available: 2,
            contact: "0917 555 0101".to_string(),
            facebook_profile: None,
            formatted_address: Some("12 Katipunan Ave, Quezon City".to_string()),
            image_urls: image_urls.into_iter().map(str::to_string).collect(),
        }
    }

    #[tokio::test]
    async fn test_create_and_load_listing() {
        let store = temp_store().await;
        let id = store
            .create_listing(&new_listing(vec![
                "https://rooms.s3.amazonaws.com/l/1.jpg",
                "https://rooms.s3.amazonaws.com/l/2.jpg",
            ]))
            .await
            .unwrap();

        let listing = store
            .get_listing_with_images_and_address(id)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(listing.title, "Room near campus");
        assert_eq!(listing.slots_available, 2);
        assert_eq!(listing.status, ListingStatus::Pending);
        assert_eq!(listing.moderated_at, None);
        assert_eq!(listing.images.len(), 2);
        assert_eq!(listing.images[0].url, "https://rooms.s3.amazonaws.com/l/1.jpg");
        assert_eq!(
            listing.formatted_address.as_deref(),
            Some("12 Katipunan Ave, Quezon City")
        );
    }

    #[tokio::test]
    async fn test_missing_listing_is_none() {
        let store = temp_store().await;
        assert!(store
            .get_listing_with_images_and_address(404)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_moderation_result() {
        let store = temp_store().await;
        let id = store.create_listing(&new_listing(vec![])).await.unwrap();

        let written = store
            .update_moderation_result(
                id,
                ListingStatus::Rejected,
                Utc::now(),
                Some("Scam".to_string()),
            )
            .await
            .unwrap();
        assert!(written);

        let listing = store
            .get_listing_with_images_and_address(id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listing.status, ListingStatus::Rejected);
        assert_eq!(listing.moderation_reason.as_deref(), Some("Scam"));
        assert!(listing.moderated_at.is_some());

        // No row, nothing written
        let written = store
            .update_moderation_result(999, ListingStatus::Approved, Utc::now(), None)
            .await
            .unwrap();
        assert!(!written);
    }

    #[tokio::test]
    async fn test_reset_and_unmoderated_sweep() {
        let store = temp_store().await;
        let first = store.create_listing(&new_listing(vec![])).await.unwrap();
        let second = store.create_listing(&new_listing(vec![])).await.unwrap();

        store
            .update_moderation_result(first, ListingStatus::Approved, Utc::now(), None)
            .await
            .unwrap();
        assert_eq!(store.list_unmoderated_ids(10).await.unwrap(), vec![second]);

        assert!(store.reset_to_pending(first).await.unwrap());
        let listing = store
            .get_listing_with_images_and_address(first)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listing.status, ListingStatus::Pending);
        assert_eq!(listing.moderation_reason, None);

        assert_eq!(
            store.list_unmoderated_ids(10).await.unwrap(),
            vec![first, second]
        );
        assert_eq!(store.list_unmoderated_ids(1).await.unwrap(), vec![first]);
    }
}
