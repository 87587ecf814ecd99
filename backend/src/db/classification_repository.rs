use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;

use shared::DeliveryStatus;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One delivery's persisted classification state, including its registered
/// photo list.
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationRecord {
    pub delivery_code: String,
    pub status: DeliveryStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub elapsed_seconds: Option<f64>,
    pub total_detected: Option<i64>,
    pub category_totals: Option<Value>,
    pub summary: Option<Value>,
    pub photos: Vec<String>,
}

/// Partial update for a delivery row. Fields left `None` are omitted from
/// the write entirely, so a partial outcome never clobbers good data with
/// NULLs.
#[derive(Debug, Default, Clone)]
pub struct ClassificationUpdate {
    pub status: Option<DeliveryStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<f64>,
    pub total_detected: Option<i64>,
    pub category_totals_json: Option<String>,
    pub summary_json: Option<String>,
}

impl ClassificationUpdate {
    fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.started_at.is_none()
            && self.completed_at.is_none()
            && self.elapsed_seconds.is_none()
            && self.total_detected.is_none()
            && self.category_totals_json.is_none()
            && self.summary_json.is_none()
    }
}

#[derive(Clone)]
pub struct ClassificationRepository {
    pool: SqlitePool,
}

impl ClassificationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn timestamp(value: &DateTime<Utc>) -> String {
        value.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    /// Creates the delivery row as `pending` if it does not exist yet.
    pub async fn ensure_delivery(&self, delivery_code: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO classifications (delivery_code, status, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(delivery_code) DO NOTHING
            "#,
        )
        .bind(delivery_code)
        .bind(DeliveryStatus::Pending.to_string())
        .bind(Self::timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Writes every provided field in one transactional call. Readers see
    /// either the fully-old or fully-new set of fields, never a mix.
    pub async fn store_classification(
        &self,
        delivery_code: &str,
        update: ClassificationUpdate,
    ) -> Result<(), RepositoryError> {
        if update.is_empty() {
            log::info!("no new classification data for delivery {delivery_code}");
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO classifications (delivery_code, status, created_at)
            VALUES (?1, 'pending', ?2)
            ON CONFLICT(delivery_code) DO NOTHING
            "#,
        )
        .bind(delivery_code)
        .bind(Self::timestamp(&Utc::now()))
        .execute(&mut *tx)
        .await?;

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE classifications SET ");
        let mut fields = builder.separated(", ");
        if let Some(status) = update.status {
            fields.push("status = ");
            fields.push_bind_unseparated(status.to_string());
        }
        if let Some(started_at) = update.started_at {
            fields.push("started_at = ");
            fields.push_bind_unseparated(Self::timestamp(&started_at));
        }
        if let Some(completed_at) = update.completed_at {
            fields.push("completed_at = ");
            fields.push_bind_unseparated(Self::timestamp(&completed_at));
        }
        if let Some(elapsed) = update.elapsed_seconds {
            fields.push("elapsed_seconds = ");
            fields.push_bind_unseparated(elapsed);
        }
        if let Some(total) = update.total_detected {
            fields.push("total_detected = ");
            fields.push_bind_unseparated(total);
        }
        if let Some(category_totals) = update.category_totals_json {
            fields.push("category_totals_json = ");
            fields.push_bind_unseparated(category_totals);
        }
        if let Some(summary) = update.summary_json {
            fields.push("summary_json = ");
            fields.push_bind_unseparated(summary);
        }
        builder.push(" WHERE delivery_code = ");
        builder.push_bind(delivery_code);
        builder.build().execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn read_classification(
        &self,
        delivery_code: &str,
    ) -> Result<Option<ClassificationRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT delivery_code, status, created_at, started_at, completed_at,
                   elapsed_seconds, total_detected, category_totals_json, summary_json
            FROM classifications
            WHERE delivery_code = ?1
            "#,
        )
        .bind(delivery_code)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status_text: String = row.get("status");
        let status = DeliveryStatus::from_str(&status_text).unwrap_or_else(|_| {
            log::error!("unknown delivery status '{status_text}' for {delivery_code}");
            DeliveryStatus::Pending
        });

        let photos = sqlx::query(
            r#"
            SELECT photo_path FROM classification_photos
            WHERE delivery_code = ?1
            ORDER BY photo_number
            "#,
        )
        .bind(delivery_code)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|photo_row| photo_row.get::<String, _>("photo_path"))
        .collect();

        Ok(Some(ClassificationRecord {
            delivery_code: row.get("delivery_code"),
            status,
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            elapsed_seconds: row.get("elapsed_seconds"),
            total_detected: row.get("total_detected"),
            category_totals: parse_json_column(row.get("category_totals_json"), delivery_code),
            summary: parse_json_column(row.get("summary_json"), delivery_code),
            photos,
        }))
    }

    /// Replaces the delivery's registered photo set, keeping input order as
    /// the persisted photo number.
    pub async fn replace_photos(
        &self,
        delivery_code: &str,
        photo_paths: &[String],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM classification_photos WHERE delivery_code = ?1")
            .bind(delivery_code)
            .execute(&mut *tx)
            .await?;

        for (position, path) in photo_paths.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO classification_photos (delivery_code, photo_number, photo_path)
                VALUES (?1, ?2, ?3)
                "#,
            )
            .bind(delivery_code)
            .bind((position + 1) as i64)
            .bind(path)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn parse_json_column(raw: Option<String>, delivery_code: &str) -> Option<Value> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            log::error!("corrupt JSON column for delivery {delivery_code}: {e}");
            None
        }
    }
}
