use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::common::parse_uuid;
use crate::{
    db::{
        error::DbResult,
        repos::{Cursor, ExposureRepo, truncate_to_millis},
    },
    models::{BlobReference, CreateExposure, ExposureRecord, StaleBatch},
};

/// IDs bound per `IN (...)` list. Stays under SQLite's default
/// `SQLITE_LIMIT_VARIABLE_NUMBER` of 999 on older builds.
const MAX_IDS_PER_QUERY: usize = 900;

fn id_placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

pub struct SqliteExposureRepo {
    pool: SqlitePool,
}

impl SqliteExposureRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load blob references for a set of records, keyed by record ID.
    async fn blobs_for(&self, ids: &[Uuid]) -> DbResult<HashMap<Uuid, Vec<BlobReference>>> {
        let mut blobs: HashMap<Uuid, Vec<BlobReference>> = HashMap::new();
        if ids.is_empty() {
            return Ok(blobs);
        }

        for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
            let query = format!(
                r#"
                SELECT exposure_id, bucket, object_name
                FROM exposure_blobs
                WHERE exposure_id IN ({})
                ORDER BY exposure_id, bucket, object_name
                "#,
                id_placeholders(chunk.len())
            );

            let mut query_builder = sqlx::query(&query);
            for id in chunk {
                query_builder = query_builder.bind(id.to_string());
            }

            for row in query_builder.fetch_all(&self.pool).await? {
                let exposure_id = parse_uuid(&row.get::<String, _>("exposure_id"))?;
                blobs.entry(exposure_id).or_default().push(BlobReference {
                    bucket: row.get("bucket"),
                    object_name: row.get("object_name"),
                });
            }
        }

        Ok(blobs)
    }
}

#[async_trait]
impl ExposureRepo for SqliteExposureRepo {
    async fn create(&self, input: CreateExposure) -> DbResult<ExposureRecord> {
        let id = input.id.unwrap_or_else(Uuid::new_v4);
        // Truncate to milliseconds so TEXT comparison orders correctly (see cursor.rs)
        let created_at = truncate_to_millis(input.created_at);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO exposures (id, created_at, retention_class)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(created_at)
        .bind(&input.retention_class)
        .execute(&mut *tx)
        .await?;

        for blob in &input.blobs {
            sqlx::query(
                r#"
                INSERT INTO exposure_blobs (exposure_id, bucket, object_name)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(id.to_string())
            .bind(&blob.bucket)
            .bind(&blob.object_name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(ExposureRecord {
            id,
            created_at,
            retention_class: input.retention_class,
            blobs: input.blobs,
        })
    }

    async fn get_by_id(&self, id: Uuid) -> DbResult<Option<ExposureRecord>> {
        let result = sqlx::query(
            r#"
            SELECT id, created_at, retention_class
            FROM exposures
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = result else {
            return Ok(None);
        };

        let mut blobs = self.blobs_for(&[id]).await?;
        Ok(Some(ExposureRecord {
            id: parse_uuid(&row.get::<String, _>("id"))?,
            created_at: row.get("created_at"),
            retention_class: row.get("retention_class"),
            blobs: blobs.remove(&id).unwrap_or_default(),
        }))
    }

    async fn count_by_class(&self, retention_class: &str) -> DbResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM exposures WHERE retention_class = ?")
            .bind(retention_class)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") as u64)
    }

    async fn count_blobs(&self) -> DbResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM exposure_blobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") as u64)
    }

    // ==================== Retention Operations ====================

    async fn next_stale_batch(
        &self,
        retention_class: &str,
        cutoff: DateTime<Utc>,
        after: Option<&Cursor>,
        limit: u32,
    ) -> DbResult<StaleBatch> {
        let fetch_limit = i64::from(limit) + 1; // One extra row tells us whether more remain
        let cutoff = truncate_to_millis(cutoff);

        let rows = match after {
            Some(cursor) => {
                sqlx::query(
                    r#"
                    SELECT id, created_at, retention_class
                    FROM exposures
                    WHERE retention_class = ? AND created_at < ?
                      AND (created_at > ? OR (created_at = ? AND id > ?))
                    ORDER BY created_at ASC, id ASC
                    LIMIT ?
                    "#,
                )
                .bind(retention_class)
                .bind(cutoff)
                .bind(cursor.created_at)
                .bind(cursor.created_at)
                .bind(cursor.id.to_string())
                .bind(fetch_limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, created_at, retention_class
                    FROM exposures
                    WHERE retention_class = ? AND created_at < ?
                    ORDER BY created_at ASC, id ASC
                    LIMIT ?
                    "#,
                )
                .bind(retention_class)
                .bind(cutoff)
                .bind(fetch_limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let has_more = rows.len() as i64 > i64::from(limit);

        let mut records = rows
            .into_iter()
            .take(limit as usize)
            .map(|row| {
                Ok(ExposureRecord {
                    id: parse_uuid(&row.get::<String, _>("id"))?,
                    created_at: row.get("created_at"),
                    retention_class: row.get("retention_class"),
                    blobs: Vec::new(),
                })
            })
            .collect::<DbResult<Vec<_>>>()?;

        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let mut blobs = self.blobs_for(&ids).await?;
        for record in &mut records {
            record.blobs = blobs.remove(&record.id).unwrap_or_default();
        }

        Ok(StaleBatch { records, has_more })
    }

    async fn delete_records(&self, ids: &[Uuid]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        // All chunks share one transaction so a batch is removed all-or-none.
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0;

        for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
            let placeholders = id_placeholders(chunk.len());

            let blob_query = format!(
                "DELETE FROM exposure_blobs WHERE exposure_id IN ({})",
                placeholders
            );
            let mut q = sqlx::query(&blob_query);
            for id in chunk {
                q = q.bind(id.to_string());
            }
            q.execute(&mut *tx).await?;

            let record_query = format!("DELETE FROM exposures WHERE id IN ({})", placeholders);
            let mut q = sqlx::query(&record_query);
            for id in chunk {
                q = q.bind(id.to_string());
            }
            deleted += q.execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;

        Ok(deleted)
    }
}
