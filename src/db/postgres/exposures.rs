use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::{
    db::{
        error::DbResult,
        repos::{Cursor, ExposureRepo, truncate_to_millis},
    },
    models::{BlobReference, CreateExposure, ExposureRecord, StaleBatch},
};

pub struct PostgresExposureRepo {
    write_pool: PgPool,
    read_pool: PgPool,
}

impl PostgresExposureRepo {
    pub fn new(write_pool: PgPool, read_pool: Option<PgPool>) -> Self {
        let read_pool = read_pool.unwrap_or_else(|| write_pool.clone());
        Self {
            write_pool,
            read_pool,
        }
    }

    async fn blobs_for(
        &self,
        pool: &PgPool,
        ids: &[Uuid],
    ) -> DbResult<HashMap<Uuid, Vec<BlobReference>>> {
        let mut blobs: HashMap<Uuid, Vec<BlobReference>> = HashMap::new();
        if ids.is_empty() {
            return Ok(blobs);
        }

        let rows = sqlx::query(
            r#"
            SELECT exposure_id, bucket, object_name
            FROM exposure_blobs
            WHERE exposure_id = ANY($1)
            ORDER BY exposure_id, bucket, object_name
            "#,
        )
        .bind(ids)
        .fetch_all(pool)
        .await?;

        for row in rows {
            blobs
                .entry(row.get("exposure_id"))
                .or_default()
                .push(BlobReference {
                    bucket: row.get("bucket"),
                    object_name: row.get("object_name"),
                });
        }

        Ok(blobs)
    }
}

#[async_trait]
impl ExposureRepo for PostgresExposureRepo {
    async fn create(&self, input: CreateExposure) -> DbResult<ExposureRecord> {
        let id = input.id.unwrap_or_else(Uuid::new_v4);
        let created_at = truncate_to_millis(input.created_at);

        let mut tx = self.write_pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO exposures (id, created_at, retention_class)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(id)
        .bind(created_at)
        .bind(&input.retention_class)
        .execute(&mut *tx)
        .await?;

        for blob in &input.blobs {
            sqlx::query(
                r#"
                INSERT INTO exposure_blobs (exposure_id, bucket, object_name)
                VALUES ($1, $2, $3)
                "#,
            )
            .bind(id)
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
        // Read from the primary so a just-written record is visible
        let result = sqlx::query(
            r#"
            SELECT id, created_at, retention_class
            FROM exposures
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.write_pool)
        .await?;

        let Some(row) = result else {
            return Ok(None);
        };

        let mut blobs = self.blobs_for(&self.write_pool, &[id]).await?;
        Ok(Some(ExposureRecord {
            id: row.get("id"),
            created_at: row.get("created_at"),
            retention_class: row.get("retention_class"),
            blobs: blobs.remove(&id).unwrap_or_default(),
        }))
    }

    async fn count_by_class(&self, retention_class: &str) -> DbResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM exposures WHERE retention_class = $1")
            .bind(retention_class)
            .fetch_one(&self.read_pool)
            .await?;
        Ok(row.get::<i64, _>("count") as u64)
    }

    async fn count_blobs(&self) -> DbResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM exposure_blobs")
            .fetch_one(&self.read_pool)
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
        let fetch_limit = i64::from(limit) + 1;

        let rows = match after {
            Some(cursor) => {
                sqlx::query(
                    r#"
                    SELECT id, created_at, retention_class
                    FROM exposures
                    WHERE retention_class = $1 AND created_at < $2
                      AND (created_at, id) > ($3, $4)
                    ORDER BY created_at ASC, id ASC
                    LIMIT $5
                    "#,
                )
                .bind(retention_class)
                .bind(cutoff)
                .bind(cursor.created_at)
                .bind(cursor.id)
                .bind(fetch_limit)
                .fetch_all(&self.read_pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT id, created_at, retention_class
                    FROM exposures
                    WHERE retention_class = $1 AND created_at < $2
                    ORDER BY created_at ASC, id ASC
                    LIMIT $3
                    "#,
                )
                .bind(retention_class)
                .bind(cutoff)
                .bind(fetch_limit)
                .fetch_all(&self.read_pool)
                .await?
            }
        };

        let has_more = rows.len() as i64 > i64::from(limit);

        let mut records: Vec<ExposureRecord> = rows
            .into_iter()
            .take(limit as usize)
            .map(|row| ExposureRecord {
                id: row.get("id"),
                created_at: row.get("created_at"),
                retention_class: row.get("retention_class"),
                blobs: Vec::new(),
            })
            .collect();

        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let mut blobs = self.blobs_for(&self.read_pool, &ids).await?;
        for record in &mut records {
            record.blobs = blobs.remove(&record.id).unwrap_or_default();
        }

        Ok(StaleBatch { records, has_more })
    }

    async fn delete_records(&self, ids: &[Uuid]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.write_pool.begin().await?;

        sqlx::query("DELETE FROM exposure_blobs WHERE exposure_id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM exposures WHERE id = ANY($1)")
            .bind(ids)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(result.rows_affected())
    }
}
