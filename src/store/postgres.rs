use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{Job, NewJob, ResultStore, RowResult};
use crate::spreadsheet::PromptRow;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for PgStore {
    async fn create_job(&self, job: NewJob) -> Result<Job> {
        sqlx::query_as::<_, Job>(
            "INSERT INTO content_jobs (id, source_file_name, created_by)
             VALUES ($1, $2, $3)
             RETURNING id, source_file_name, created_by, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(&job.source_file_name)
        .bind(job.created_by)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert content job")
    }

    async fn find_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        sqlx::query_as::<_, Job>(
            "SELECT id, source_file_name, created_by, created_at FROM content_jobs WHERE id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load content job")
    }

    async fn append_row_result(
        &self,
        job_id: Uuid,
        row: &PromptRow,
        article: &str,
    ) -> Result<RowResult> {
        let row_number = i32::try_from(row.row_number).context("row number out of range")?;

        sqlx::query_as::<_, RowResult>(
            "INSERT INTO content_rows (id, job_id, row_number, topic, prompt, article)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, job_id, row_number, topic, prompt, article, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(row_number)
        .bind(&row.topic)
        .bind(&row.prompt)
        .bind(article)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to insert result for row {}", row.row_number))
    }

    async fn list_row_results(&self, job_id: Uuid) -> Result<Vec<RowResult>> {
        sqlx::query_as::<_, RowResult>(
            "SELECT id, job_id, row_number, topic, prompt, article, created_at
             FROM content_rows WHERE job_id = $1
             ORDER BY created_at, row_number",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load content rows")
    }
}
