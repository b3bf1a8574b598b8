use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::spreadsheet::PromptRow;

mod postgres;

#[cfg(test)]
pub(crate) mod memory;

pub use postgres::PgStore;

/// One upload-triggered batch of generation work.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub source_file_name: String,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub source_file_name: String,
    pub created_by: Uuid,
}

/// A completed row. Only ever written after its article exists.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RowResult {
    pub id: Uuid,
    pub job_id: Uuid,
    pub row_number: i32,
    pub topic: String,
    pub prompt: String,
    pub article: String,
    pub created_at: DateTime<Utc>,
}

/// Durable record store for jobs and their row results.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn create_job(&self, job: NewJob) -> Result<Job>;

    async fn find_job(&self, job_id: Uuid) -> Result<Option<Job>>;

    async fn append_row_result(
        &self,
        job_id: Uuid,
        row: &PromptRow,
        article: &str,
    ) -> Result<RowResult>;

    /// Results in creation order, oldest first.
    async fn list_row_results(&self, job_id: Uuid) -> Result<Vec<RowResult>>;
}
