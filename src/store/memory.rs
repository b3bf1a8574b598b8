use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{Job, NewJob, ResultStore, RowResult};
use crate::spreadsheet::PromptRow;

/// In-process store for tests. Appends keep insertion order.
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<Vec<Job>>,
    rows: Mutex<Vec<RowResult>>,
    reject_row: Mutex<Option<usize>>,
}

impl MemoryStore {
    /// Make appends for the given sheet row fail.
    pub fn reject_row(&self, row_number: usize) {
        *self.reject_row.lock().unwrap() = Some(row_number);
    }

    pub fn rows(&self) -> Vec<RowResult> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn create_job(&self, job: NewJob) -> Result<Job> {
        let job = Job {
            id: Uuid::new_v4(),
            source_file_name: job.source_file_name,
            created_by: job.created_by,
            created_at: Utc::now(),
        };
        self.jobs.lock().unwrap().push(job.clone());
        Ok(job)
    }

    async fn find_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|job| job.id == job_id)
            .cloned())
    }

    async fn append_row_result(
        &self,
        job_id: Uuid,
        row: &PromptRow,
        article: &str,
    ) -> Result<RowResult> {
        if *self.reject_row.lock().unwrap() == Some(row.row_number) {
            bail!("write rejected for row {}", row.row_number);
        }
        let result = RowResult {
            id: Uuid::new_v4(),
            job_id,
            row_number: row.row_number as i32,
            topic: row.topic.clone(),
            prompt: row.prompt.clone(),
            article: article.to_string(),
            created_at: Utc::now(),
        };
        self.rows.lock().unwrap().push(result.clone());
        Ok(result)
    }

    async fn list_row_results(&self, job_id: Uuid) -> Result<Vec<RowResult>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.job_id == job_id)
            .cloned()
            .collect())
    }
}
