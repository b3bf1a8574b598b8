use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub state: BatchState,
    pub total_rows: usize,
    pub completed_rows: usize,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Process-local progress of running and recently finished batches.
///
/// Jobs themselves stay immutable; this is the only place a batch outcome is kept.
#[derive(Clone, Default)]
pub struct BatchTracker {
    inner: Arc<RwLock<HashMap<Uuid, BatchStatus>>>,
}

impl BatchTracker {
    pub async fn start(&self, job_id: Uuid, total_rows: usize) {
        let status = BatchStatus {
            state: BatchState::Running,
            total_rows,
            completed_rows: 0,
            error_message: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.inner.write().await.insert(job_id, status);
    }

    pub async fn record_row(&self, job_id: Uuid) {
        if let Some(status) = self.inner.write().await.get_mut(&job_id) {
            status.completed_rows += 1;
        }
    }

    pub async fn complete(&self, job_id: Uuid) {
        self.finish(job_id, BatchState::Completed, None).await;
    }

    pub async fn fail(&self, job_id: Uuid, message: impl Into<String>) {
        self.finish(job_id, BatchState::Failed, Some(message.into()))
            .await;
    }

    async fn finish(&self, job_id: Uuid, state: BatchState, error_message: Option<String>) {
        if let Some(status) = self.inner.write().await.get_mut(&job_id) {
            status.state = state;
            status.error_message = error_message;
            status.finished_at = Some(Utc::now());
        }
    }

    pub async fn get(&self, job_id: Uuid) -> Option<BatchStatus> {
        self.inner.read().await.get(&job_id).cloned()
    }

    /// Drop finished entries older than `retention`. Running batches are never pruned.
    pub async fn prune_finished(&self, retention: Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let mut guard = self.inner.write().await;
        let before = guard.len();
        guard.retain(|_, status| status.finished_at.is_none_or(|at| at > cutoff));
        before - guard.len()
    }
}
