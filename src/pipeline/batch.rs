use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    llm::GenerationError,
    pipeline::{retry::RetryingClient, tracker::BatchTracker},
    spreadsheet::PromptRow,
    store::{ResultStore, RowResult},
};

#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Completed rows between cooldowns.
    pub batch_size: usize,
    pub cooldown: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 20,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Why a batch stopped early. Rows completed before the failure stay persisted.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("generation failed for sheet row {row} after {completed} completed rows")]
    Generation {
        row: usize,
        completed: usize,
        #[source]
        source: GenerationError,
    },
    #[error("failed to persist sheet row {row} after {completed} completed rows")]
    Persistence {
        row: usize,
        completed: usize,
        #[source]
        source: anyhow::Error,
    },
}

impl BatchError {
    pub fn completed(&self) -> usize {
        match self {
            BatchError::Generation { completed, .. }
            | BatchError::Persistence { completed, .. } => *completed,
        }
    }

    pub fn row(&self) -> usize {
        match self {
            BatchError::Generation { row, .. } | BatchError::Persistence { row, .. } => *row,
        }
    }
}

/// Sequential worker that turns prompt rows into persisted articles.
pub struct BatchRunner {
    client: RetryingClient,
    store: Arc<dyn ResultStore>,
    settings: BatchSettings,
}

impl BatchRunner {
    pub fn new(
        client: RetryingClient,
        store: Arc<dyn ResultStore>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            client,
            store,
            settings,
        }
    }

    /// Process `rows` strictly in order, persisting each article before moving on.
    ///
    /// The first unrecoverable error stops the batch; nothing is written for the failing
    /// row and later rows are never attempted.
    pub async fn run_batch(
        &self,
        job_id: Uuid,
        rows: &[PromptRow],
        tracker: &BatchTracker,
    ) -> Result<Vec<RowResult>, BatchError> {
        let total = rows.len();
        let mut results = Vec::with_capacity(total);

        info!(%job_id, total, "content batch started");

        for (idx, row) in rows.iter().enumerate() {
            let completed = results.len();

            let completion = self.client.generate(&row.prompt).await.map_err(|source| {
                BatchError::Generation {
                    row: row.row_number,
                    completed,
                    source,
                }
            })?;

            let saved = self
                .store
                .append_row_result(job_id, row, &completion.text)
                .await
                .map_err(|source| BatchError::Persistence {
                    row: row.row_number,
                    completed,
                    source,
                })?;

            results.push(saved);
            tracker.record_row(job_id).await;
            info!(
                %job_id,
                row = row.row_number,
                done = results.len(),
                total,
                "content generated"
            );

            let remaining = total - (idx + 1);
            if self.settings.batch_size > 0
                && results.len() % self.settings.batch_size == 0
                && remaining > 0
            {
                warn!(
                    %job_id,
                    cooldown_secs = self.settings.cooldown.as_secs(),
                    remaining,
                    "sub-batch finished, cooling down"
                );
                sleep(self.settings.cooldown).await;
            }
        }

        info!(%job_id, total, "content batch finished");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::{
        pipeline::retry::{
            RetryPolicy,
            testing::{Reply, ScriptedGenerator, open_limiter},
        },
        store::{NewJob, memory::MemoryStore},
    };

    struct Harness {
        generator: Arc<ScriptedGenerator>,
        store: Arc<MemoryStore>,
        runner: BatchRunner,
        tracker: BatchTracker,
        job_id: Uuid,
    }

    async fn harness(generator: ScriptedGenerator) -> Harness {
        let generator = Arc::new(generator);
        let store = Arc::new(MemoryStore::default());
        let client = RetryingClient::new(
            generator.clone(),
            open_limiter(),
            RetryPolicy::default(),
            0,
        );
        let runner = BatchRunner::new(client, store.clone(), BatchSettings::default());
        let job = store
            .create_job(NewJob {
                source_file_name: "topics.xlsx".into(),
                created_by: Uuid::new_v4(),
            })
            .await
            .unwrap();
        let tracker = BatchTracker::default();
        tracker.start(job.id, 0).await;

        Harness {
            generator,
            store,
            runner,
            tracker,
            job_id: job.id,
        }
    }

    fn rows(count: usize) -> Vec<PromptRow> {
        (1..=count)
            .map(|n| PromptRow {
                row_number: n,
                topic: format!("T{n}"),
                prompt: format!("P{n}"),
            })
            .collect()
    }

    fn triples(results: &[RowResult]) -> Vec<(String, String, String)> {
        results
            .iter()
            .map(|r| (r.topic.clone(), r.prompt.clone(), r.article.clone()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn generates_each_row_in_order() {
        let h = harness(ScriptedGenerator::new()).await;

        let results = h.runner.run_batch(h.job_id, &rows(2), &h.tracker).await.unwrap();

        let expected = vec![
            ("T1".to_string(), "P1".to_string(), "A:P1".to_string()),
            ("T2".to_string(), "P2".to_string(), "A:P2".to_string()),
        ];
        assert_eq!(triples(&results), expected);
        assert_eq!(triples(&h.store.list_row_results(h.job_id).await.unwrap()), expected);
        assert_eq!(h.tracker.get(h.job_id).await.unwrap().completed_rows, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_input_produces_nothing() {
        let h = harness(ScriptedGenerator::new()).await;

        let results = h.runner.run_batch(h.job_id, &[], &h.tracker).await.unwrap();

        assert!(results.is_empty());
        assert_eq!(h.generator.call_count(), 0);
        assert!(h.store.rows().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_keeps_completed_prefix() {
        let h = harness(ScriptedGenerator::new().failing_on("P2")).await;

        let err = h
            .runner
            .run_batch(h.job_id, &rows(4), &h.tracker)
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::Generation { row: 2, completed: 1, .. }));
        let stored = h.store.list_row_results(h.job_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].topic, "T1");

        let prompts: Vec<_> = h.generator.calls().into_iter().map(|(p, _)| p).collect();
        assert_eq!(prompts, vec!["P1", "P2", "P2", "P2", "P2", "P2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn kth_failure_leaves_k_minus_one_results() {
        for k in 1..=5 {
            let h = harness(ScriptedGenerator::new().failing_on(&format!("P{k}"))).await;

            let err = h
                .runner
                .run_batch(h.job_id, &rows(5), &h.tracker)
                .await
                .unwrap_err();

            assert_eq!(err.completed(), k - 1);
            assert_eq!(err.row(), k);
            let stored = h.store.list_row_results(h.job_id).await.unwrap();
            let topics: Vec<_> = stored.iter().map(|r| r.topic.clone()).collect();
            let expected: Vec<_> = (1..k).map(|n| format!("T{n}")).collect();
            assert_eq!(topics, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_halts_batch() {
        let h = harness(ScriptedGenerator::new()).await;
        h.store.reject_row(3);

        let err = h
            .runner
            .run_batch(h.job_id, &rows(5), &h.tracker)
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::Persistence { row: 3, completed: 2, .. }));
        assert_eq!(h.store.rows().len(), 2);
        assert_eq!(h.generator.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_rows_still_complete() {
        let generator = ScriptedGenerator::new()
            .scripted_for("P2", std::iter::repeat_n(Reply::Throttle(None), 9));
        let h = harness(generator).await;

        let results = h.runner.run_batch(h.job_id, &rows(3), &h.tracker).await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(h.generator.call_count(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn cools_down_between_sub_batches_but_not_after_last_row() {
        let h = harness(ScriptedGenerator::new()).await;
        let started = Instant::now();

        let results = h.runner.run_batch(h.job_id, &rows(41), &h.tracker).await.unwrap();
        assert_eq!(results.len(), 41);

        let calls = h.generator.calls();
        let gap = |a: usize, b: usize| calls[b].1.duration_since(calls[a].1);
        assert!(gap(19, 20) >= Duration::from_secs(60));
        assert!(gap(39, 40) >= Duration::from_secs(60));
        assert!(gap(0, 19) < Duration::from_secs(1));
        assert!(gap(20, 39) < Duration::from_secs(1));

        let elapsed = Instant::now().duration_since(started);
        assert!(elapsed >= Duration::from_secs(120) && elapsed < Duration::from_secs(121));
    }

    #[tokio::test(start_paused = true)]
    async fn exact_multiple_of_batch_size_skips_trailing_cooldown() {
        let h = harness(ScriptedGenerator::new()).await;
        let started = Instant::now();

        h.runner.run_batch(h.job_id, &rows(40), &h.tracker).await.unwrap();

        let elapsed = Instant::now().duration_since(started);
        assert!(elapsed >= Duration::from_secs(60) && elapsed < Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_prompt_is_passed_through() {
        let h = harness(ScriptedGenerator::new()).await;
        let input = vec![PromptRow {
            row_number: 1,
            topic: "Only topic".into(),
            prompt: String::new(),
        }];

        let results = h.runner.run_batch(h.job_id, &input, &h.tracker).await.unwrap();

        assert_eq!(h.generator.calls()[0].0, "");
        assert_eq!(results[0].article, "A:");
    }
}
