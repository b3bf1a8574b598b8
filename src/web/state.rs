use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;
use uuid::Uuid;

use crate::{
    config::Settings,
    llm::LlmClient,
    pipeline::{BatchRunner, BatchTracker, RateLimiter, RetryingClient},
    store::{PgStore, ResultStore},
};

#[derive(Clone)]
pub struct AppState {
    pool: PgPool,
    settings: Arc<Settings>,
    store: Arc<dyn ResultStore>,
    runner: Arc<BatchRunner>,
    tracker: BatchTracker,
}

impl AppState {
    pub async fn new(settings: Settings) -> Result<Self> {
        let llm_client = LlmClient::from_env(&settings.generation_model, settings.max_output_tokens)
            .context("failed to initialize LLM client")?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&settings.database_url)
            .await
            .context("failed to connect to Postgres")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run database migrations")?;

        let store: Arc<dyn ResultStore> = Arc::new(PgStore::new(pool.clone()));

        // One limiter for the whole process: every batch shares the provider quota.
        let limiter = Arc::new(RateLimiter::new(settings.rate_limits));
        let model = llm_client.model().to_string();
        let client = RetryingClient::new(
            Arc::new(llm_client),
            limiter,
            settings.retry.clone(),
            u64::from(settings.max_output_tokens),
        );
        let runner = Arc::new(BatchRunner::new(
            client,
            store.clone(),
            settings.batch.clone(),
        ));

        info!(
            %model,
            max_rpm = settings.rate_limits.max_rpm,
            max_tpm = settings.rate_limits.max_tpm,
            batch_size = settings.batch.batch_size,
            "content pipeline ready"
        );

        Ok(Self {
            pool,
            settings: Arc::new(settings),
            store,
            runner,
            tracker: BatchTracker::default(),
        })
    }

    pub async fn ensure_seed_admin(&self) -> Result<()> {
        let has_admin: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE is_admin = TRUE)")
                .fetch_one(&self.pool)
                .await
                .context("failed to verify admin presence")?;

        if !has_admin {
            let password_hash = crate::web::auth::hash_password("change-me")
                .map_err(|err| anyhow!("failed to hash seed admin password: {err}"))?;

            sqlx::query(
                "INSERT INTO users (id, username, password_hash, is_admin) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind("demo-admin")
            .bind(password_hash)
            .bind(true)
            .execute(&self.pool)
            .await
            .context("failed to insert seed admin user")?;

            info!(
                username = "demo-admin",
                "seeded default admin user with password 'change-me', update it promptly"
            );
        }

        Ok(())
    }

    pub fn pool_ref(&self) -> &PgPool {
        &self.pool
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> Arc<dyn ResultStore> {
        self.store.clone()
    }

    pub fn batch_runner(&self) -> Arc<BatchRunner> {
        self.runner.clone()
    }

    pub fn tracker(&self) -> &BatchTracker {
        &self.tracker
    }
}
