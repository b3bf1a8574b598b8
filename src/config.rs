use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, anyhow, bail};

use crate::pipeline::{BatchSettings, RateLimits, RetryPolicy};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MODEL: &str = "openai/gpt-3.5-turbo";
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 1_000;
const DEFAULT_RATE_LIMIT_RPM: u32 = 60;
const DEFAULT_RATE_LIMIT_TPM: u64 = 90_000;
const DEFAULT_BATCH_SIZE: usize = 20;
const DEFAULT_BATCH_COOLDOWN_SECS: u64 = 60;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 1_000;
const DEFAULT_THROTTLE_WAIT_MS: u64 = 1_000;
const DEFAULT_FILE_RETENTION_SECS: u64 = 60;
const DEFAULT_STORAGE_ROOT: &str = "storage/content";

/// Runtime settings, read once at startup from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    pub port: u16,
    pub generation_model: String,
    pub max_output_tokens: u32,
    pub rate_limits: RateLimits,
    pub batch: BatchSettings,
    pub retry: RetryPolicy,
    pub file_retention: Duration,
    pub storage_root: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL env var is missing")?;

        let settings = Self {
            database_url,
            port: parse_or(&lookup, "PORT", DEFAULT_PORT)?,
            generation_model: lookup("GENERATION_MODEL")
                .filter(|model| !model.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_output_tokens: parse_or(&lookup, "MAX_OUTPUT_TOKENS", DEFAULT_MAX_OUTPUT_TOKENS)?,
            rate_limits: RateLimits {
                max_rpm: parse_or(&lookup, "RATE_LIMIT_RPM", DEFAULT_RATE_LIMIT_RPM)?,
                max_tpm: parse_or(&lookup, "RATE_LIMIT_TPM", DEFAULT_RATE_LIMIT_TPM)?,
            },
            batch: BatchSettings {
                batch_size: parse_or(&lookup, "BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
                cooldown: Duration::from_secs(parse_or(
                    &lookup,
                    "BATCH_COOLDOWN_SECS",
                    DEFAULT_BATCH_COOLDOWN_SECS,
                )?),
            },
            retry: RetryPolicy {
                max_attempts: parse_or(&lookup, "RETRY_MAX_ATTEMPTS", DEFAULT_RETRY_MAX_ATTEMPTS)?,
                initial_delay: Duration::from_millis(parse_or(
                    &lookup,
                    "RETRY_INITIAL_DELAY_MS",
                    DEFAULT_RETRY_INITIAL_DELAY_MS,
                )?),
                throttle_wait: Duration::from_millis(parse_or(
                    &lookup,
                    "THROTTLE_DEFAULT_WAIT_MS",
                    DEFAULT_THROTTLE_WAIT_MS,
                )?),
            },
            file_retention: Duration::from_secs(parse_or(
                &lookup,
                "FILE_RETENTION_SECS",
                DEFAULT_FILE_RETENTION_SECS,
            )?),
            storage_root: lookup("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT)),
        };

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.rate_limits.max_rpm == 0 {
            bail!("RATE_LIMIT_RPM must be greater than 0");
        }
        if self.rate_limits.max_tpm == 0 {
            bail!("RATE_LIMIT_TPM must be greater than 0");
        }
        if self.batch.batch_size == 0 {
            bail!("BATCH_SIZE must be greater than 0");
        }
        if self.retry.max_attempts == 0 {
            bail!("RETRY_MAX_ATTEMPTS must be greater than 0");
        }
        if self.max_output_tokens == 0 {
            bail!("MAX_OUTPUT_TOKENS must be greater than 0");
        }
        Ok(())
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.storage_root.join("uploads")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.storage_root.join("downloads")
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("invalid value for {key} ({raw:?}): {err}")),
        _ => Ok(default),
    }
}
