use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Worker configuration, loaded from environment variables or built in code.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker ID recorded on enqueued requests and posted results
    pub worker_id: String,
    /// How often interval triggers are evaluated
    pub tick_interval: Duration,
    /// How long to wait when the queue is empty
    pub poll_interval: Duration,
    /// Interval triggers evaluated concurrently per tick
    pub tick_concurrency: usize,
    /// Store writes in flight while re-registering a type's triggers
    pub type_trigger_concurrency: usize,
    /// JSON array of contracts replaced into the store at startup
    pub seed_path: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            tick_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            tick_concurrency: 5,
            type_trigger_concurrency: 3,
            seed_path: None,
        }
    }
}

fn millis(name: &str, default: &str) -> Result<Duration> {
    let value: u64 = env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("{} must be a valid number", name))?;
    Ok(Duration::from_millis(value))
}

fn count(name: &str, default: &str) -> Result<usize> {
    let value: usize = env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("{} must be a valid number", name))?;
    anyhow::ensure!(value > 0, "{} must be at least 1", name);
    Ok(value)
}

impl WorkerConfig {
    /// Create a config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Self::default();
        Ok(Self {
            worker_id: env::var("REACTOR_WORKER_ID").unwrap_or(defaults.worker_id),
            tick_interval: millis("REACTOR_TICK_INTERVAL_MS", "1000")?,
            poll_interval: millis("REACTOR_POLL_INTERVAL_MS", "100")?,
            tick_concurrency: count("REACTOR_TICK_CONCURRENCY", "5")?,
            type_trigger_concurrency: count("REACTOR_TYPE_TRIGGER_CONCURRENCY", "3")?,
            seed_path: env::var("REACTOR_SEED_PATH").ok().map(PathBuf::from),
        })
    }
}
