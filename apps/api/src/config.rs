use std::time::Duration;

use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Externally reachable base URL of this service; the PDF renderer fetches
    /// resume data back through it.
    pub public_base_url: String,
    pub asr: AsrConfig,
    pub workflow_api_url: String,
    pub renderer_url: String,
    pub internal_api_token: String,
    pub uploads_dir: String,
    pub workers: WorkerConfig,
    pub port: u16,
    pub rust_log: String,
}

#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub base_url: String,
    pub app_id: String,
    pub access_token: String,
    pub timeout: Duration,
}

/// Background worker and scheduler tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub task_workers: usize,
    pub queue_capacity: usize,
    pub rescan_interval: Duration,
    pub dispatch_grace: Duration,
    pub sweep_interval: Duration,
    pub asr_refresh_interval: Duration,
    pub renderer_timeout: Duration,
    pub workflow_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            public_base_url: require_env("PUBLIC_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            asr: AsrConfig {
                base_url: require_env("ASR_BASE_URL")?
                    .trim_end_matches('/')
                    .to_string(),
                app_id: require_env("ASR_APP_ID")?,
                access_token: require_env("ASR_ACCESS_TOKEN")?,
                timeout: Duration::from_secs(env_or("ASR_TIMEOUT_SECS", 30)?),
            },
            workflow_api_url: require_env("WORKFLOW_API_URL")?,
            renderer_url: require_env("RENDERER_URL")?,
            internal_api_token: require_env("INTERNAL_API_TOKEN")?,
            uploads_dir: std::env::var("UPLOADS_DIR").unwrap_or_else(|_| "uploads".to_string()),
            workers: WorkerConfig {
                task_workers: env_or("TASK_WORKERS", 4)?,
                queue_capacity: env_or("TASK_QUEUE_CAPACITY", 256)?,
                rescan_interval: Duration::from_secs(env_or("TASK_RESCAN_SECS", 30)?),
                dispatch_grace: Duration::from_secs(env_or("TASK_DISPATCH_GRACE_SECS", 60)?),
                sweep_interval: Duration::from_secs(env_or("SWEEP_INTERVAL_SECS", 300)?),
                asr_refresh_interval: Duration::from_secs(env_or("ASR_REFRESH_SECS", 15)?),
                renderer_timeout: Duration::from_secs(env_or("RENDERER_TIMEOUT_SECS", 120)?),
                workflow_timeout: Duration::from_secs(env_or("WORKFLOW_TIMEOUT_SECS", 300)?),
            },
            port: env_or("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

/// Reads an optional numeric variable, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    /// Fixed configuration for router and service tests.
    pub fn for_tests() -> Self {
        Config {
            database_url: "postgres://localhost/hirebase_test".to_string(),
            public_base_url: "http://localhost:8080".to_string(),
            asr: AsrConfig {
                base_url: "http://asr.invalid".to_string(),
                app_id: "test-app".to_string(),
                access_token: "test-token".to_string(),
                timeout: Duration::from_secs(1),
            },
            workflow_api_url: "http://workflow.invalid/v1/workflows/run".to_string(),
            renderer_url: "http://renderer.invalid/render".to_string(),
            internal_api_token: "internal-secret".to_string(),
            uploads_dir: "uploads".to_string(),
            workers: WorkerConfig {
                task_workers: 1,
                queue_capacity: 8,
                rescan_interval: Duration::from_secs(30),
                dispatch_grace: Duration::from_secs(60),
                sweep_interval: Duration::from_secs(300),
                asr_refresh_interval: Duration::from_secs(15),
                renderer_timeout: Duration::from_secs(1),
                workflow_timeout: Duration::from_secs(1),
            },
            port: 8080,
            rust_log: "info".to_string(),
        }
    }
}
