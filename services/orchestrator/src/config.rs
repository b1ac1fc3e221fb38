use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Postgres when set, otherwise the file-backed store at `metastore_path`.
    pub database_url: Option<String>,
    pub metastore_path: PathBuf,
    pub data_root: PathBuf,

    pub backend_program: String,
    pub backend_args: Vec<String>,

    pub worker_concurrency: usize,
    pub lease_secs: i64,
    pub poll_every: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty());
        let metastore_path = PathBuf::from(
            std::env::var("METASTORE_PATH").unwrap_or_else(|_| "data/metastore.json".to_string()),
        );
        let data_root =
            PathBuf::from(std::env::var("DATA_ROOT").unwrap_or_else(|_| "data".to_string()));

        let backend_program =
            std::env::var("BACKEND_PROGRAM").unwrap_or_else(|_| "python3".to_string());
        let backend_args = match std::env::var("BACKEND_SCRIPT") {
            Ok(script) => vec![script],
            Err(_) => Vec::new(),
        };

        let worker_concurrency = parse_or("WORKER_CONCURRENCY", 2usize)?;
        let lease_secs = parse_or("WORKER_LEASE_SECS", 30i64)?;
        let poll_every = Duration::from_secs(parse_or("WORKER_POLL_SECS", 5u64)?);

        // fail fast
        if let Some(url) = &database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                bail!("DATABASE_URL must start with postgres:// or postgresql://");
            }
        }
        if worker_concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if lease_secs <= 0 {
            bail!("WORKER_LEASE_SECS must be positive");
        }
        if backend_program.trim().is_empty() {
            bail!("BACKEND_PROGRAM must not be empty");
        }

        Ok(Self {
            database_url,
            metastore_path,
            data_root,
            backend_program,
            backend_args,
            worker_concurrency,
            lease_secs,
            poll_every,
        })
    }

    /// Heartbeats land well inside the lease.
    pub fn heartbeat_every(&self) -> Duration {
        Duration::from_secs((self.lease_secs / 3).max(1) as u64)
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for env var {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}
