use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Root of the staging volume; carts live under `{volume_path}/{cart_id}`.
    pub volume_path: PathBuf,
    pub database_url: String,
    /// Base URL of the archive interface, without trailing slash.
    pub archive_url: String,
    /// Grace period protecting recently touched carts from eviction.
    pub lru_buffer_secs: u64,
    pub archive_timeout_secs: u64,
    /// Delay before a file still on tape is checked again.
    pub stage_retry_secs: u64,
    /// Maximum number of staging jobs running at once.
    pub workers: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Archive staging cart service")]
pub struct Args {
    /// Host to bind to (overrides CART_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CART_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Staging volume root (overrides VOLUME_PATH)
    #[arg(long)]
    pub volume_path: Option<PathBuf>,

    /// Database URL (overrides CART_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Archive interface base URL (overrides ARCHIVE_INTERFACE_URL)
    #[arg(long)]
    pub archive_url: Option<String>,

    /// Seconds a cart must sit untouched before it can be evicted (overrides LRU_BUFFER_TIME)
    #[arg(long = "lru-buffer-time")]
    pub lru_buffer_secs: Option<u64>,

    /// Timeout in seconds for archive requests (overrides CART_ARCHIVE_TIMEOUT)
    #[arg(long = "archive-timeout")]
    pub archive_timeout_secs: Option<u64>,

    /// Seconds between checks on files still being recalled from tape (overrides CART_STAGE_RETRY)
    #[arg(long = "stage-retry")]
    pub stage_retry_secs: Option<u64>,

    /// Concurrent staging jobs (overrides CART_WORKERS)
    #[arg(long)]
    pub workers: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8081,
            volume_path: PathBuf::from("./data/carts"),
            database_url: "sqlite://./data/meta/cart.db".into(),
            archive_url: "http://127.0.0.1:8080".into(),
            lru_buffer_secs: 0,
            archive_timeout_secs: 60,
            stage_retry_secs: 30,
            workers: 4,
        }
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let defaults = Self::default();

        // --- Environment fallback ---
        let env_host = env::var("CART_HOST").unwrap_or(defaults.host);
        let env_port = env_number("CART_PORT", defaults.port)?;
        let env_volume = env::var("VOLUME_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.volume_path);
        let env_db = env::var("CART_DATABASE_URL").unwrap_or(defaults.database_url);
        let env_archive = env::var("ARCHIVE_INTERFACE_URL").unwrap_or(defaults.archive_url);
        let env_lru = env_number("LRU_BUFFER_TIME", defaults.lru_buffer_secs)?;
        let env_timeout = env_number("CART_ARCHIVE_TIMEOUT", defaults.archive_timeout_secs)?;
        let env_retry = env_number("CART_STAGE_RETRY", defaults.stage_retry_secs)?;
        let env_workers = env_number("CART_WORKERS", defaults.workers)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            volume_path: args.volume_path.unwrap_or(env_volume),
            database_url: args.database_url.unwrap_or(env_db),
            archive_url: args
                .archive_url
                .unwrap_or(env_archive)
                .trim_end_matches('/')
                .to_string(),
            lru_buffer_secs: args.lru_buffer_secs.unwrap_or(env_lru),
            archive_timeout_secs: args.archive_timeout_secs.unwrap_or(env_timeout),
            stage_retry_secs: args.stage_retry_secs.unwrap_or(env_retry),
            workers: args.workers.unwrap_or(env_workers).max(1),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn lru_buffer(&self) -> Duration {
        Duration::from_secs(self.lru_buffer_secs)
    }

    pub fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.archive_timeout_secs)
    }

    pub fn stage_retry(&self) -> Duration {
        Duration::from_secs(self.stage_retry_secs)
    }
}

/// Read a numeric environment variable, falling back to `default` when unset.
fn env_number<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
