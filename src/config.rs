use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, fmt, path::PathBuf, str::FromStr, time::Duration};
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub api_url: String,
    pub token: Option<String>,
    pub database_url: String,
    pub chunk_size: u64,
    pub budget: Duration,
    pub http_timeout: Duration,
    pub max_failures: u32,
    pub max_backups: u32,

    /// When set, a local directory stands in for the remote backend.
    pub local_dir: Option<PathBuf>,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_url", &self.api_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("database_url", &self.database_url)
            .field("chunk_size", &self.chunk_size)
            .field("budget", &self.budget)
            .field("http_timeout", &self.http_timeout)
            .field("max_failures", &self.max_failures)
            .field("max_backups", &self.max_backups)
            .field("local_dir", &self.local_dir)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked backup transfer")]
pub struct Args {
    /// Backend API base URL (overrides BACKUP_TRANSFER_API_URL)
    #[arg(long)]
    pub api_url: Option<String>,

    /// Bearer token (overrides BACKUP_TRANSFER_TOKEN)
    #[arg(long)]
    pub token: Option<String>,

    /// Database URL (overrides BACKUP_TRANSFER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bytes per chunk and per multipart part (overrides BACKUP_TRANSFER_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<u64>,

    /// Seconds one tick may run, 0 for no limit (overrides BACKUP_TRANSFER_BUDGET_SECS)
    #[arg(long)]
    pub budget_secs: Option<u64>,

    /// Per-request HTTP timeout (overrides BACKUP_TRANSFER_HTTP_TIMEOUT_SECS)
    #[arg(long)]
    pub http_timeout_secs: Option<u64>,

    /// Failures tolerated before a job fails (overrides BACKUP_TRANSFER_MAX_FAILURES)
    #[arg(long)]
    pub max_failures: Option<u32>,

    /// Backups the backend keeps after an upload (overrides BACKUP_TRANSFER_MAX_BACKUPS)
    #[arg(long)]
    pub max_backups: Option<u32>,

    /// Use this directory as the backend instead of the remote API
    #[arg(long)]
    pub local_dir: Option<PathBuf>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create an upload job for an archive (and optional installer)
    Upload {
        archive: PathBuf,

        /// Side-channel file that must land alongside the archive
        #[arg(long)]
        installer: Option<PathBuf>,

        /// Backup name at the backend (defaults to the archive file name)
        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value = "remote")]
        destination: String,

        #[arg(long)]
        description: Option<String>,

        /// Keep ticking until the job finishes
        #[arg(long)]
        run: bool,
    },

    /// Create a download job for a backup
    Download {
        name: String,

        /// Directory the backup is restored into
        target_dir: PathBuf,

        #[arg(long, default_value = "remote")]
        destination: String,

        #[arg(long)]
        run: bool,
    },

    /// Run one bounded pass of a job
    Tick { job_id: Uuid },

    /// Cancel a job and release its backend session
    Cancel { job_id: Uuid },

    /// Show one job, or every job when no id is given
    Status { job_id: Option<Uuid> },

    /// List backups at the backend
    List,

    /// Delete backups at the backend
    Delete {
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Check the token and the backend quota
    Verify,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig, returning the
    /// args for the migrate flag and subcommand.
    pub fn from_env_and_args() -> Result<(Self, Args)> {
        // Parse CLI once
        let args = Args::parse();
        let cfg = Self::merge(&args)?;
        Ok((cfg, args))
    }

    /// Flag wins, environment second, default last.
    pub fn merge(args: &Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_api =
            env::var("BACKUP_TRANSFER_API_URL").unwrap_or_else(|_| "https://api.example.invalid/v1/".into());
        let env_token = env::var("BACKUP_TRANSFER_TOKEN").ok().filter(|t| !t.is_empty());
        let env_db =
            env::var("BACKUP_TRANSFER_DATABASE_URL").unwrap_or_else(|_| "sqlite://./data/transfer.db".into());
        let env_chunk = env_number("BACKUP_TRANSFER_CHUNK_SIZE", 10 * MIB)?;
        let env_budget = env_number("BACKUP_TRANSFER_BUDGET_SECS", 25)?;
        let env_timeout = env_number("BACKUP_TRANSFER_HTTP_TIMEOUT_SECS", 60)?;
        let env_failures = env_number("BACKUP_TRANSFER_MAX_FAILURES", 10)?;
        let env_backups = env_number("BACKUP_TRANSFER_MAX_BACKUPS", 5)?;

        // --- Merge ---
        let cfg = Self {
            api_url: args.api_url.clone().unwrap_or(env_api),
            token: args.token.clone().or(env_token),
            database_url: args.database_url.clone().unwrap_or(env_db),
            chunk_size: args.chunk_size.unwrap_or(env_chunk),
            budget: Duration::from_secs(args.budget_secs.unwrap_or(env_budget)),
            http_timeout: Duration::from_secs(args.http_timeout_secs.unwrap_or(env_timeout)),
            max_failures: args.max_failures.unwrap_or(env_failures),
            max_backups: args.max_backups.unwrap_or(env_backups),
            local_dir: args.local_dir.clone(),
        };

        anyhow::ensure!(cfg.chunk_size > 0, "chunk size must be positive");
        Ok(cfg)
    }
}

fn env_number<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => parse_number(name, &value),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}

fn parse_number<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .with_context(|| format!("parsing {name} value `{value}`"))
}
