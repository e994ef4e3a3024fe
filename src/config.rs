//! Daemon configuration
//!
//! All tunables come in through clap, each with an environment fallback so
//! the daemon can be configured without flags in containerized deployments.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Which subsystems this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// HTTP surface only.
    Serve,
    /// Conversion workers and the update-tips scheduler only.
    Worker,
    /// Everything in one process.
    All,
}

#[derive(Debug, Clone, Parser)]
#[clap(
    author,
    version,
    about = "LSIF daemon - ingests LSIF dumps and answers code-intelligence queries"
)]
pub struct Config {
    /// Which subsystems to run.
    #[clap(long, value_enum, default_value = "all")]
    pub mode: Mode,

    /// Port for the HTTP surface.
    #[clap(long, env = "HTTP_PORT", default_value_t = 3186)]
    pub http_port: u16,

    /// Port for the worker's metrics endpoint (worker mode only).
    #[clap(long, env = "WORKER_METRICS_PORT", default_value_t = 3187)]
    pub worker_metrics_port: u16,

    /// Root directory for uploads, temp files, and dump databases.
    #[clap(long, env = "LSIF_STORAGE_ROOT", default_value = "lsif-storage")]
    pub storage_root: PathBuf,

    /// Seconds between update-tips jobs.
    #[clap(long, env = "HEADS_JOB_SCHEDULE_INTERVAL", default_value_t = 30)]
    pub heads_job_schedule_interval: u64,

    /// Number of concurrent conversion workers.
    #[clap(long, env = "LSIF_WORKER_CONCURRENCY", default_value_t = 1)]
    pub worker_concurrency: usize,

    /// Capacity (entries) of the dump connection cache.
    #[clap(long, env = "CONNECTION_CACHE_CAPACITY", default_value_t = 100)]
    pub connection_cache_capacity: usize,

    /// Capacity (entries) of the decoded document cache.
    #[clap(long, env = "DOCUMENT_CACHE_CAPACITY", default_value_t = 1024)]
    pub document_cache_capacity: usize,

    /// Capacity (entries) of the decoded result-chunk cache.
    #[clap(long, env = "RESULT_CHUNK_CACHE_CAPACITY", default_value_t = 1024)]
    pub result_chunk_cache_capacity: usize,

    /// Seconds a request may run before it is cancelled.
    #[clap(long, env = "REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout: u64,

    /// Seconds a claimed job holds its lease; doubles as the job timeout.
    #[clap(long, env = "JOB_LEASE", default_value_t = 60)]
    pub job_lease: u64,

    /// Maximum attempts before a job is parked as failed.
    #[clap(long, env = "JOB_MAX_ATTEMPTS", default_value_t = 5)]
    pub job_max_attempts: u32,

    /// Log level (trace, debug, info, warn, error).
    #[clap(short, long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn heads_interval(&self) -> Duration {
        Duration::from_secs(self.heads_job_schedule_interval)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn job_lease(&self) -> Duration {
        Duration::from_secs(self.job_lease)
    }
}
